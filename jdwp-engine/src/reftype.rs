// ReferenceType command implementations

use crate::commands::{command_sets, error_codes, reference_type_commands};
use crate::connection::JdwpConnection;
use crate::protocol::{CommandPacket, JdwpResult};
use crate::reader::read_string;
use crate::types::ReferenceTypeId;
use bytes::BufMut;

impl JdwpConnection {
    /// Source file name of a class (ReferenceType.SourceFile)
    ///
    /// Classes compiled without source information yield `None`.
    pub async fn get_source_file(&mut self, ref_type: ReferenceTypeId) -> JdwpResult<Option<String>> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(
            id,
            command_sets::REFERENCE_TYPE,
            reference_type_commands::SOURCE_FILE,
        );
        packet.data.put_u64(ref_type);

        let reply = self.send_command(packet).await?;
        if reply.error_code == error_codes::ABSENT_INFORMATION {
            return Ok(None);
        }
        reply.check_error()?;

        let mut data = reply.data();
        Ok(Some(read_string(&mut data)?))
    }
}
