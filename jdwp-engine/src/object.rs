// ObjectReference command implementations

use crate::commands::{command_sets, object_reference_commands};
use crate::connection::JdwpConnection;
use crate::protocol::{CommandPacket, JdwpResult};
use crate::reader::{read_u64, read_u8};
use crate::types::{ObjectId, ReferenceTypeId};
use bytes::BufMut;

impl JdwpConnection {
    /// Runtime class of an object (ObjectReference.ReferenceType)
    pub async fn get_object_reference_type(
        &mut self,
        object_id: ObjectId,
    ) -> JdwpResult<ReferenceTypeId> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(
            id,
            command_sets::OBJECT_REFERENCE,
            object_reference_commands::REFERENCE_TYPE,
        );
        packet.data.put_u64(object_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        let _type_tag = read_u8(&mut data)?;
        read_u64(&mut data)
    }
}
