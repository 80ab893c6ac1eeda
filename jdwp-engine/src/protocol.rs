// JDWP protocol definitions, packet framing and the engine error taxonomy
//
// Reference: https://docs.oracle.com/javase/8/docs/platform/jpda/jdwp/jdwp-protocol.html

use crate::eventrequest::RequestId;
use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use thiserror::Error;

// JDWP uses big-endian (network byte order) for all multi-byte values

pub type JdwpResult<T> = Result<T, JdwpError>;

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected wire data. Ends the session.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid handshake")]
    InvalidHandshake,

    #[error("JDWP error code {0}: {1}")]
    JdwpErrorCode(u16, String),

    #[error("Connection closed")]
    ConnectionClosed,

    /// The event kind is unknown or cannot be requested through this path.
    #[error("Invalid event kind: {0}")]
    InvalidKind(String),

    #[error("Request {0} is enabled; disable it before adding filters")]
    RequestAlreadyEnabled(RequestId),

    #[error("Unknown event request {0}")]
    UnknownRequest(RequestId),

    /// A frame or monitor handle outlived the suspension it was fetched in.
    #[error("Stale handle for thread {thread:#x}: fetched in epoch {fetched}, thread is now in epoch {current}")]
    StaleHandle { thread: u64, fetched: u64, current: u64 },

    #[error("Imbalanced resume: {0}")]
    ImbalancedResume(String),

    #[error("Incompatible thread state: {0}")]
    IncompatibleState(String),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl JdwpError {
    /// Errors after which the session cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JdwpError::ProtocolViolation(_)
                | JdwpError::ConnectionClosed
                | JdwpError::InvalidHandshake
                | JdwpError::Io(_)
        )
    }
}

// JDWP handshake string
pub const JDWP_HANDSHAKE: &[u8] = b"JDWP-Handshake";

// Packet structure:
// length (4 bytes) - includes header
// id (4 bytes)
// flags (1 byte) - 0x00 = command, 0x80 = reply
// [Command packet: command set (1 byte) + command (1 byte)]
// [Reply packet: error code (2 bytes)]
// data (variable)

pub const HEADER_SIZE: usize = 11;
pub const REPLY_FLAG: u8 = 0x80;

#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub id: u32,
    pub command_set: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReplyPacket {
    pub id: u32,
    pub error_code: u16,
    pub data: Vec<u8>,
}

impl CommandPacket {
    pub fn new(id: u32, command_set: u8, command: u8) -> Self {
        Self {
            id,
            command_set,
            command,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.data.len();
        let mut buf = BytesMut::with_capacity(length);

        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(0x00); // command flag
        buf.put_u8(self.command_set);
        buf.put_u8(self.command);
        buf.put_slice(&self.data);

        buf.to_vec()
    }

    /// Decode a full command packet (header included), as sent by the VM for events
    pub fn decode(mut buf: &[u8]) -> JdwpResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(JdwpError::ProtocolViolation(
                "Command packet too short".to_string(),
            ));
        }

        let _length = buf.get_u32();
        let id = buf.get_u32();
        let flags = buf.get_u8();

        if flags == REPLY_FLAG {
            return Err(JdwpError::ProtocolViolation(format!(
                "Expected command packet, got reply flag for id={}",
                id
            )));
        }

        let command_set = buf.get_u8();
        let command = buf.get_u8();

        Ok(Self {
            id,
            command_set,
            command,
            data: buf.to_vec(),
        })
    }
}

impl ReplyPacket {
    pub fn new(id: u32, error_code: u16) -> Self {
        Self {
            id,
            error_code,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.data.len();
        let mut buf = BytesMut::with_capacity(length);

        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(REPLY_FLAG);
        buf.put_u16(self.error_code);
        buf.put_slice(&self.data);

        buf.to_vec()
    }

    pub fn decode(mut buf: &[u8]) -> JdwpResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(JdwpError::ProtocolViolation(
                "Reply packet too short".to_string(),
            ));
        }

        let _length = buf.get_u32();
        let id = buf.get_u32();
        let flags = buf.get_u8();

        if flags != REPLY_FLAG {
            return Err(JdwpError::ProtocolViolation(format!(
                "Invalid reply flag: {:#x}",
                flags
            )));
        }

        let error_code = buf.get_u16();
        let data = buf.to_vec();

        Ok(Self {
            id,
            error_code,
            data,
        })
    }

    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }

    pub fn check_error(&self) -> JdwpResult<()> {
        if self.is_error() {
            Err(JdwpError::JdwpErrorCode(
                self.error_code,
                self.error_message().to_string(),
            ))
        } else {
            Ok(())
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn error_message(&self) -> &'static str {
        match self.error_code {
            0 => "NONE",
            10 => "INVALID_THREAD",
            13 => "THREAD_NOT_SUSPENDED",
            14 => "THREAD_SUSPENDED",
            20 => "INVALID_OBJECT",
            21 => "INVALID_CLASS",
            23 => "INVALID_METHODID",
            24 => "INVALID_LOCATION",
            25 => "INVALID_FIELDID",
            30 => "INVALID_FRAMEID",
            31 => "NO_MORE_FRAMES",
            32 => "OPAQUE_FRAME",
            35 => "INVALID_SLOT",
            41 => "NOT_FOUND",
            50 => "INVALID_MONITOR",
            99 => "NOT_IMPLEMENTED",
            100 => "NULL_POINTER",
            101 => "ABSENT_INFORMATION",
            102 => "INVALID_EVENT_TYPE",
            103 => "ILLEGAL_ARGUMENT",
            112 => "VM_DEAD",
            113 => "INTERNAL",
            115 => "UNATTACHED_THREAD",
            500 => "INVALID_TAG",
            512 => "INVALID_COUNT",
            _ => "UNKNOWN_ERROR",
        }
    }
}
