// Engine configuration
//
// Every field has a default, so an empty JSON object is a valid config.

use crate::protocol::{JdwpError, JdwpResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Buffered event batches between the socket reader and the event pump
    pub event_channel_capacity: usize,
    /// Buffered outgoing commands
    pub command_channel_capacity: usize,
    /// Largest packet accepted from the VM, in bytes
    pub max_packet_size: usize,
    /// Default timeout for `EventStream::wait_for`
    pub default_wait_timeout_ms: u64,
    /// Event sets buffered per `EventStream` subscriber
    pub broadcast_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 256,
            command_channel_capacity: 32,
            max_packet_size: 10 * 1024 * 1024,
            default_wait_timeout_ms: 5000,
            broadcast_capacity: 64,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> JdwpResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| JdwpError::IllegalArgument(format!("Invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> JdwpResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> JdwpResult<()> {
        let positive = [
            ("event_channel_capacity", self.event_channel_capacity),
            ("command_channel_capacity", self.command_channel_capacity),
            ("broadcast_capacity", self.broadcast_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(JdwpError::IllegalArgument(format!("{} must be positive", name)));
            }
        }
        if self.default_wait_timeout_ms == 0 {
            return Err(JdwpError::IllegalArgument(
                "default_wait_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_packet_size < crate::protocol::HEADER_SIZE {
            return Err(JdwpError::IllegalArgument(format!(
                "max_packet_size must be at least {} bytes",
                crate::protocol::HEADER_SIZE
            )));
        }
        Ok(())
    }

    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.default_wait_timeout_ms)
    }
}
