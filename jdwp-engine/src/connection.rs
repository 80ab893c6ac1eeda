// JDWP connection management
//
// Handles TCP connection, handshake, and event loop startup

use crate::config::EngineConfig;
use crate::eventloop::{spawn_event_loop, EventLoopHandle, TransportEvent};
use crate::protocol::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Command side of a JDWP connection. Clones share the socket and the
/// packet id counter.
#[derive(Debug, Clone)]
pub struct JdwpConnection {
    event_loop: EventLoopHandle,
    next_id: Arc<AtomicU32>,
}

impl JdwpConnection {
    /// Connect to a JVM via JDWP
    pub async fn connect(
        host: &str,
        port: u16,
        config: &EngineConfig,
    ) -> JdwpResult<(Self, mpsc::Receiver<TransportEvent>)> {
        info!("Connecting to JDWP at {}:{}", host, port);

        let mut stream = TcpStream::connect((host, port)).await?;

        // Perform JDWP handshake
        handshake(&mut stream).await?;

        // Split stream and spawn event loop
        let (reader, writer) = stream.into_split();
        let (event_loop, events) = spawn_event_loop(reader, writer, config);

        Ok((Self::from_handle(event_loop), events))
    }

    pub fn from_handle(event_loop: EventLoopHandle) -> Self {
        Self {
            event_loop,
            next_id: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Send a command and wait for reply
    pub async fn send_command(&mut self, packet: CommandPacket) -> JdwpResult<ReplyPacket> {
        debug!("Sending command packet id={}", packet.id);
        self.event_loop.send_command(packet).await
    }

    pub fn is_closed(&self) -> bool {
        self.event_loop.is_closed()
    }

    /// Stop the event loop and close the socket for every clone
    pub fn shutdown(&self) {
        self.event_loop.shutdown();
    }

    /// Generate next packet ID
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// Perform JDWP handshake
pub async fn handshake<S>(stream: &mut S) -> JdwpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Performing JDWP handshake");

    // Send handshake
    stream.write_all(JDWP_HANDSHAKE).await?;
    stream.flush().await?;

    // Receive handshake response
    let mut buf = vec![0u8; JDWP_HANDSHAKE.len()];
    stream.read_exact(&mut buf).await?;

    if buf != JDWP_HANDSHAKE {
        warn!("Invalid handshake response: {:?}", buf);
        return Err(JdwpError::InvalidHandshake);
    }

    info!("JDWP handshake successful");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::loopback;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_handshake_accepts_echo() {
        let (mut client, mut vm) = duplex(64);
        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 14];
            vm.read_exact(&mut buf).await.unwrap();
            vm.write_all(&buf).await.unwrap();
        });
        handshake(&mut client).await.unwrap();
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejects_garbage() {
        let (mut client, mut vm) = duplex(64);
        tokio::spawn(async move {
            let mut buf = [0u8; 14];
            vm.read_exact(&mut buf).await.unwrap();
            vm.write_all(b"Not-JDWP-Hello").await.unwrap();
        });
        assert!(matches!(
            handshake(&mut client).await,
            Err(JdwpError::InvalidHandshake)
        ));
    }

    #[tokio::test]
    async fn test_clones_share_id_counter() {
        let (connection, _vm) = loopback();
        let other = connection.clone();

        assert_eq!(connection.next_id(), 1);
        assert_eq!(other.next_id(), 2);
        assert_eq!(connection.next_id(), 3);
    }
}
