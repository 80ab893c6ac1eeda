// JDWP Event Loop
//
// Owns the socket. Multiplexes outgoing commands with incoming replies and
// composite event packets; replies are routed to their waiting command,
// event batches go out on a bounded channel in arrival order.

use crate::commands::{command_sets, composite_commands};
use crate::config::EngineConfig;
use crate::eventset::DisconnectCause;
use crate::events::{parse_event_packet, WireEventSet};
use crate::protocol::{CommandPacket, JdwpError, JdwpResult, ReplyPacket, HEADER_SIZE, REPLY_FLAG};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Request to send a command and get reply
pub struct CommandRequest {
    pub packet: CommandPacket,
    pub reply_tx: oneshot::Sender<JdwpResult<ReplyPacket>>,
}

/// What the transport reports to the engine
#[derive(Debug)]
pub enum TransportEvent {
    Batch(WireEventSet),
    /// Always the last item on the channel
    Disconnected(DisconnectCause),
}

/// Handle to the event loop for sending commands
#[derive(Clone, Debug)]
pub struct EventLoopHandle {
    command_tx: mpsc::Sender<CommandRequest>,
    shutdown: Arc<Notify>,
}

impl EventLoopHandle {
    /// Wrap an existing command channel; whoever owns the receiver plays the VM
    pub fn from_channel(command_tx: mpsc::Sender<CommandRequest>) -> Self {
        Self {
            command_tx,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Ask the loop to stop and close the socket. Commands still waiting
    /// for a reply fail with `ConnectionClosed`.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Resolves once `shutdown` has been called on any clone
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await
    }

    /// Send a command and wait for reply
    pub async fn send_command(&self, packet: CommandPacket) -> JdwpResult<ReplyPacket> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let request = CommandRequest { packet, reply_tx };

        self.command_tx
            .send(request)
            .await
            .map_err(|_| JdwpError::ConnectionClosed)?;

        reply_rx.await.map_err(|_| JdwpError::ConnectionClosed)?
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

/// Start the event loop task
pub fn spawn_event_loop<R, W>(
    reader: R,
    writer: W,
    config: &EngineConfig,
) -> (EventLoopHandle, mpsc::Receiver<TransportEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(config.command_channel_capacity);
    let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);

    let (packet_tx, packet_rx) = mpsc::channel(config.command_channel_capacity);
    let handle = EventLoopHandle::from_channel(command_tx);

    let reader = tokio::spawn(read_loop(reader, packet_tx, config.max_packet_size));
    tokio::spawn(event_loop_task(
        writer,
        command_rx,
        packet_rx,
        event_tx,
        reader,
        handle.shutdown.clone(),
    ));

    (handle, event_rx)
}

/// Socket reader. Runs in its own task so a partially read packet is never
/// lost to a cancelled `select!` branch.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    packet_tx: mpsc::Sender<JdwpResult<(bool, u32, Vec<u8>)>>,
    max_packet_size: usize,
) {
    loop {
        let result = read_packet(&mut reader, max_packet_size).await;
        let failed = result.is_err();
        if packet_tx.send(result).await.is_err() || failed {
            break;
        }
    }
}

/// Main event loop task
async fn event_loop_task<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut command_rx: mpsc::Receiver<CommandRequest>,
    mut packet_rx: mpsc::Receiver<JdwpResult<(bool, u32, Vec<u8>)>>,
    event_tx: mpsc::Sender<TransportEvent>,
    reader: JoinHandle<()>,
    shutdown: Arc<Notify>,
) {
    info!("Event loop started");

    let mut pending_replies: HashMap<u32, oneshot::Sender<JdwpResult<ReplyPacket>>> =
        HashMap::new();

    let cause = loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("Event loop shutdown requested");
                break DisconnectCause::Detached;
            }

            // Handle outgoing commands
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else {
                    break DisconnectCause::Detached;
                };
                let packet_id = cmd.packet.id;
                debug!("Sending command id={}", packet_id);

                let encoded = cmd.packet.encode();
                let written = match writer.write_all(&encoded).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    error!("Failed to write command: {}", e);
                    let reason = e.to_string();
                    cmd.reply_tx.send(Err(JdwpError::Io(e))).ok();
                    break DisconnectCause::TransportClosed(reason);
                }

                pending_replies.insert(packet_id, cmd.reply_tx);
            }

            // Handle incoming packets
            result = packet_rx.recv() => {
                let (is_reply, packet_id, data) = match result {
                    Some(Ok(packet)) => packet,
                    Some(Err(JdwpError::ProtocolViolation(reason))) => {
                        error!("Protocol violation: {}", reason);
                        break DisconnectCause::ProtocolViolation(reason);
                    }
                    Some(Err(e)) => {
                        info!("Transport closed: {}", e);
                        break DisconnectCause::TransportClosed(e.to_string());
                    }
                    None => break DisconnectCause::TransportClosed("reader stopped".to_string()),
                };

                if is_reply {
                    // It's a reply - route to waiting command
                    debug!("Received reply id={}", packet_id);

                    if let Some(tx) = pending_replies.remove(&packet_id) {
                        tx.send(ReplyPacket::decode(&data)).ok();
                    } else {
                        warn!("Received reply for unknown command id={}", packet_id);
                    }
                    continue;
                }

                match decode_event_batch(&data) {
                    Ok(event_set) => {
                        debug!(
                            "Parsed event set: {} events, suspend_policy={:?}",
                            event_set.events.len(),
                            event_set.suspend_policy
                        );
                        // Backpressure: wait for the engine rather than drop a batch
                        if event_tx.send(TransportEvent::Batch(event_set)).await.is_err() {
                            warn!("Event receiver dropped, stopping event loop");
                            break DisconnectCause::Detached;
                        }
                    }
                    Err(e) => {
                        error!("Failed to parse event packet: {}", e);
                        break DisconnectCause::ProtocolViolation(e.to_string());
                    }
                }
            }
        }
    };

    reader.abort();
    for (_, tx) in pending_replies.drain() {
        tx.send(Err(JdwpError::ConnectionClosed)).ok();
    }
    event_tx.send(TransportEvent::Disconnected(cause)).await.ok();

    info!("Event loop shutting down");
}

/// Decode a command packet sent by the VM. Only composite events are legal.
fn decode_event_batch(data: &[u8]) -> JdwpResult<WireEventSet> {
    let packet = CommandPacket::decode(data)?;
    if packet.command_set != command_sets::EVENT || packet.command != composite_commands::COMPOSITE {
        return Err(JdwpError::ProtocolViolation(format!(
            "Unexpected command from VM: set={} command={}",
            packet.command_set, packet.command
        )));
    }
    parse_event_packet(&packet.data)
}

/// Read a packet from the socket and determine if it's a reply or event
async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_packet_size: usize,
) -> JdwpResult<(bool, u32, Vec<u8>)> {
    // Read header
    let mut header = BytesMut::with_capacity(HEADER_SIZE);
    header.resize(HEADER_SIZE, 0);

    reader.read_exact(&mut header).await?;

    // Parse header
    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let packet_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let flags = header[8];

    if length < HEADER_SIZE {
        return Err(JdwpError::ProtocolViolation(format!(
            "Invalid packet length: {}",
            length
        )));
    }

    if length > max_packet_size {
        return Err(JdwpError::ProtocolViolation(format!(
            "Packet too large: {} bytes (max: {} bytes)",
            length, max_packet_size
        )));
    }

    // Read rest of packet
    let data_len = length - HEADER_SIZE;
    let mut full_packet = header.to_vec();

    if data_len > 0 {
        let mut data = vec![0u8; data_len];
        reader.read_exact(&mut data).await?;
        full_packet.extend_from_slice(&data);
    }

    let is_reply = flags == REPLY_FLAG;

    Ok((is_reply, packet_id, full_packet))
}
