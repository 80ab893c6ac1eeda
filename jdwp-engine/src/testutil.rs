// In-process stand-in for a target VM
//
// `loopback()` gives a connection whose commands are answered by a `FakeVm`
// instead of a socket. Every command is recorded; replies are canned.

use crate::commands::{
    command_sets, error_codes, event_commands, object_reference_commands, reference_type_commands,
    stack_frame_commands, thread_commands, vm_commands,
};
use crate::connection::JdwpConnection;
use crate::eventloop::{CommandRequest, EventLoopHandle};
use crate::protocol::{CommandPacket, ReplyPacket};
use crate::thread::Frame;
use crate::types::{FrameId, ObjectId, ReferenceTypeId, ThreadId};
use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct FakeVmState {
    commands: Vec<CommandPacket>,
    threads: Vec<ThreadId>,
    frames: HashMap<ThreadId, Vec<Frame>>,
    monitors: HashMap<ThreadId, Vec<ObjectId>>,
    errors: HashMap<(u8, u8), u16>,
    next_request: i32,
    object_classes: HashMap<ObjectId, ReferenceTypeId>,
    source_files: HashMap<ReferenceTypeId, String>,
    this_objects: HashMap<FrameId, ObjectId>,
    shut_down: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakeVm {
    state: Arc<Mutex<FakeVmState>>,
}

impl FakeVm {
    pub fn commands(&self) -> Vec<CommandPacket> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn count(&self, command_set: u8, command: u8) -> usize {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|p| p.command_set == command_set && p.command == command)
            .count()
    }

    pub fn set_threads(&self, threads: &[ThreadId]) {
        self.state.lock().unwrap().threads = threads.to_vec();
    }

    pub fn set_frames(&self, thread: ThreadId, frames: Vec<Frame>) {
        self.state.lock().unwrap().frames.insert(thread, frames);
    }

    pub fn set_monitors(&self, thread: ThreadId, monitors: Vec<ObjectId>) {
        self.state.lock().unwrap().monitors.insert(thread, monitors);
    }

    pub fn set_object_class(&self, object: ObjectId, class: ReferenceTypeId) {
        self.state.lock().unwrap().object_classes.insert(object, class);
    }

    pub fn set_source_file(&self, class: ReferenceTypeId, source: &str) {
        self.state
            .lock()
            .unwrap()
            .source_files
            .insert(class, source.to_string());
    }

    /// `this` of a frame; frames without one answer with the null object
    pub fn set_this_object(&self, frame: FrameId, object: ObjectId) {
        self.state.lock().unwrap().this_objects.insert(frame, object);
    }

    /// Whether the connection asked the transport to shut down
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().unwrap().shut_down
    }

    /// Answer every future `command_set`/`command` with a JDWP error code
    pub fn fail(&self, command_set: u8, command: u8, error_code: u16) {
        self.state
            .lock()
            .unwrap()
            .errors
            .insert((command_set, command), error_code);
    }

    fn reply(&self, packet: &CommandPacket) -> ReplyPacket {
        let mut state = self.state.lock().unwrap();
        state.commands.push(packet.clone());

        if let Some(code) = state.errors.get(&(packet.command_set, packet.command)) {
            return ReplyPacket::new(packet.id, *code);
        }

        let mut reply = ReplyPacket::new(packet.id, 0);
        let mut args = packet.data.as_slice();
        match (packet.command_set, packet.command) {
            (command_sets::VIRTUAL_MACHINE, vm_commands::ALL_THREADS) => {
                reply.data.put_i32(state.threads.len() as i32);
                for thread in &state.threads {
                    reply.data.put_u64(*thread);
                }
            }
            (command_sets::EVENT_REQUEST, event_commands::SET) => {
                state.next_request += 1;
                reply.data.put_i32(state.next_request);
            }
            (command_sets::THREAD_REFERENCE, thread_commands::FRAMES) => {
                let thread = args.get_u64();
                let frames = state.frames.get(&thread).cloned().unwrap_or_default();
                reply.data.put_i32(frames.len() as i32);
                for frame in frames {
                    reply.data.put_u64(frame.frame_id);
                    reply.data.put_u8(frame.location.type_tag);
                    reply.data.put_u64(frame.location.class_id);
                    reply.data.put_u64(frame.location.method_id);
                    reply.data.put_u64(frame.location.index);
                }
            }
            (command_sets::THREAD_REFERENCE, thread_commands::OWNED_MONITORS) => {
                let thread = args.get_u64();
                let monitors = state.monitors.get(&thread).cloned().unwrap_or_default();
                reply.data.put_i32(monitors.len() as i32);
                for monitor in monitors {
                    reply.data.put_u8(b'L');
                    reply.data.put_u64(monitor);
                }
            }
            (command_sets::THREAD_REFERENCE, thread_commands::SUSPEND_COUNT) => {
                reply.data.put_i32(0);
            }
            (command_sets::OBJECT_REFERENCE, object_reference_commands::REFERENCE_TYPE) => {
                let object = args.get_u64();
                let class = state.object_classes.get(&object).copied().unwrap_or_default();
                reply.data.put_u8(1);
                reply.data.put_u64(class);
            }
            (command_sets::REFERENCE_TYPE, reference_type_commands::SOURCE_FILE) => {
                let class = args.get_u64();
                match state.source_files.get(&class) {
                    Some(source) => {
                        reply.data.put_u32(source.len() as u32);
                        reply.data.put_slice(source.as_bytes());
                    }
                    None => return ReplyPacket::new(packet.id, error_codes::ABSENT_INFORMATION),
                }
            }
            (command_sets::STACK_FRAME, stack_frame_commands::THIS_OBJECT) => {
                args.advance(8);
                let frame = args.get_u64();
                reply.data.put_u8(b'L');
                reply.data.put_u64(state.this_objects.get(&frame).copied().unwrap_or(0));
            }
            _ => {}
        }
        reply
    }
}

/// A connection served by a fresh `FakeVm`. Needs a running tokio runtime.
pub fn loopback() -> (JdwpConnection, FakeVm) {
    let (command_tx, mut command_rx) = mpsc::channel::<CommandRequest>(32);
    let vm = FakeVm::default();

    let handle = EventLoopHandle::from_channel(command_tx);
    let responder = vm.clone();
    let signal = handle.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                request = command_rx.recv() => {
                    let Some(request) = request else { break };
                    let reply = responder.reply(&request.packet);
                    request.reply_tx.send(Ok(reply)).ok();
                }
                _ = signal.shutdown_requested() => {
                    responder.state.lock().unwrap().shut_down = true;
                    break;
                }
            }
        }
    });

    (JdwpConnection::from_handle(handle), vm)
}
