// ThreadReference command implementations
//
// Commands for working with threads (frames, monitors, suspend/resume)

use crate::commands::{command_sets, stack_frame_commands, thread_commands};
use crate::connection::JdwpConnection;
use crate::protocol::{CommandPacket, JdwpResult};
use crate::reader::{read_i32, read_location, read_tagged_object, read_u64};
use crate::types::{FrameId, Location, ObjectId, ThreadId};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Stack frame information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: FrameId,
    pub location: Location,
}

impl JdwpConnection {
    /// Get stack frames for a thread (ThreadReference.Frames command)
    pub async fn get_frames(
        &mut self,
        thread_id: ThreadId,
        start_frame: i32,
        length: i32,
    ) -> JdwpResult<Vec<Frame>> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(id, command_sets::THREAD_REFERENCE, thread_commands::FRAMES);

        packet.data.put_u64(thread_id);
        // Start frame (0 = current/top frame)
        packet.data.put_i32(start_frame);
        // Length (-1 = all frames)
        packet.data.put_i32(length);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let frames_count = read_i32(&mut data)?;
        let mut frames = Vec::with_capacity(frames_count.clamp(0, 1024) as usize);

        for _ in 0..frames_count {
            let frame_id = read_u64(&mut data)?;
            let location = read_location(&mut data)?;
            frames.push(Frame { frame_id, location });
        }

        Ok(frames)
    }

    /// Monitors owned by a thread (ThreadReference.OwnedMonitors command)
    pub async fn get_owned_monitors(&mut self, thread_id: ThreadId) -> JdwpResult<Vec<ObjectId>> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::THREAD_REFERENCE, thread_commands::OWNED_MONITORS);
        packet.data.put_u64(thread_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        let count = read_i32(&mut data)?;
        let mut monitors = Vec::with_capacity(count.clamp(0, 1024) as usize);
        for _ in 0..count {
            monitors.push(read_tagged_object(&mut data)?);
        }

        Ok(monitors)
    }

    /// Suspend one thread (ThreadReference.Suspend)
    pub async fn suspend_thread(&mut self, thread_id: ThreadId) -> JdwpResult<()> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(id, command_sets::THREAD_REFERENCE, thread_commands::SUSPEND);
        packet.data.put_u64(thread_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        Ok(())
    }

    /// Resume one thread (ThreadReference.Resume)
    pub async fn resume_thread(&mut self, thread_id: ThreadId) -> JdwpResult<()> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(id, command_sets::THREAD_REFERENCE, thread_commands::RESUME);
        packet.data.put_u64(thread_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        Ok(())
    }

    /// The VM's own suspend count for a thread (ThreadReference.SuspendCount)
    pub async fn get_suspend_count(&mut self, thread_id: ThreadId) -> JdwpResult<i32> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::THREAD_REFERENCE, thread_commands::SUSPEND_COUNT);
        packet.data.put_u64(thread_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        read_i32(&mut data)
    }

    /// The frame's `this`, or `None` in a static or native method (StackFrame.ThisObject)
    pub async fn get_this_object(
        &mut self,
        thread_id: ThreadId,
        frame_id: FrameId,
    ) -> JdwpResult<Option<ObjectId>> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::STACK_FRAME, stack_frame_commands::THIS_OBJECT);
        packet.data.put_u64(thread_id);
        packet.data.put_u64(frame_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        let object = read_tagged_object(&mut data)?;
        Ok((object != 0).then_some(object))
    }

    /// Pop frames up to and including `frame_id` (StackFrame.PopFrames)
    pub async fn pop_frames(&mut self, thread_id: ThreadId, frame_id: FrameId) -> JdwpResult<()> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::STACK_FRAME, stack_frame_commands::POP_FRAMES);
        packet.data.put_u64(thread_id);
        packet.data.put_u64(frame_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        Ok(())
    }
}
