// Frame and monitor handles
//
// Data read from a suspended thread is only meaningful while the thread
// stays suspended. Handles remember the suspend epoch they were fetched in
// and refuse access once the thread has run again.

use crate::protocol::{JdwpError, JdwpResult};
use crate::suspend::ThreadState;
use crate::thread::Frame;
use crate::types::{FrameId, Location, ObjectId, ThreadId};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct EpochGuard {
    state: Arc<ThreadState>,
    epoch: u64,
}

impl EpochGuard {
    fn check(&self) -> JdwpResult<()> {
        let current = self.state.epoch();
        if current != self.epoch || !self.state.is_suspended() {
            return Err(JdwpError::StaleHandle {
                thread: self.state.thread(),
                fetched: self.epoch,
                current,
            });
        }
        Ok(())
    }
}

/// One stack frame of a suspended thread
#[derive(Debug, Clone)]
pub struct FrameHandle {
    guard: EpochGuard,
    depth: usize,
    frame: Frame,
}

impl FrameHandle {
    pub(crate) fn new(state: Arc<ThreadState>, epoch: u64, depth: usize, frame: Frame) -> Self {
        Self {
            guard: EpochGuard { state, epoch },
            depth,
            frame,
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.guard.state.thread()
    }

    /// 0 is the top frame
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn epoch(&self) -> u64 {
        self.guard.epoch
    }

    pub fn is_valid(&self) -> bool {
        self.guard.check().is_ok()
    }

    pub fn frame(&self) -> JdwpResult<&Frame> {
        self.guard.check()?;
        Ok(&self.frame)
    }

    pub fn frame_id(&self) -> JdwpResult<FrameId> {
        Ok(self.frame()?.frame_id)
    }

    pub fn location(&self) -> JdwpResult<Location> {
        Ok(self.frame()?.location)
    }
}

/// Monitors owned by a suspended thread at the time of the query
#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    guard: EpochGuard,
    monitors: Vec<ObjectId>,
}

impl MonitorSnapshot {
    pub(crate) fn new(state: Arc<ThreadState>, epoch: u64, monitors: Vec<ObjectId>) -> Self {
        Self {
            guard: EpochGuard { state, epoch },
            monitors,
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.guard.state.thread()
    }

    pub fn is_valid(&self) -> bool {
        self.guard.check().is_ok()
    }

    pub fn monitors(&self) -> JdwpResult<&[ObjectId]> {
        self.guard.check()?;
        Ok(&self.monitors)
    }
}
