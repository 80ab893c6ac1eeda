// Suspend coordination
//
// Tracks how often each thread has been suspended and by whom, applies the
// suspend policy of delivered event sets, and makes resume calls symmetric.
// The coordinator only trusts its own counters; it never asks the VM whether
// a thread is actually running.
//
// Counts are per-thread atomics so readers (handle validation, status
// queries) never take the lock. Every mutation happens under `state`.

use crate::control::{ControlChannel, ControlCommand};
use crate::eventrequest::SuspendPolicy;
use crate::protocol::{JdwpError, JdwpResult};
use crate::thread::Frame;
use crate::types::ThreadId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
pub(crate) struct ThreadCache {
    pub(crate) epoch: u64,
    pub(crate) frames: Option<Arc<Vec<Frame>>>,
}

/// Suspend bookkeeping for one thread
#[derive(Debug)]
pub struct ThreadState {
    thread: ThreadId,
    count: AtomicU32,
    // suspensions caused by event sets, a subset of `count`
    event_count: AtomicU32,
    epoch: AtomicU64,
    dead: AtomicBool,
    pub(crate) cache: Mutex<ThreadCache>,
}

impl ThreadState {
    fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            count: AtomicU32::new(0),
            event_count: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            dead: AtomicBool::new(false),
            cache: Mutex::new(ThreadCache::default()),
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn suspend_count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_count() > 0
    }

    pub fn is_event_suspended(&self) -> bool {
        self.event_count.load(Ordering::SeqCst) > 0
    }

    /// Generation of the thread's suspended state; advances on every resume
    /// that brings the count to zero.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Start a new epoch without resuming, for when the VM changed the
    /// thread's stack under a suspension (frames popped).
    pub(crate) fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).frames = None;
    }

    fn increment(&self, from_event: bool) {
        self.count.fetch_add(1, Ordering::SeqCst);
        if from_event {
            self.event_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Caller has checked the count is positive. Returns true when the thread
    /// is now running.
    fn decrement(&self, from_event: bool) -> bool {
        let left = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        if from_event {
            let _ = self
                .event_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        }
        let _ = self
            .event_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.min(left)));

        if left == 0 {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            cache.frames = None;
            trace!("Thread {:#x} running, cached data dropped", self.thread);
            true
        } else {
            false
        }
    }
}

/// The suspension performed for one event set
#[derive(Debug)]
pub struct SuspendRecord {
    policy: SuspendPolicy,
    vm: bool,
    threads: Vec<ThreadId>,
    resumed: AtomicBool,
}

impl SuspendRecord {
    fn new(policy: SuspendPolicy, vm: bool, threads: Vec<ThreadId>) -> Self {
        Self {
            policy,
            vm,
            threads,
            resumed: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> SuspendPolicy {
        self.policy
    }

    /// Threads whose count this suspension raised
    pub fn threads(&self) -> &[ThreadId] {
        &self.threads
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    threads: HashMap<ThreadId, Arc<ThreadState>>,
    vm_count: u32,
}

#[derive(Debug)]
pub struct SuspendCoordinator {
    state: Mutex<CoordinatorState>,
    vm_count: AtomicU32,
    control: ControlChannel,
}

impl Default for SuspendCoordinator {
    fn default() -> Self {
        Self::new(ControlChannel::detached())
    }
}

impl SuspendCoordinator {
    pub fn new(control: ControlChannel) -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            vm_count: AtomicU32::new(0),
            control,
        }
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn thread_entry(state: &mut CoordinatorState, thread: ThreadId) -> Arc<ThreadState> {
        state
            .threads
            .entry(thread)
            .or_insert_with(|| Arc::new(ThreadState::new(thread)))
            .clone()
    }

    fn sync_vm_count(&self, state: &CoordinatorState) {
        self.vm_count.store(state.vm_count, Ordering::SeqCst);
    }

    /// Forget threads that died while suspended and are now running
    fn reap(state: &mut CoordinatorState) {
        state
            .threads
            .retain(|_, t| !(t.dead.load(Ordering::SeqCst) && !t.is_suspended()));
    }

    pub fn register_thread(&self, thread: ThreadId) {
        let mut state = self.state();
        let entry = Self::thread_entry(&mut state, thread);
        entry.dead.store(false, Ordering::SeqCst);
    }

    /// Mark a thread dead. It stays tracked until its suspensions are resumed.
    pub fn thread_died(&self, thread: ThreadId) {
        let mut state = self.state();
        if let Some(entry) = state.threads.get(&thread) {
            entry.dead.store(true, Ordering::SeqCst);
            if !entry.is_suspended() {
                entry.epoch.fetch_add(1, Ordering::SeqCst);
            }
        }
        Self::reap(&mut state);
    }

    pub fn live_threads(&self) -> Vec<ThreadId> {
        let state = self.state();
        let mut threads: Vec<ThreadId> = state
            .threads
            .values()
            .filter(|t| !t.dead.load(Ordering::SeqCst))
            .map(|t| t.thread)
            .collect();
        threads.sort_unstable();
        threads
    }

    pub fn thread_state(&self, thread: ThreadId) -> Option<Arc<ThreadState>> {
        self.state().threads.get(&thread).cloned()
    }

    pub fn suspend_count(&self, thread: ThreadId) -> u32 {
        self.thread_state(thread)
            .map(|t| t.suspend_count())
            .unwrap_or(0)
    }

    pub fn is_suspended(&self, thread: ThreadId) -> bool {
        self.suspend_count(thread) > 0
    }

    pub fn all_suspended(&self) -> bool {
        self.vm_count.load(Ordering::SeqCst) > 0
    }

    /// Record the suspension an event set caused. Nothing is sent to the VM:
    /// it suspended itself before reporting the events.
    pub fn apply_policy(&self, policy: SuspendPolicy, thread: Option<ThreadId>) -> Arc<SuspendRecord> {
        let mut state = self.state();
        let record = match (policy, thread) {
            (SuspendPolicy::None, _) | (SuspendPolicy::EventThread, None) => {
                SuspendRecord::new(policy, false, Vec::new())
            }
            (SuspendPolicy::EventThread, Some(thread)) => {
                Self::thread_entry(&mut state, thread).increment(true);
                SuspendRecord::new(policy, false, vec![thread])
            }
            (SuspendPolicy::All, _) => {
                if let Some(thread) = thread {
                    Self::thread_entry(&mut state, thread);
                }
                state.vm_count += 1;
                let mut threads = Vec::new();
                for entry in state.threads.values() {
                    if !entry.dead.load(Ordering::SeqCst) {
                        entry.increment(true);
                        threads.push(entry.thread);
                    }
                }
                threads.sort_unstable();
                SuspendRecord::new(policy, true, threads)
            }
        };
        self.sync_vm_count(&state);
        debug!(
            "Applied {:?} suspension to {} thread(s)",
            policy,
            record.threads.len()
        );
        Arc::new(record)
    }

    /// Undo exactly the suspension described by `record`. A record can be
    /// resumed once; a second attempt, or one whose threads were already
    /// resumed by other means, is an `ImbalancedResume`.
    pub fn resume_record(&self, record: &SuspendRecord) -> JdwpResult<()> {
        let mut state = self.state();

        if record.is_resumed() {
            return Err(JdwpError::ImbalancedResume(
                "event set was already resumed".to_string(),
            ));
        }

        let entries: Vec<Arc<ThreadState>> = record
            .threads
            .iter()
            .filter_map(|t| state.threads.get(t).cloned())
            .collect();

        if let Some(idle) = entries.iter().find(|t| !t.is_suspended()) {
            return Err(JdwpError::ImbalancedResume(format!(
                "thread {:#x} is not suspended",
                idle.thread
            )));
        }
        if record.vm && state.vm_count == 0 {
            return Err(JdwpError::ImbalancedResume(
                "virtual machine is not suspended".to_string(),
            ));
        }

        record.resumed.store(true, Ordering::SeqCst);
        if record.vm {
            state.vm_count -= 1;
        }
        for entry in &entries {
            entry.decrement(true);
        }
        Self::reap(&mut state);
        self.sync_vm_count(&state);

        match (record.policy, record.threads.as_slice()) {
            (SuspendPolicy::All, _) => self.control.send(ControlCommand::ResumeAll),
            (SuspendPolicy::EventThread, [thread]) => {
                self.control.send(ControlCommand::ResumeThread(*thread))
            }
            _ => {}
        }
        Ok(())
    }

    pub fn suspend_thread(&self, thread: ThreadId) {
        let mut state = self.state();
        Self::thread_entry(&mut state, thread).increment(false);
        drop(state);
        self.control.send(ControlCommand::SuspendThread(thread));
    }

    pub fn resume_thread(&self, thread: ThreadId) -> JdwpResult<()> {
        let mut state = self.state();
        let entry = state
            .threads
            .get(&thread)
            .cloned()
            .filter(|t| t.is_suspended())
            .ok_or_else(|| {
                JdwpError::ImbalancedResume(format!("thread {:#x} is not suspended", thread))
            })?;

        if entry.decrement(false) {
            debug!("Thread {:#x} resumed", thread);
        }
        Self::reap(&mut state);
        drop(state);
        self.control.send(ControlCommand::ResumeThread(thread));
        Ok(())
    }

    pub fn suspend_all(&self) {
        let mut state = self.state();
        state.vm_count += 1;
        for entry in state.threads.values() {
            if !entry.dead.load(Ordering::SeqCst) {
                entry.increment(false);
            }
        }
        self.sync_vm_count(&state);
        drop(state);
        self.control.send(ControlCommand::SuspendAll);
    }

    /// Decrement every suspended thread once, like VirtualMachine.Resume.
    /// Fails only when nothing at all is suspended.
    pub fn resume_all(&self) -> JdwpResult<()> {
        let mut state = self.state();
        let suspended: Vec<Arc<ThreadState>> = state
            .threads
            .values()
            .filter(|t| t.is_suspended())
            .cloned()
            .collect();

        if state.vm_count == 0 && suspended.is_empty() {
            return Err(JdwpError::ImbalancedResume(
                "no thread is suspended".to_string(),
            ));
        }

        state.vm_count = state.vm_count.saturating_sub(1);
        for entry in &suspended {
            entry.decrement(false);
        }
        Self::reap(&mut state);
        self.sync_vm_count(&state);
        drop(state);

        debug!("Resumed {} thread(s)", suspended.len());
        self.control.send(ControlCommand::ResumeAll);
        Ok(())
    }

    /// Drop all bookkeeping; used when the session ends
    pub fn reset(&self) {
        let mut state = self.state();
        for entry in state.threads.values() {
            if entry.is_suspended() {
                warn!("Thread {:#x} still suspended at teardown", entry.thread);
            }
            entry.epoch.fetch_add(1, Ordering::SeqCst);
        }
        state.threads.clear();
        state.vm_count = 0;
        self.sync_vm_count(&state);
    }
}
