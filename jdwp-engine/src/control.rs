// VM control forwarding
//
// The registry and the suspend coordinator are synchronous so that listener
// callbacks can use them directly. State changes that the VM has to see are
// queued here and sent, in order, by a single forwarder task.
//
// The forwarder also learns the VM's id for every installed request, which
// is how incoming events are attributed to requests.

use crate::connection::JdwpConnection;
use crate::eventrequest::{EventKind, Filter, RequestId, RequestTarget, SuspendPolicy};
use crate::types::ThreadId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    SuspendAll,
    ResumeAll,
    SuspendThread(ThreadId),
    ResumeThread(ThreadId),
    Install {
        id: RequestId,
        kind: EventKind,
        suspend_policy: SuspendPolicy,
        target: RequestTarget,
        filters: Vec<Filter>,
    },
    Clear {
        id: RequestId,
    },
}

/// Which request the VM reported an event for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    /// An installed request
    Request(RequestId),
    /// A request that has been cleared since
    Retired,
    /// Automatic events and ids the engine never learned
    Unknown,
}

#[derive(Debug, Default)]
struct InstalledState {
    live: HashMap<i32, RequestId>,
    retired: HashSet<i32>,
    // installs queued or in flight
    pending: usize,
    closed: bool,
}

/// VM request id to engine request id, as learned from EventRequest.Set replies
#[derive(Debug, Default)]
pub struct InstalledRequests {
    state: Mutex<InstalledState>,
    changed: Notify,
}

impl InstalledRequests {
    fn state(&self) -> MutexGuard<'_, InstalledState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_install(&self) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }
        state.pending += 1;
        true
    }

    fn finish_install(&self, installed: Option<(i32, RequestId)>) {
        {
            let mut state = self.state();
            state.pending = state.pending.saturating_sub(1);
            if let Some((vm_id, id)) = installed {
                state.retired.remove(&vm_id);
                state.live.insert(vm_id, id);
            }
        }
        self.changed.notify_waiters();
    }

    fn retire(&self, vm_id: i32) {
        let mut state = self.state();
        state.live.remove(&vm_id);
        state.retired.insert(vm_id);
    }

    fn close(&self) {
        {
            let mut state = self.state();
            state.closed = true;
            state.pending = 0;
        }
        self.changed.notify_waiters();
    }

    pub fn lookup(&self, vm_id: i32) -> Attribution {
        let state = self.state();
        if let Some(id) = state.live.get(&vm_id) {
            Attribution::Request(*id)
        } else if state.retired.contains(&vm_id) {
            Attribution::Retired
        } else {
            Attribution::Unknown
        }
    }

    /// Attribute a VM request id. The VM may report an event before the
    /// forwarder has processed the Set reply that names it, so an unknown id
    /// waits for queued installs to finish, until `deadline` at most.
    pub async fn resolve(&self, vm_id: i32, deadline: Instant) -> Attribution {
        if vm_id == 0 {
            return Attribution::Unknown;
        }
        loop {
            let changed = self.changed.notified();
            {
                let state = self.state();
                if let Some(id) = state.live.get(&vm_id) {
                    return Attribution::Request(*id);
                }
                if state.retired.contains(&vm_id) {
                    return Attribution::Retired;
                }
                if state.pending == 0 {
                    return Attribution::Unknown;
                }
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                warn!("VM request {} still unknown after waiting for installs", vm_id);
                return Attribution::Unknown;
            }
        }
    }
}

/// Sending half of the control queue. A detached channel drops everything,
/// which is what an engine without a VM behind it wants.
#[derive(Debug, Clone, Default)]
pub struct ControlChannel {
    tx: Option<mpsc::UnboundedSender<ControlCommand>>,
    installed: Arc<InstalledRequests>,
}

impl ControlChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControlCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                installed: Arc::default(),
            },
            rx,
        )
    }

    pub fn detached() -> Self {
        Self::default()
    }

    pub fn installed(&self) -> &Arc<InstalledRequests> {
        &self.installed
    }

    pub fn send(&self, command: ControlCommand) {
        let Some(tx) = &self.tx else {
            return;
        };
        let install = matches!(command, ControlCommand::Install { .. }) && self.installed.begin_install();
        if tx.send(command).is_err() {
            debug!("Control forwarder gone, dropping command");
            if install {
                self.installed.finish_install(None);
            }
        }
    }
}

/// Start the task that forwards control commands to the VM
pub fn spawn_control_forwarder(
    connection: JdwpConnection,
    rx: mpsc::UnboundedReceiver<ControlCommand>,
    installed: Arc<InstalledRequests>,
) -> JoinHandle<()> {
    tokio::spawn(forward_commands(connection, rx, installed))
}

async fn forward_commands(
    mut connection: JdwpConnection,
    mut rx: mpsc::UnboundedReceiver<ControlCommand>,
    shared: Arc<InstalledRequests>,
) {
    info!("Control forwarder started");

    // engine request id -> (kind, VM request id)
    let mut installed: HashMap<RequestId, (EventKind, i32)> = HashMap::new();

    while let Some(command) = rx.recv().await {
        debug!("Forwarding {:?}", command);

        let result = match &command {
            ControlCommand::SuspendAll => connection.suspend_all().await,
            ControlCommand::ResumeAll => connection.resume_all().await,
            ControlCommand::SuspendThread(thread) => connection.suspend_thread(*thread).await,
            ControlCommand::ResumeThread(thread) => connection.resume_thread(*thread).await,
            ControlCommand::Install {
                id,
                kind,
                suspend_policy,
                target,
                filters,
            } => match connection
                .set_event_request(*kind, *suspend_policy, target, filters)
                .await
            {
                Ok(vm_id) => {
                    debug!("Request {} installed as VM request {}", id, vm_id);
                    installed.insert(*id, (*kind, vm_id));
                    shared.finish_install(Some((vm_id, *id)));
                    Ok(())
                }
                Err(e) => {
                    shared.finish_install(None);
                    Err(e)
                }
            },
            ControlCommand::Clear { id } => match installed.remove(id) {
                Some((kind, vm_id)) => {
                    shared.retire(vm_id);
                    connection.clear_event_request(kind, vm_id).await
                }
                None => Ok(()),
            },
        };

        if let Err(e) = result {
            if e.is_fatal() {
                warn!("Control forwarder stopping: {}", e);
                break;
            }
            warn!("VM rejected {:?}: {}", command, e);
        }
    }

    shared.close();
    info!("Control forwarder shutting down");
}
