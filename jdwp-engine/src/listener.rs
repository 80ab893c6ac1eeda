// Event listeners
//
// Listeners implement only the callbacks they care about; every method has
// an empty default. Callbacks run on the event pump, so they must not block
// for long. Resuming, disabling or deleting requests from inside a callback
// is allowed.

use crate::eventrequest::EventKind;
use crate::eventset::{DisconnectCause, EventSet, MatchedEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    /// Called first for every delivered set
    fn event_set_received(&self, set: &EventSet) {}
    /// Called after the per-event callbacks of a set
    fn event_set_complete(&self, set: &EventSet) {}

    fn breakpoint(&self, set: &EventSet, event: &MatchedEvent) {}
    fn step(&self, set: &EventSet, event: &MatchedEvent) {}
    fn access_watchpoint(&self, set: &EventSet, event: &MatchedEvent) {}
    fn modification_watchpoint(&self, set: &EventSet, event: &MatchedEvent) {}
    fn method_entry(&self, set: &EventSet, event: &MatchedEvent) {}
    fn method_exit(&self, set: &EventSet, event: &MatchedEvent) {}
    fn thread_start(&self, set: &EventSet, event: &MatchedEvent) {}
    fn thread_death(&self, set: &EventSet, event: &MatchedEvent) {}
    fn class_prepare(&self, set: &EventSet, event: &MatchedEvent) {}
    fn class_unload(&self, set: &EventSet, event: &MatchedEvent) {}
    fn exception(&self, set: &EventSet, event: &MatchedEvent) {}
    fn monitor_contended_enter(&self, set: &EventSet, event: &MatchedEvent) {}
    fn monitor_contended_entered(&self, set: &EventSet, event: &MatchedEvent) {}
    fn monitor_wait(&self, set: &EventSet, event: &MatchedEvent) {}
    fn monitor_waited(&self, set: &EventSet, event: &MatchedEvent) {}
    fn vm_start(&self, set: &EventSet, event: &MatchedEvent) {}
    fn vm_death(&self, set: &EventSet, event: &MatchedEvent) {}

    /// Final notification of a session, delivered exactly once
    fn disconnected(&self, cause: &DisconnectCause) {}
}

/// Route one event to its per-kind callback
pub(crate) fn deliver_event(listener: &dyn EventListener, set: &EventSet, event: &MatchedEvent) {
    match event.event.kind {
        EventKind::Breakpoint => listener.breakpoint(set, event),
        EventKind::SingleStep => listener.step(set, event),
        EventKind::FieldAccess => listener.access_watchpoint(set, event),
        EventKind::FieldModification => listener.modification_watchpoint(set, event),
        EventKind::MethodEntry => listener.method_entry(set, event),
        EventKind::MethodExit => listener.method_exit(set, event),
        EventKind::ThreadStart => listener.thread_start(set, event),
        EventKind::ThreadDeath => listener.thread_death(set, event),
        EventKind::ClassPrepare => listener.class_prepare(set, event),
        EventKind::ClassUnload => listener.class_unload(set, event),
        EventKind::Exception => listener.exception(set, event),
        EventKind::MonitorContendedEnter => listener.monitor_contended_enter(set, event),
        EventKind::MonitorContendedEntered => listener.monitor_contended_entered(set, event),
        EventKind::MonitorWait => listener.monitor_wait(set, event),
        EventKind::MonitorWaited => listener.monitor_waited(set, event),
        EventKind::VmStart => listener.vm_start(set, event),
        EventKind::VmDeath => listener.vm_death(set, event),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registered listeners, in registration order
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn EventListener>)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current listeners; callbacks run without holding the lock
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn EventListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }
}
