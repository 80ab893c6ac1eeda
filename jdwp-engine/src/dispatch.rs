// Event dispatch
//
// One pass per batch of raw events reported at a single suspend point:
// match every event against a snapshot of the registry, group the matches
// into one event set, record the suspension, deliver to listeners, then
// delete requests whose count filter expired.
//
// The only resume the dispatcher performs is for a batch it swallowed whole:
// every event was reported for a request that has since been cleared or that
// the engine's own filters rejected.

use crate::eventrequest::{EventKind, RequestId, SuspendPolicy};
use crate::eventset::{DisconnectCause, EventSet, MatchedEvent};
use crate::filter::FilterOutcome;
use crate::listener::{deliver_event, ListenerRegistry};
use crate::protocol::JdwpError;
use crate::rawevent::RawEvent;
use crate::registry::{RequestEntry, RequestRegistry};
use crate::suspend::SuspendCoordinator;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl RequestId {
    /// Request id of events the VM generates without a request (VM start and death)
    pub const AUTOMATIC: RequestId = RequestId(0);
}

/// Which request the VM reported an event for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Matched against every request
    Unattributed,
    /// Reported for this request, with its mirrored filters already applied
    Request(RequestId),
    /// Reported for a request that no longer exists
    Retired,
}

/// Raw events the debuggee reported atomically
#[derive(Debug, Clone)]
pub struct RawEventBatch {
    /// Suspension the transport already performed for this batch
    pub suspend_policy: SuspendPolicy,
    pub events: Vec<RawEvent>,
    origins: Vec<EventOrigin>,
}

impl RawEventBatch {
    pub fn new(suspend_policy: SuspendPolicy, events: Vec<RawEvent>) -> Self {
        Self {
            suspend_policy,
            origins: vec![EventOrigin::Unattributed; events.len()],
            events,
        }
    }

    pub fn single(suspend_policy: SuspendPolicy, event: RawEvent) -> Self {
        Self::new(suspend_policy, vec![event])
    }

    pub fn attributed(suspend_policy: SuspendPolicy, events: Vec<(RawEvent, EventOrigin)>) -> Self {
        let (events, origins) = events.into_iter().unzip();
        Self {
            suspend_policy,
            events,
            origins,
        }
    }

    pub fn origin(&self, index: usize) -> EventOrigin {
        self.origins
            .get(index)
            .copied()
            .unwrap_or(EventOrigin::Unattributed)
    }
}

#[derive(Default)]
struct Matches {
    events: Vec<MatchedEvent>,
    expired: Vec<RequestId>,
    policy: Option<SuspendPolicy>,
}

impl Matches {
    fn add(&mut self, entry: &RequestEntry, outcome: FilterOutcome, event: &RawEvent) {
        if !outcome.is_match() {
            return;
        }
        if outcome == FilterOutcome::MatchedAndExpired {
            self.expired.push(entry.id());
        }
        push_unique(&mut self.events, entry.id(), event);
        self.policy = self.policy.max(Some(entry.suspend_policy()));
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Delivered(Arc<EventSet>),
    /// Nothing matched. `suspended` tells whether the transport's suspension
    /// still applies and needs an explicit resume.
    Dropped { suspended: bool },
}

impl DispatchOutcome {
    pub fn event_set(&self) -> Option<&Arc<EventSet>> {
        match self {
            DispatchOutcome::Delivered(set) => Some(set),
            DispatchOutcome::Dropped { .. } => None,
        }
    }
}

pub struct EventDispatcher {
    registry: Arc<RequestRegistry>,
    coordinator: Arc<SuspendCoordinator>,
    listeners: Arc<ListenerRegistry>,
    sequence: AtomicU64,
    disconnected: AtomicBool,
}

impl EventDispatcher {
    pub fn new(
        registry: Arc<RequestRegistry>,
        coordinator: Arc<SuspendCoordinator>,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            registry,
            coordinator,
            listeners,
            sequence: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<SuspendCoordinator> {
        &self.coordinator
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn dispatch(&self, batch: RawEventBatch) -> DispatchOutcome {
        // New threads take part in this batch's suspension
        for event in &batch.events {
            if matches!(event.kind, EventKind::ThreadStart | EventKind::VmStart) {
                if let Some(thread) = event.thread {
                    self.coordinator.register_thread(thread);
                }
            }
        }

        let snapshot = self.registry.snapshot();
        let mut matches = Matches::default();
        // every event belonged to a request of ours
        let mut owned = !batch.events.is_empty();

        for (index, event) in batch.events.iter().enumerate() {
            let origin = match batch.origin(index) {
                EventOrigin::Request(id) => match snapshot.iter().find(|e| e.id() == id) {
                    Some(entry) if entry.kind() != event.kind => {
                        warn!("VM reported a {} event for {} request {}", event.kind, entry.kind(), id);
                        EventOrigin::Unattributed
                    }
                    Some(_) => EventOrigin::Request(id),
                    None => EventOrigin::Retired,
                },
                other => other,
            };

            match origin {
                EventOrigin::Unattributed => {
                    owned = false;
                    if matches!(event.kind, EventKind::VmStart | EventKind::VmDeath) {
                        push_unique(&mut matches.events, RequestId::AUTOMATIC, event);
                        matches.policy = matches.policy.max(Some(batch.suspend_policy));
                    }
                    for entry in &snapshot {
                        matches.add(entry, entry.evaluate(event), event);
                    }
                }
                EventOrigin::Request(id) => {
                    if let Some(entry) = snapshot.iter().find(|e| e.id() == id) {
                        let outcome = entry.evaluate_reported(event);
                        match entry.mirrored_instance() {
                            Some(object) if event.this_object.is_none() => {
                                matches.add(entry, outcome, &event.clone().with_this(object))
                            }
                            _ => matches.add(entry, outcome, event),
                        }
                    }
                }
                EventOrigin::Retired => {}
            }
        }

        let effective = matches
            .policy
            .unwrap_or(SuspendPolicy::None)
            .max(batch.suspend_policy);
        let thread = batch.events.iter().find_map(|e| e.thread);
        let record = self.coordinator.apply_policy(effective, thread);

        for event in &batch.events {
            if event.kind == EventKind::ThreadDeath {
                if let Some(thread) = event.thread {
                    self.coordinator.thread_died(thread);
                }
            }
        }

        let set_policy = match matches.policy {
            Some(policy) => policy,
            None if owned => {
                debug!(
                    "Batch of {} event(s) belongs to cleared or filtered requests; resuming",
                    batch.events.len()
                );
                if effective != SuspendPolicy::None {
                    if let Err(e) = self.coordinator.resume_record(&record) {
                        warn!("Could not resume swallowed batch: {}", e);
                    }
                }
                return DispatchOutcome::Dropped { suspended: false };
            }
            None => {
                debug!(
                    "No request matched {} event(s); transport policy {:?} stays in effect",
                    batch.events.len(),
                    batch.suspend_policy
                );
                return DispatchOutcome::Dropped {
                    suspended: effective != SuspendPolicy::None,
                };
            }
        };

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let set = Arc::new(EventSet::new(
            sequence,
            set_policy,
            matches.events,
            record,
            self.coordinator.clone(),
        ));

        debug!(
            "Event set {}: {} event(s), policy {:?}",
            sequence,
            set.len(),
            set_policy
        );

        self.deliver(&set);

        for id in matches.expired {
            match self.registry.delete(id) {
                Ok(()) => info!("Request {} expired after its count filter", id),
                // already deleted by a listener
                Err(JdwpError::UnknownRequest(_)) => {}
                Err(e) => warn!("Failed to delete expired request {}: {}", id, e),
            }
        }

        DispatchOutcome::Delivered(set)
    }

    /// Invoke listeners in registration order: set received, one callback per
    /// event, set complete.
    pub fn deliver(&self, set: &EventSet) {
        for listener in self.listeners.snapshot() {
            listener.event_set_received(set);
            for event in set.events() {
                deliver_event(listener.as_ref(), set, event);
            }
            listener.event_set_complete(set);
        }
    }

    /// Deliver the terminal notification. Only the first call has an effect.
    pub fn disconnect(&self, cause: &DisconnectCause) -> bool {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Session ended: {}", cause);
        for listener in self.listeners.snapshot() {
            listener.disconnected(cause);
        }
        true
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

fn push_unique(matched: &mut Vec<MatchedEvent>, request: RequestId, event: &RawEvent) {
    if !matched
        .iter()
        .any(|m| m.request == request && m.event == *event)
    {
        matched.push(MatchedEvent {
            request,
            event: event.clone(),
        });
    }
}
