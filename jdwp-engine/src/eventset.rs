// Event sets
//
// An event set is what listeners receive: the events of one suspend point
// that matched at least one request, plus the suspension they caused.

use crate::eventrequest::{RequestId, SuspendPolicy};
use crate::protocol::JdwpResult;
use crate::rawevent::RawEvent;
use crate::suspend::{SuspendCoordinator, SuspendRecord};
use crate::types::ThreadId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedEvent {
    pub request: RequestId,
    pub event: RawEvent,
}

pub struct EventSet {
    sequence: u64,
    suspend_policy: SuspendPolicy,
    events: Vec<MatchedEvent>,
    record: Arc<SuspendRecord>,
    coordinator: Arc<SuspendCoordinator>,
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSet")
            .field("sequence", &self.sequence)
            .field("suspend_policy", &self.suspend_policy)
            .field("events", &self.events)
            .field("record", &self.record)
            .finish()
    }
}

impl EventSet {
    pub(crate) fn new(
        sequence: u64,
        suspend_policy: SuspendPolicy,
        events: Vec<MatchedEvent>,
        record: Arc<SuspendRecord>,
        coordinator: Arc<SuspendCoordinator>,
    ) -> Self {
        Self {
            sequence,
            suspend_policy,
            events,
            record,
            coordinator,
        }
    }

    /// Position in delivery order, starting at 1
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Strictest policy among the requests that matched
    pub fn suspend_policy(&self) -> SuspendPolicy {
        self.suspend_policy
    }

    /// The suspension actually recorded for this set; can be stricter than
    /// `suspend_policy` when the transport suspended more.
    pub fn suspend_record(&self) -> &SuspendRecord {
        &self.record
    }

    pub fn events(&self) -> &[MatchedEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Thread of the first event that has one
    pub fn thread(&self) -> Option<ThreadId> {
        self.events.iter().find_map(|e| e.event.thread)
    }

    pub fn requests(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.events.iter().map(|e| e.request)
    }

    /// Undo this set's suspension. Must be called at most once.
    pub fn resume(&self) -> JdwpResult<()> {
        self.coordinator.resume_record(&self.record)
    }

    pub fn is_resumed(&self) -> bool {
        self.record.is_resumed()
    }

    pub fn summary(&self) -> EventSetSummary {
        EventSetSummary {
            sequence: self.sequence,
            suspend_policy: self.suspend_policy,
            suspended_threads: self.record.threads().to_vec(),
            events: self.events.clone(),
        }
    }
}

/// Serializable view of an event set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSetSummary {
    pub sequence: u64,
    pub suspend_policy: SuspendPolicy,
    pub suspended_threads: Vec<ThreadId>,
    pub events: Vec<MatchedEvent>,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", content = "detail", rename_all = "snake_case")]
pub enum DisconnectCause {
    /// The target exited normally
    VmDeath,
    TransportClosed(String),
    ProtocolViolation(String),
    /// The debugger detached
    Detached,
}

impl DisconnectCause {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DisconnectCause::TransportClosed(_) | DisconnectCause::ProtocolViolation(_)
        )
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::VmDeath => write!(f, "target VM exited"),
            DisconnectCause::TransportClosed(reason) => write!(f, "transport closed: {}", reason),
            DisconnectCause::ProtocolViolation(reason) => write!(f, "protocol violation: {}", reason),
            DisconnectCause::Detached => write!(f, "detached"),
        }
    }
}
