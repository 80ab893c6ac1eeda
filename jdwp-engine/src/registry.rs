// Request registry
//
// Owns every live event request. The dispatcher never iterates the registry
// itself: it takes a snapshot, so requests can be created, disabled or
// deleted from any thread (including listener callbacks) while a dispatch
// pass is running.

use crate::control::{ControlChannel, ControlCommand};
use crate::eventrequest::{EventKind, Filter, RequestBuilder, RequestId, RequestTarget, SuspendPolicy};
use crate::filter::{self, FilterOutcome};
use crate::protocol::{JdwpError, JdwpResult};
use crate::rawevent::RawEvent;
use crate::types::ObjectId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Debug)]
struct EntryState {
    enabled: bool,
    deleted: bool,
    filters: Vec<Filter>,
    properties: HashMap<String, serde_json::Value>,
}

/// A registered request. Kind, binding and suspend policy never change.
#[derive(Debug)]
pub struct RequestEntry {
    id: RequestId,
    kind: EventKind,
    target: RequestTarget,
    suspend_policy: SuspendPolicy,
    state: Mutex<EntryState>,
}

impl RequestEntry {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn suspend_policy(&self) -> SuspendPolicy {
        self.suspend_policy
    }

    fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        let state = self.state();
        state.enabled && !state.deleted
    }

    /// Match one event. Disabled and deleted requests never match, even when
    /// they are still part of an older snapshot.
    pub(crate) fn evaluate(&self, event: &RawEvent) -> FilterOutcome {
        if event.kind != self.kind {
            return FilterOutcome::Rejected;
        }
        let mut state = self.state();
        if !state.enabled || state.deleted {
            return FilterOutcome::Rejected;
        }
        filter::evaluate(&self.target, &mut state.filters, event)
    }

    /// Match an event the VM reported for this request
    pub(crate) fn evaluate_reported(&self, event: &RawEvent) -> FilterOutcome {
        if event.kind != self.kind {
            return FilterOutcome::Rejected;
        }
        let mut state = self.state();
        if !state.enabled || state.deleted {
            return FilterOutcome::Rejected;
        }
        filter::evaluate_reported(self.kind, &mut state.filters, event)
    }

    /// The instance the VM restricted this request to, if it did
    pub(crate) fn mirrored_instance(&self) -> Option<ObjectId> {
        let state = self.state();
        state.filters.iter().find_map(|f| match f {
            Filter::InstanceOnly(object) if filter::is_mirrored(self.kind, f, &state.filters) => {
                Some(*object)
            }
            _ => None,
        })
    }
}

/// Read-only view of a request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestInfo {
    pub id: RequestId,
    pub kind: EventKind,
    pub target: RequestTarget,
    pub suspend_policy: SuspendPolicy,
    pub enabled: bool,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: u32,
    // creation order
    requests: Vec<Arc<RequestEntry>>,
}

#[derive(Debug)]
pub struct RequestRegistry {
    inner: Mutex<RegistryInner>,
    control: ControlChannel,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new(ControlChannel::detached())
    }
}

impl RequestRegistry {
    pub fn new(control: ControlChannel) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                next_id: 1,
                requests: Vec::new(),
            }),
            control,
        }
    }

    fn inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, id: RequestId) -> JdwpResult<Arc<RequestEntry>> {
        self.inner()
            .requests
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(JdwpError::UnknownRequest(id))
    }

    /// Register a request described by a builder. New requests are disabled
    /// unless the builder asked otherwise.
    pub fn create(&self, builder: RequestBuilder) -> JdwpResult<RequestId> {
        if let Some(e) = builder.error {
            return Err(e);
        }
        if !builder.kind.is_requestable() {
            return Err(JdwpError::InvalidKind(format!(
                "{} events are generated automatically and cannot be requested",
                builder.kind
            )));
        }
        if builder.kind.requires_target() && builder.target == RequestTarget::None {
            return Err(JdwpError::InvalidKind(format!(
                "{} requests must be bound to a target at creation",
                builder.kind
            )));
        }
        for f in &builder.filters {
            f.validate()?;
        }

        let enabled = builder.enabled;
        let id = {
            let mut inner = self.inner();
            let id = RequestId(inner.next_id);
            inner.next_id += 1;
            inner.requests.push(Arc::new(RequestEntry {
                id,
                kind: builder.kind,
                target: builder.target,
                suspend_policy: builder.suspend_policy,
                state: Mutex::new(EntryState {
                    enabled: false,
                    deleted: false,
                    filters: builder.filters,
                    properties: builder.properties,
                }),
            }));
            id
        };

        debug!("Created request {} ({})", id, builder.kind);

        if enabled {
            self.enable(id)?;
        }
        Ok(id)
    }

    /// Create a request from a JDWP event kind code and an initial filter list
    pub fn create_raw(&self, kind_code: u8, filters: Vec<Filter>) -> JdwpResult<RequestId> {
        let kind = EventKind::from_code(kind_code)?;
        let builder = filters
            .into_iter()
            .fold(RequestBuilder::of_kind(kind), |b, f| b.filter(Ok(f)));
        self.create(builder)
    }

    pub fn enable(&self, id: RequestId) -> JdwpResult<()> {
        let entry = self.entry(id)?;
        let install = {
            let mut state = entry.state();
            let changed = !state.enabled;
            state.enabled = true;
            changed.then(|| state.filters.clone())
        };
        if let Some(filters) = install {
            debug!("Enabled request {}", id);
            self.control.send(ControlCommand::Install {
                id,
                kind: entry.kind,
                suspend_policy: entry.suspend_policy,
                target: entry.target.clone(),
                filters,
            });
        }
        Ok(())
    }

    pub fn disable(&self, id: RequestId) -> JdwpResult<()> {
        let entry = self.entry(id)?;
        let changed = {
            let mut state = entry.state();
            let changed = state.enabled;
            state.enabled = false;
            changed
        };
        if changed {
            debug!("Disabled request {}", id);
            self.control.send(ControlCommand::Clear { id });
        }
        Ok(())
    }

    pub fn is_enabled(&self, id: RequestId) -> JdwpResult<bool> {
        Ok(self.entry(id)?.is_enabled())
    }

    /// Append a filter. Only allowed while the request is disabled.
    pub fn add_filter(&self, id: RequestId, filter: Filter) -> JdwpResult<()> {
        filter.validate()?;
        let entry = self.entry(id)?;
        let mut state = entry.state();
        if state.enabled {
            return Err(JdwpError::RequestAlreadyEnabled(id));
        }
        state.filters.push(filter);
        Ok(())
    }

    pub fn delete(&self, id: RequestId) -> JdwpResult<()> {
        let entry = {
            let mut inner = self.inner();
            let pos = inner
                .requests
                .iter()
                .position(|e| e.id == id)
                .ok_or(JdwpError::UnknownRequest(id))?;
            inner.requests.remove(pos)
        };
        self.retire(&entry);
        debug!("Deleted request {}", id);
        Ok(())
    }

    /// Delete every request of one kind, returning how many were removed
    pub fn delete_all(&self, kind: EventKind) -> usize {
        let removed: Vec<Arc<RequestEntry>> = {
            let mut inner = self.inner();
            let (gone, kept): (Vec<_>, Vec<_>) =
                inner.requests.drain(..).partition(|e| e.kind == kind);
            inner.requests = kept;
            gone
        };
        for entry in &removed {
            self.retire(entry);
        }
        if !removed.is_empty() {
            info!("Deleted {} {} request(s)", removed.len(), kind);
        }
        removed.len()
    }

    /// Delete every request
    pub fn clear(&self) {
        let removed = std::mem::take(&mut self.inner().requests);
        for entry in &removed {
            self.retire(entry);
        }
    }

    fn retire(&self, entry: &RequestEntry) {
        let was_enabled = {
            let mut state = entry.state();
            state.deleted = true;
            std::mem::replace(&mut state.enabled, false)
        };
        if was_enabled {
            self.control.send(ControlCommand::Clear { id: entry.id });
        }
    }

    pub fn set_property(&self, id: RequestId, key: impl Into<String>, value: serde_json::Value) -> JdwpResult<()> {
        self.entry(id)?.state().properties.insert(key.into(), value);
        Ok(())
    }

    pub fn get_property(&self, id: RequestId, key: &str) -> JdwpResult<Option<serde_json::Value>> {
        Ok(self.entry(id)?.state().properties.get(key).cloned())
    }

    pub fn get(&self, id: RequestId) -> JdwpResult<RequestInfo> {
        let entry = self.entry(id)?;
        let state = entry.state();
        Ok(RequestInfo {
            id: entry.id,
            kind: entry.kind,
            target: entry.target.clone(),
            suspend_policy: entry.suspend_policy,
            enabled: state.enabled,
            filters: state.filters.clone(),
        })
    }

    pub fn requests_of_kind(&self, kind: EventKind) -> Vec<RequestId> {
        self.inner()
            .requests
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.id)
            .collect()
    }

    /// Whether an enabled request of `kind` satisfies `pred`
    pub(crate) fn any_enabled(
        &self,
        kind: EventKind,
        pred: impl Fn(&RequestTarget, &[Filter]) -> bool,
    ) -> bool {
        self.snapshot().iter().any(|entry| {
            if entry.kind != kind {
                return false;
            }
            let state = entry.state();
            state.enabled && !state.deleted && pred(&entry.target, &state.filters)
        })
    }

    /// Copy of the live requests, in creation order
    pub fn snapshot(&self) -> Vec<Arc<RequestEntry>> {
        self.inner().requests.clone()
    }

    pub fn len(&self) -> usize {
        self.inner().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
