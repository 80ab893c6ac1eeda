// Raw events
//
// A raw event is one occurrence reported by the debuggee, with names
// resolved, before it is matched against any request.

use crate::eventrequest::EventKind;
use crate::events::{EventDetails, WireEvent};
use crate::protocol::JdwpResult;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    None,
    Field {
        class_id: ReferenceTypeId,
        field_id: FieldId,
        /// Zero for static fields
        object: ObjectId,
        value_to_be: Option<Value>,
    },
    Exception {
        exception: ObjectId,
        exception_class: Option<ReferenceTypeId>,
        catch_location: Option<Location>,
    },
    Monitor {
        monitor: ObjectId,
        timeout: Option<i64>,
        timed_out: Option<bool>,
    },
    ClassPrepare {
        class_id: ReferenceTypeId,
        class_name: String,
        source_name: Option<String>,
        status: i32,
    },
    ClassUnload {
        class_name: String,
    },
    MethodExit {
        return_value: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub kind: EventKind,
    pub thread: Option<ThreadId>,
    pub location: Option<EventLocation>,
    /// `None` when raised from a static context or when unknown
    pub this_object: Option<ObjectId>,
    pub payload: EventPayload,
}

impl RawEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            thread: None,
            location: None,
            this_object: None,
            payload: EventPayload::None,
        }
    }

    pub fn with_thread(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn with_location(mut self, location: EventLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_this(mut self, object: ObjectId) -> Self {
        self.this_object = Some(object);
        self
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    /// The class name class filters are matched against
    pub fn subject_class(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::ClassPrepare { class_name, .. }
            | EventPayload::ClassUnload { class_name } => Some(class_name),
            _ => self
                .location
                .as_ref()
                .map(|l| l.declaring_type.as_str())
                .filter(|name| !name.is_empty()),
        }
    }

    pub fn source_name(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::ClassPrepare { source_name, .. } => source_name.as_deref(),
            _ => self.location.as_ref().and_then(|l| l.source_name.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ClassMetadata {
    name: String,
    source_name: Option<String>,
}

/// Class id to name mapping used to resolve wire locations.
///
/// Filled from class prepare events and by callers that know more (for
/// example after querying the VM for loaded classes). Methods and lines are
/// looked up the same way when registered.
#[derive(Debug, Default)]
pub struct ClassNameCache {
    classes: Mutex<HashMap<ReferenceTypeId, ClassMetadata>>,
    methods: Mutex<HashMap<(ReferenceTypeId, MethodId), String>>,
}

impl ClassNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_class(
        &self,
        class_id: ReferenceTypeId,
        name: impl Into<String>,
        source_name: Option<String>,
    ) {
        let mut classes = self.classes.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = classes.entry(class_id).or_default();
        entry.name = name.into();
        if source_name.is_some() {
            entry.source_name = source_name;
        }
    }

    pub fn register_method(&self, class_id: ReferenceTypeId, method_id: MethodId, name: impl Into<String>) {
        self.methods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((class_id, method_id), name.into());
    }

    pub fn class_name(&self, class_id: ReferenceTypeId) -> Option<String> {
        self.classes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&class_id)
            .map(|c| c.name.clone())
    }

    pub fn source_name(&self, class_id: ReferenceTypeId) -> Option<String> {
        self.classes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&class_id)
            .and_then(|c| c.source_name.clone())
    }

    fn resolve(&self, location: Location) -> EventLocation {
        let (declaring_type, source_name) = {
            let classes = self.classes.lock().unwrap_or_else(PoisonError::into_inner);
            match classes.get(&location.class_id) {
                Some(meta) => (meta.name.clone(), meta.source_name.clone()),
                None => (String::new(), None),
            }
        };
        let method = self
            .methods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(location.class_id, location.method_id))
            .cloned()
            .unwrap_or_default();

        EventLocation {
            location,
            declaring_type,
            method,
            line: None,
            source_name,
        }
    }

    /// Turn a decoded wire event into a raw event, learning class names on the way
    pub fn to_raw(&self, event: &WireEvent) -> JdwpResult<RawEvent> {
        let kind = EventKind::from_code(event.kind)?;
        let raw = RawEvent::new(kind);

        Ok(match &event.details {
            EventDetails::VMStart { thread }
            | EventDetails::ThreadStart { thread }
            | EventDetails::ThreadDeath { thread } => raw.with_thread(*thread),
            EventDetails::VMDeath => raw,
            EventDetails::Breakpoint { thread, location }
            | EventDetails::Step { thread, location }
            | EventDetails::MethodEntry { thread, location } => {
                raw.with_thread(*thread).with_location(self.resolve(*location))
            }
            EventDetails::MethodExit {
                thread,
                location,
                return_value,
            } => raw
                .with_thread(*thread)
                .with_location(self.resolve(*location))
                .with_payload(EventPayload::MethodExit {
                    return_value: return_value.clone(),
                }),
            EventDetails::Exception {
                thread,
                location,
                exception,
                catch_location,
            } => raw
                .with_thread(*thread)
                .with_location(self.resolve(*location))
                .with_payload(EventPayload::Exception {
                    exception: *exception,
                    exception_class: None,
                    catch_location: *catch_location,
                }),
            EventDetails::FieldAccess {
                thread,
                location,
                ref_type,
                field_id,
                object,
                value_to_be,
            } => {
                let mut raw = raw
                    .with_thread(*thread)
                    .with_location(self.resolve(*location))
                    .with_payload(EventPayload::Field {
                        class_id: *ref_type,
                        field_id: *field_id,
                        object: *object,
                        value_to_be: value_to_be.clone(),
                    });
                if *object != 0 {
                    raw.this_object = Some(*object);
                }
                raw
            }
            EventDetails::MonitorContended {
                thread,
                monitor,
                location,
            } => raw
                .with_thread(*thread)
                .with_location(self.resolve(*location))
                .with_payload(EventPayload::Monitor {
                    monitor: *monitor,
                    timeout: None,
                    timed_out: None,
                }),
            EventDetails::MonitorWait {
                thread,
                monitor,
                location,
                timeout,
            } => raw
                .with_thread(*thread)
                .with_location(self.resolve(*location))
                .with_payload(EventPayload::Monitor {
                    monitor: *monitor,
                    timeout: Some(*timeout),
                    timed_out: None,
                }),
            EventDetails::MonitorWaited {
                thread,
                monitor,
                location,
                timed_out,
            } => raw
                .with_thread(*thread)
                .with_location(self.resolve(*location))
                .with_payload(EventPayload::Monitor {
                    monitor: *monitor,
                    timeout: None,
                    timed_out: Some(*timed_out),
                }),
            EventDetails::ClassPrepare {
                thread,
                ref_type,
                signature,
                status,
            } => {
                let class_name = signature_to_class_name(signature);
                self.register_class(*ref_type, class_name.clone(), None);
                raw.with_thread(*thread).with_payload(EventPayload::ClassPrepare {
                    class_id: *ref_type,
                    class_name,
                    source_name: self.source_name(*ref_type),
                    status: *status,
                })
            }
            EventDetails::ClassUnload { signature } => raw.with_payload(EventPayload::ClassUnload {
                class_name: signature_to_class_name(signature),
            }),
        })
    }
}
