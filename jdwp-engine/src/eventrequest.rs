// Event request model and EventRequest command implementations
//
// An event request is a filterable subscription to one kind of debuggee
// occurrence. Requests are described with a `RequestBuilder`, registered in
// the `RequestRegistry`, and mirrored to the VM with EventRequest.Set/Clear.

use crate::commands::{command_sets, event_commands, event_kinds, modifier_kinds};
use crate::connection::JdwpConnection;
use crate::filter::{self, ClassPattern};
use crate::protocol::{CommandPacket, JdwpError, JdwpResult};
use crate::reader::read_i32;
use crate::types::{FieldId, Location, ObjectId, ReferenceTypeId, ThreadId};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Engine-local identifier of an event request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Suspend policy for events, ordered from weakest to strictest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SuspendPolicy {
    None = 0,
    EventThread = 1,
    All = 2,
}

impl SuspendPolicy {
    pub fn from_code(code: u8) -> JdwpResult<Self> {
        match code {
            0 => Ok(SuspendPolicy::None),
            1 => Ok(SuspendPolicy::EventThread),
            2 => Ok(SuspendPolicy::All),
            other => Err(JdwpError::ProtocolViolation(format!(
                "Invalid suspend policy: {}",
                other
            ))),
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl Default for SuspendPolicy {
    fn default() -> Self {
        SuspendPolicy::All
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Breakpoint,
    SingleStep,
    FieldAccess,
    FieldModification,
    MethodEntry,
    MethodExit,
    ThreadStart,
    ThreadDeath,
    ClassPrepare,
    ClassUnload,
    Exception,
    MonitorContendedEnter,
    MonitorContendedEntered,
    MonitorWait,
    MonitorWaited,
    VmStart,
    VmDeath,
}

impl EventKind {
    pub const ALL: [EventKind; 17] = [
        EventKind::Breakpoint,
        EventKind::SingleStep,
        EventKind::FieldAccess,
        EventKind::FieldModification,
        EventKind::MethodEntry,
        EventKind::MethodExit,
        EventKind::ThreadStart,
        EventKind::ThreadDeath,
        EventKind::ClassPrepare,
        EventKind::ClassUnload,
        EventKind::Exception,
        EventKind::MonitorContendedEnter,
        EventKind::MonitorContendedEntered,
        EventKind::MonitorWait,
        EventKind::MonitorWaited,
        EventKind::VmStart,
        EventKind::VmDeath,
    ];

    /// Map a JDWP event kind code. Method exit with return value folds into
    /// `MethodExit`.
    pub fn from_code(code: u8) -> JdwpResult<Self> {
        Ok(match code {
            event_kinds::BREAKPOINT => EventKind::Breakpoint,
            event_kinds::SINGLE_STEP => EventKind::SingleStep,
            event_kinds::FIELD_ACCESS => EventKind::FieldAccess,
            event_kinds::FIELD_MODIFICATION => EventKind::FieldModification,
            event_kinds::METHOD_ENTRY => EventKind::MethodEntry,
            event_kinds::METHOD_EXIT | event_kinds::METHOD_EXIT_WITH_RETURN_VALUE => {
                EventKind::MethodExit
            }
            event_kinds::THREAD_START => EventKind::ThreadStart,
            event_kinds::THREAD_DEATH => EventKind::ThreadDeath,
            event_kinds::CLASS_PREPARE => EventKind::ClassPrepare,
            event_kinds::CLASS_UNLOAD => EventKind::ClassUnload,
            event_kinds::EXCEPTION => EventKind::Exception,
            event_kinds::MONITOR_CONTENDED_ENTER => EventKind::MonitorContendedEnter,
            event_kinds::MONITOR_CONTENDED_ENTERED => EventKind::MonitorContendedEntered,
            event_kinds::MONITOR_WAIT => EventKind::MonitorWait,
            event_kinds::MONITOR_WAITED => EventKind::MonitorWaited,
            event_kinds::VM_START => EventKind::VmStart,
            event_kinds::VM_DEATH => EventKind::VmDeath,
            other => return Err(JdwpError::InvalidKind(format!("unknown event kind code {}", other))),
        })
    }

    pub fn code(self) -> u8 {
        match self {
            EventKind::Breakpoint => event_kinds::BREAKPOINT,
            EventKind::SingleStep => event_kinds::SINGLE_STEP,
            EventKind::FieldAccess => event_kinds::FIELD_ACCESS,
            EventKind::FieldModification => event_kinds::FIELD_MODIFICATION,
            EventKind::MethodEntry => event_kinds::METHOD_ENTRY,
            EventKind::MethodExit => event_kinds::METHOD_EXIT,
            EventKind::ThreadStart => event_kinds::THREAD_START,
            EventKind::ThreadDeath => event_kinds::THREAD_DEATH,
            EventKind::ClassPrepare => event_kinds::CLASS_PREPARE,
            EventKind::ClassUnload => event_kinds::CLASS_UNLOAD,
            EventKind::Exception => event_kinds::EXCEPTION,
            EventKind::MonitorContendedEnter => event_kinds::MONITOR_CONTENDED_ENTER,
            EventKind::MonitorContendedEntered => event_kinds::MONITOR_CONTENDED_ENTERED,
            EventKind::MonitorWait => event_kinds::MONITOR_WAIT,
            EventKind::MonitorWaited => event_kinds::MONITOR_WAITED,
            EventKind::VmStart => event_kinds::VM_START,
            EventKind::VmDeath => event_kinds::VM_DEATH,
        }
    }

    /// VM start is generated automatically and has no request.
    pub fn is_requestable(self) -> bool {
        self != EventKind::VmStart
    }

    /// Kinds whose requests must be bound to a location, field or thread at creation.
    pub fn requires_target(self) -> bool {
        matches!(
            self,
            EventKind::Breakpoint
                | EventKind::SingleStep
                | EventKind::FieldAccess
                | EventKind::FieldModification
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSize {
    Min,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDepth {
    Into,
    Over,
    Out,
}

/// Kind-specific binding fixed when the request is created
#[derive(Debug, Clone, PartialEq)]
pub enum RequestTarget {
    None,
    Location(Location),
    Field {
        class_id: ReferenceTypeId,
        field_id: FieldId,
    },
    Step {
        thread: ThreadId,
        size: StepSize,
        depth: StepDepth,
    },
    Exception {
        /// `None` reports exceptions of every class
        class_id: Option<ReferenceTypeId>,
        caught: bool,
        uncaught: bool,
    },
}

/// A predicate narrowing which raw events satisfy a request.
///
/// All filters of a request must pass. `Count` is the only stateful filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    ClassMatch(ClassPattern),
    ClassExclude(ClassPattern),
    ThreadOnly(ThreadId),
    InstanceOnly(ObjectId),
    Count(u32),
    SourceNameMatch(ClassPattern),
}

impl Filter {
    pub fn class_match(pattern: &str) -> JdwpResult<Self> {
        Ok(Filter::ClassMatch(ClassPattern::parse(pattern)?))
    }

    pub fn class_exclude(pattern: &str) -> JdwpResult<Self> {
        Ok(Filter::ClassExclude(ClassPattern::parse(pattern)?))
    }

    pub fn source_name_match(pattern: &str) -> JdwpResult<Self> {
        Ok(Filter::SourceNameMatch(ClassPattern::parse(pattern)?))
    }

    pub fn count(n: u32) -> JdwpResult<Self> {
        if n == 0 {
            return Err(JdwpError::IllegalArgument(
                "count filter must be greater than zero".to_string(),
            ));
        }
        Ok(Filter::Count(n))
    }

    /// Filters are evaluated phase by phase; lower phases first.
    pub(crate) fn phase(&self) -> u8 {
        match self {
            Filter::ClassMatch(_) | Filter::ClassExclude(_) | Filter::SourceNameMatch(_) => 0,
            Filter::ThreadOnly(_) | Filter::InstanceOnly(_) => 1,
            Filter::Count(_) => 2,
        }
    }

    pub(crate) fn validate(&self) -> JdwpResult<()> {
        match self {
            Filter::Count(0) => Err(JdwpError::IllegalArgument(
                "count filter must be greater than zero".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Describes a request before it is registered.
///
/// Filters added here become the request's initial filter list, so the usual
/// "add filters, then enable" sequence is expressed as builder calls followed
/// by `RequestRegistry::create`.
#[derive(Debug)]
pub struct RequestBuilder {
    pub(crate) kind: EventKind,
    pub(crate) target: RequestTarget,
    pub(crate) suspend_policy: SuspendPolicy,
    pub(crate) filters: Vec<Filter>,
    pub(crate) properties: HashMap<String, serde_json::Value>,
    pub(crate) enabled: bool,
    pub(crate) error: Option<JdwpError>,
}

impl RequestBuilder {
    fn with_target(kind: EventKind, target: RequestTarget) -> Self {
        Self {
            kind,
            target,
            suspend_policy: SuspendPolicy::default(),
            filters: Vec::new(),
            properties: HashMap::new(),
            enabled: false,
            error: None,
        }
    }

    /// Request for a kind that needs no binding (thread start, class prepare, ...)
    pub fn of_kind(kind: EventKind) -> Self {
        Self::with_target(kind, RequestTarget::None)
    }

    pub fn breakpoint(location: Location) -> Self {
        Self::with_target(EventKind::Breakpoint, RequestTarget::Location(location))
    }

    pub fn step(thread: ThreadId, size: StepSize, depth: StepDepth) -> Self {
        Self::with_target(
            EventKind::SingleStep,
            RequestTarget::Step {
                thread,
                size,
                depth,
            },
        )
    }

    pub fn access_watchpoint(class_id: ReferenceTypeId, field_id: FieldId) -> Self {
        Self::with_target(
            EventKind::FieldAccess,
            RequestTarget::Field { class_id, field_id },
        )
    }

    pub fn modification_watchpoint(class_id: ReferenceTypeId, field_id: FieldId) -> Self {
        Self::with_target(
            EventKind::FieldModification,
            RequestTarget::Field { class_id, field_id },
        )
    }

    pub fn exception(class_id: Option<ReferenceTypeId>, caught: bool, uncaught: bool) -> Self {
        Self::with_target(
            EventKind::Exception,
            RequestTarget::Exception {
                class_id,
                caught,
                uncaught,
            },
        )
    }

    pub fn suspend_policy(mut self, policy: SuspendPolicy) -> Self {
        self.suspend_policy = policy;
        self
    }

    pub fn filter(mut self, filter: JdwpResult<Filter>) -> Self {
        match filter {
            Ok(f) => self.filters.push(f),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn class_filter(self, pattern: &str) -> Self {
        self.filter(Filter::class_match(pattern))
    }

    pub fn class_exclusion_filter(self, pattern: &str) -> Self {
        self.filter(Filter::class_exclude(pattern))
    }

    pub fn source_name_filter(self, pattern: &str) -> Self {
        self.filter(Filter::source_name_match(pattern))
    }

    pub fn thread_filter(self, thread: ThreadId) -> Self {
        self.filter(Ok(Filter::ThreadOnly(thread)))
    }

    pub fn instance_filter(self, object: ObjectId) -> Self {
        self.filter(Ok(Filter::InstanceOnly(object)))
    }

    pub fn count_filter(self, count: u32) -> Self {
        self.filter(Filter::count(count))
    }

    pub fn property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Register the request already enabled
    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }
}

fn put_pattern(buf: &mut Vec<u8>, pattern: &ClassPattern) {
    let glob = pattern.to_string();
    buf.put_u32(glob.len() as u32);
    buf.put_slice(glob.as_bytes());
}

fn put_binding(buf: &mut Vec<u8>, target: &RequestTarget) {
    match target {
        RequestTarget::None => {}
        RequestTarget::Location(location) => {
            buf.put_u8(modifier_kinds::LOCATION_ONLY);
            buf.put_u8(location.type_tag);
            buf.put_u64(location.class_id);
            buf.put_u64(location.method_id);
            buf.put_u64(location.index);
        }
        RequestTarget::Field { class_id, field_id } => {
            buf.put_u8(modifier_kinds::FIELD_ONLY);
            buf.put_u64(*class_id);
            buf.put_u64(*field_id);
        }
        RequestTarget::Step {
            thread,
            size,
            depth,
        } => {
            buf.put_u8(modifier_kinds::STEP);
            buf.put_u64(*thread);
            buf.put_i32(match size {
                StepSize::Min => crate::commands::step_sizes::MIN,
                StepSize::Line => crate::commands::step_sizes::LINE,
            });
            buf.put_i32(match depth {
                StepDepth::Into => crate::commands::step_depths::INTO,
                StepDepth::Over => crate::commands::step_depths::OVER,
                StepDepth::Out => crate::commands::step_depths::OUT,
            });
        }
        RequestTarget::Exception {
            class_id,
            caught,
            uncaught,
        } => {
            buf.put_u8(modifier_kinds::EXCEPTION_ONLY);
            buf.put_u64(class_id.unwrap_or(0));
            buf.put_u8(*caught as u8);
            buf.put_u8(*uncaught as u8);
        }
    }
}

fn put_filter(buf: &mut Vec<u8>, filter: &Filter) {
    match filter {
        Filter::Count(count) => {
            buf.put_u8(modifier_kinds::COUNT);
            buf.put_i32(*count as i32);
        }
        Filter::ThreadOnly(thread) => {
            buf.put_u8(modifier_kinds::THREAD_ONLY);
            buf.put_u64(*thread);
        }
        Filter::ClassMatch(pattern) => {
            buf.put_u8(modifier_kinds::CLASS_MATCH);
            put_pattern(buf, pattern);
        }
        Filter::ClassExclude(pattern) => {
            buf.put_u8(modifier_kinds::CLASS_EXCLUDE);
            put_pattern(buf, pattern);
        }
        Filter::InstanceOnly(object) => {
            buf.put_u8(modifier_kinds::INSTANCE_ONLY);
            buf.put_u64(*object);
        }
        Filter::SourceNameMatch(pattern) => {
            buf.put_u8(modifier_kinds::SOURCE_NAME_MATCH);
            put_pattern(buf, pattern);
        }
    }
}

impl JdwpConnection {
    /// Install an event request in the VM (EventRequest.Set command)
    ///
    /// The binding goes first, then every filter the VM can apply for this
    /// kind, counts last. Filters it cannot apply stay with the engine.
    /// Returns the VM's request ID.
    pub async fn set_event_request(
        &mut self,
        kind: EventKind,
        suspend_policy: SuspendPolicy,
        target: &RequestTarget,
        filters: &[Filter],
    ) -> JdwpResult<i32> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(id, command_sets::EVENT_REQUEST, event_commands::SET);

        packet.data.put_u8(kind.code());
        packet.data.put_u8(suspend_policy.code());

        let mirrored = filter::mirrored_filters(kind, filters);
        let binding = usize::from(*target != RequestTarget::None);
        packet.data.put_i32((binding + mirrored.len()) as i32);

        put_binding(&mut packet.data, target);
        for f in mirrored {
            put_filter(&mut packet.data, f);
        }

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        let request_id = read_i32(&mut data)?;

        Ok(request_id)
    }

    /// Clear an event request by VM request ID (EventRequest.Clear command)
    pub async fn clear_event_request(&mut self, kind: EventKind, request_id: i32) -> JdwpResult<()> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(id, command_sets::EVENT_REQUEST, event_commands::CLEAR);

        packet.data.put_u8(kind.code());
        packet.data.put_i32(request_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        Ok(())
    }
}
