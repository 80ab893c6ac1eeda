// JDWP composite event decoding
//
// Events are sent from the JVM as Event.Composite command packets. This
// module turns the packet body into a `WireEventSet`; matching against
// requests happens later, in the dispatcher.

use crate::commands::event_kinds;
use crate::eventrequest::SuspendPolicy;
use crate::protocol::{JdwpError, JdwpResult};
use crate::reader::{
    read_i32, read_location, read_string, read_tagged_object, read_u64, read_u8, read_value,
    read_bool,
};
use crate::types::*;
use serde::{Deserialize, Serialize};

/// Composite event packet (can contain multiple events)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEventSet {
    pub suspend_policy: SuspendPolicy,
    pub events: Vec<WireEvent>,
}

/// Single event within a composite packet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    pub kind: u8,
    /// The VM's request id; zero for automatically generated events
    pub request_id: i32,
    pub details: EventDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventDetails {
    VMStart {
        thread: ThreadId,
    },
    VMDeath,
    ThreadStart {
        thread: ThreadId,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    ClassPrepare {
        thread: ThreadId,
        ref_type: ReferenceTypeId,
        signature: String,
        status: i32,
    },
    ClassUnload {
        signature: String,
    },
    Breakpoint {
        thread: ThreadId,
        location: Location,
    },
    Step {
        thread: ThreadId,
        location: Location,
    },
    Exception {
        thread: ThreadId,
        location: Location,
        exception: ObjectId,
        catch_location: Option<Location>,
    },
    MethodEntry {
        thread: ThreadId,
        location: Location,
    },
    MethodExit {
        thread: ThreadId,
        location: Location,
        return_value: Option<Value>,
    },
    FieldAccess {
        thread: ThreadId,
        location: Location,
        ref_type: ReferenceTypeId,
        field_id: FieldId,
        object: ObjectId,
        value_to_be: Option<Value>,
    },
    MonitorContended {
        thread: ThreadId,
        monitor: ObjectId,
        location: Location,
    },
    MonitorWait {
        thread: ThreadId,
        monitor: ObjectId,
        location: Location,
        timeout: i64,
    },
    MonitorWaited {
        thread: ThreadId,
        monitor: ObjectId,
        location: Location,
        timed_out: bool,
    },
}

/// Parse an event packet body from JDWP
///
/// An unknown event kind is a protocol violation: the remaining bytes cannot
/// be framed, so the whole packet is rejected.
pub fn parse_event_packet(data: &[u8]) -> JdwpResult<WireEventSet> {
    let mut buf = data;

    let suspend_policy = SuspendPolicy::from_code(read_u8(&mut buf)?)?;

    let event_count = read_i32(&mut buf)?;
    if event_count < 0 {
        return Err(JdwpError::ProtocolViolation(format!(
            "Negative event count: {}",
            event_count
        )));
    }

    let mut events = Vec::with_capacity(event_count.min(64) as usize);

    for _ in 0..event_count {
        let kind = read_u8(&mut buf)?;
        let request_id = read_i32(&mut buf)?;

        let details = match kind {
            event_kinds::BREAKPOINT => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventDetails::Breakpoint { thread, location }
            }
            event_kinds::SINGLE_STEP => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventDetails::Step { thread, location }
            }
            event_kinds::METHOD_ENTRY => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventDetails::MethodEntry { thread, location }
            }
            event_kinds::METHOD_EXIT | event_kinds::METHOD_EXIT_WITH_RETURN_VALUE => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                let return_value = if kind == event_kinds::METHOD_EXIT_WITH_RETURN_VALUE {
                    Some(read_value(&mut buf)?)
                } else {
                    None
                };
                EventDetails::MethodExit {
                    thread,
                    location,
                    return_value,
                }
            }
            event_kinds::EXCEPTION => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                let exception = read_tagged_object(&mut buf)?;
                let catch = read_location(&mut buf)?;
                // A zero class id means the exception is not caught
                let catch_location = if catch.class_id == 0 { None } else { Some(catch) };
                EventDetails::Exception {
                    thread,
                    location,
                    exception,
                    catch_location,
                }
            }
            event_kinds::FIELD_ACCESS | event_kinds::FIELD_MODIFICATION => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                let _ref_type_tag = read_u8(&mut buf)?;
                let ref_type = read_u64(&mut buf)?;
                let field_id = read_u64(&mut buf)?;
                let object = read_tagged_object(&mut buf)?;
                let value_to_be = if kind == event_kinds::FIELD_MODIFICATION {
                    Some(read_value(&mut buf)?)
                } else {
                    None
                };
                EventDetails::FieldAccess {
                    thread,
                    location,
                    ref_type,
                    field_id,
                    object,
                    value_to_be,
                }
            }
            event_kinds::MONITOR_CONTENDED_ENTER | event_kinds::MONITOR_CONTENDED_ENTERED => {
                let thread = read_u64(&mut buf)?;
                let monitor = read_tagged_object(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventDetails::MonitorContended {
                    thread,
                    monitor,
                    location,
                }
            }
            event_kinds::MONITOR_WAIT => {
                let thread = read_u64(&mut buf)?;
                let monitor = read_tagged_object(&mut buf)?;
                let location = read_location(&mut buf)?;
                let timeout = read_u64(&mut buf)? as i64;
                EventDetails::MonitorWait {
                    thread,
                    monitor,
                    location,
                    timeout,
                }
            }
            event_kinds::MONITOR_WAITED => {
                let thread = read_u64(&mut buf)?;
                let monitor = read_tagged_object(&mut buf)?;
                let location = read_location(&mut buf)?;
                let timed_out = read_bool(&mut buf)?;
                EventDetails::MonitorWaited {
                    thread,
                    monitor,
                    location,
                    timed_out,
                }
            }
            event_kinds::VM_START => {
                let thread = read_u64(&mut buf)?;
                EventDetails::VMStart { thread }
            }
            event_kinds::VM_DEATH => EventDetails::VMDeath,
            event_kinds::THREAD_START => {
                let thread = read_u64(&mut buf)?;
                EventDetails::ThreadStart { thread }
            }
            event_kinds::THREAD_DEATH => {
                let thread = read_u64(&mut buf)?;
                EventDetails::ThreadDeath { thread }
            }
            event_kinds::CLASS_PREPARE => {
                let thread = read_u64(&mut buf)?;
                let _ref_type_tag = read_u8(&mut buf)?;
                let ref_type = read_u64(&mut buf)?;
                let signature = read_string(&mut buf)?;
                let status = read_i32(&mut buf)?;
                EventDetails::ClassPrepare {
                    thread,
                    ref_type,
                    signature,
                    status,
                }
            }
            event_kinds::CLASS_UNLOAD => {
                let signature = read_string(&mut buf)?;
                EventDetails::ClassUnload { signature }
            }
            _ => {
                return Err(JdwpError::ProtocolViolation(format!(
                    "Unsupported event kind in composite packet: {}",
                    kind
                )));
            }
        };

        events.push(WireEvent {
            kind,
            request_id,
            details,
        });
    }

    Ok(WireEventSet {
        suspend_policy,
        events,
    })
}
