// Filter evaluation
//
// Pure predicates used by the dispatcher to decide whether a raw event
// satisfies a request. The only side effect is the count filter's
// decrement, which `evaluate` performs last.
//
// Filters the VM can apply itself are also sent with EventRequest.Set, so
// events it reports for a request have already passed them.

use crate::eventrequest::{EventKind, Filter, RequestTarget};
use crate::protocol::{JdwpError, JdwpResult};
use crate::rawevent::{EventPayload, RawEvent};
use crate::types::{ObjectId, ThreadId};
use std::fmt;

/// Class name glob with at most one leading or trailing `*`.
///
/// A pattern without `*` is an exact match: `Foo` does not match `FooBar`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassPattern {
    Any,
    Prefix(String),
    Suffix(String),
    Exact(String),
}

impl ClassPattern {
    pub fn parse(pattern: &str) -> JdwpResult<Self> {
        if pattern == "*" {
            return Ok(ClassPattern::Any);
        }

        let stars = pattern.matches('*').count();
        let parsed = match stars {
            0 => ClassPattern::Exact(pattern.to_string()),
            1 => {
                if let Some(prefix) = pattern.strip_suffix('*') {
                    ClassPattern::Prefix(prefix.to_string())
                } else if let Some(suffix) = pattern.strip_prefix('*') {
                    ClassPattern::Suffix(suffix.to_string())
                } else {
                    return Err(invalid_pattern(pattern));
                }
            }
            _ => return Err(invalid_pattern(pattern)),
        };

        if pattern.is_empty() {
            return Err(invalid_pattern(pattern));
        }

        Ok(parsed)
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            ClassPattern::Any => true,
            ClassPattern::Prefix(prefix) => name.starts_with(prefix.as_str()),
            ClassPattern::Suffix(suffix) => name.ends_with(suffix.as_str()),
            ClassPattern::Exact(exact) => name == exact,
        }
    }
}

impl fmt::Display for ClassPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassPattern::Any => write!(f, "*"),
            ClassPattern::Prefix(prefix) => write!(f, "{}*", prefix),
            ClassPattern::Suffix(suffix) => write!(f, "*{}", suffix),
            ClassPattern::Exact(exact) => write!(f, "{}", exact),
        }
    }
}

fn invalid_pattern(pattern: &str) -> JdwpError {
    JdwpError::IllegalArgument(format!(
        "class pattern '{}' may only use a single leading or trailing '*'",
        pattern
    ))
}

/// Glob match of a class name. Invalid patterns match nothing.
pub fn match_class_name(pattern: &str, candidate: &str) -> bool {
    ClassPattern::parse(pattern)
        .map(|p| p.matches(candidate))
        .unwrap_or(false)
}

/// Inverted class match: `true` means the event is suppressed.
pub fn match_exclusion(pattern: &str, candidate: &str) -> bool {
    match_class_name(pattern, candidate)
}

/// Decrement-then-check-zero. A spent counter never passes again.
pub fn count_filter(remaining: u32) -> (bool, u32) {
    match remaining {
        0 => (false, 0),
        n => {
            let left = n - 1;
            (left == 0, left)
        }
    }
}

/// Events from static contexts carry no `this` and pass vacuously.
pub fn instance_filter(expected: ObjectId, this_object: Option<ObjectId>) -> bool {
    match this_object {
        Some(object) => object == expected,
        None => true,
    }
}

/// Events without an originating thread never pass a thread filter.
pub fn thread_filter(expected: ThreadId, thread: Option<ThreadId>) -> bool {
    thread == Some(expected)
}

/// Check the kind-specific binding fixed at request creation
pub fn binding_matches(target: &RequestTarget, event: &RawEvent) -> bool {
    match target {
        RequestTarget::None => true,
        RequestTarget::Location(location) => event
            .location
            .as_ref()
            .map(|l| {
                l.location.class_id == location.class_id
                    && l.location.method_id == location.method_id
                    && l.location.index == location.index
            })
            .unwrap_or(false),
        RequestTarget::Field { class_id, field_id } => match &event.payload {
            EventPayload::Field {
                class_id: c,
                field_id: f,
                ..
            } => c == class_id && f == field_id,
            _ => false,
        },
        RequestTarget::Step { thread, .. } => event.thread == Some(*thread),
        RequestTarget::Exception {
            class_id,
            caught,
            uncaught,
        } => match &event.payload {
            EventPayload::Exception {
                exception_class,
                catch_location,
                ..
            } => {
                let class_ok = match (class_id, exception_class) {
                    (Some(wanted), Some(actual)) => wanted == actual,
                    (Some(_), None) => false,
                    (None, _) => true,
                };
                let catch_ok = if catch_location.is_some() {
                    *caught
                } else {
                    *uncaught
                };
                class_ok && catch_ok
            }
            _ => false,
        },
    }
}

fn passes(filter: &Filter, event: &RawEvent) -> bool {
    match filter {
        Filter::ClassMatch(pattern) => event
            .subject_class()
            .map(|name| pattern.matches(name))
            .unwrap_or(false),
        Filter::ClassExclude(pattern) => event
            .subject_class()
            .map(|name| !pattern.matches(name))
            .unwrap_or(true),
        Filter::SourceNameMatch(pattern) => event
            .source_name()
            .map(|name| pattern.matches(name))
            .unwrap_or(false),
        Filter::ThreadOnly(thread) => thread_filter(*thread, event.thread),
        Filter::InstanceOnly(object) => instance_filter(*object, event.this_object),
        Filter::Count(_) => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Rejected,
    Matched,
    /// Matched, and a count filter is now spent; the request must be deleted
    MatchedAndExpired,
}

impl FilterOutcome {
    pub fn is_match(self) -> bool {
        !matches!(self, FilterOutcome::Rejected)
    }
}

/// Whether the VM accepts `filter` as a modifier on requests of `kind`
fn vm_supports(kind: EventKind, filter: &Filter) -> bool {
    match filter {
        Filter::Count(_) => true,
        Filter::ClassMatch(_) | Filter::ClassExclude(_) => !matches!(
            kind,
            EventKind::ThreadStart | EventKind::ThreadDeath | EventKind::VmDeath
        ),
        Filter::ThreadOnly(_) => !matches!(kind, EventKind::ClassUnload | EventKind::VmDeath),
        Filter::InstanceOnly(_) => matches!(
            kind,
            EventKind::Breakpoint
                | EventKind::SingleStep
                | EventKind::FieldAccess
                | EventKind::FieldModification
                | EventKind::Exception
                | EventKind::MethodEntry
                | EventKind::MethodExit
                | EventKind::MonitorContendedEnter
                | EventKind::MonitorContendedEntered
                | EventKind::MonitorWait
                | EventKind::MonitorWaited
        ),
        Filter::SourceNameMatch(_) => kind == EventKind::ClassPrepare,
    }
}

/// Whether `filter`, one of `filters`, is applied by the VM.
///
/// A count is only handed to the VM when every other filter is, so the VM
/// counts exactly the events the engine would.
pub fn is_mirrored(kind: EventKind, filter: &Filter, filters: &[Filter]) -> bool {
    match filter {
        Filter::Count(_) => filters
            .iter()
            .filter(|f| !matches!(f, Filter::Count(_)))
            .all(|f| vm_supports(kind, f)),
        other => vm_supports(kind, other),
    }
}

/// The filters sent with EventRequest.Set, in evaluation order
pub fn mirrored_filters(kind: EventKind, filters: &[Filter]) -> Vec<&Filter> {
    let mut mirrored: Vec<&Filter> = filters
        .iter()
        .filter(|f| is_mirrored(kind, f, filters))
        .collect();
    mirrored.sort_by_key(|f| f.phase());
    mirrored
}

/// Decrement count filters in insertion order, stopping at the first one that
/// is not yet due. This is the order the VM applies count modifiers in.
fn spend_counts(filters: &mut [Filter]) -> FilterOutcome {
    let mut expired = false;
    for filter in filters.iter_mut() {
        if let Filter::Count(remaining) = filter {
            let (pass, left) = count_filter(*remaining);
            *remaining = left;
            if !pass {
                return FilterOutcome::Rejected;
            }
            expired = true;
        }
    }

    if expired {
        FilterOutcome::MatchedAndExpired
    } else {
        FilterOutcome::Matched
    }
}

/// Evaluate a request's filters against one event.
///
/// Class, exclusion and source filters run first, then thread and instance
/// filters, then count filters. Insertion order is kept within a phase.
/// Count filters are only decremented when every other filter passed.
pub fn evaluate(target: &RequestTarget, filters: &mut [Filter], event: &RawEvent) -> FilterOutcome {
    if !binding_matches(target, event) {
        return FilterOutcome::Rejected;
    }

    for phase in 0..2 {
        let rejected = filters
            .iter()
            .filter(|f| f.phase() == phase)
            .any(|f| !passes(f, event));
        if rejected {
            return FilterOutcome::Rejected;
        }
    }

    spend_counts(filters)
}

/// Evaluate an event the VM reported for a request of `kind`.
///
/// The binding and every mirrored filter already passed in the VM, so only
/// the rest are checked. A mirrored count means the VM reported the hit it
/// was waiting for: the local counters are spent and the request expires.
pub fn evaluate_reported(kind: EventKind, filters: &mut [Filter], event: &RawEvent) -> FilterOutcome {
    let mirrored: Vec<bool> = filters
        .iter()
        .map(|f| is_mirrored(kind, f, filters))
        .collect();

    for phase in 0..2 {
        let rejected = filters
            .iter()
            .zip(&mirrored)
            .filter(|(f, in_vm)| !**in_vm && f.phase() == phase)
            .any(|(f, _)| !passes(f, event));
        if rejected {
            return FilterOutcome::Rejected;
        }
    }

    let counted_by_vm = filters
        .iter()
        .zip(&mirrored)
        .any(|(f, in_vm)| *in_vm && matches!(f, Filter::Count(_)));
    if !counted_by_vm {
        return spend_counts(filters);
    }

    for filter in filters.iter_mut() {
        if let Filter::Count(remaining) = filter {
            *remaining = 0;
        }
    }
    FilterOutcome::MatchedAndExpired
}
