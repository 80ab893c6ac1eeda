// JDWP event engine
//
// Event requests, local filtering and dispatch of debugger events, and the
// bookkeeping of who suspended which thread:
// - Wire transport (packet framing, composite events, command replies)
// - Request registry and filter evaluation
// - Event dispatch to listeners and event streams
// - Suspend coordination with epoch-checked frame and monitor handles

pub mod commands;
pub mod config;
pub mod connection;
pub mod control;
pub mod dispatch;
pub mod eventloop;
pub mod eventrequest;
pub mod events;
pub mod eventset;
pub mod filter;
pub mod listener;
pub mod object;
pub mod protocol;
pub mod rawevent;
pub mod reader;
pub mod reftype;
pub mod registry;
pub mod session;
pub mod stackframe;
pub mod suspend;
pub mod thread;
pub mod types;
pub mod vm;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::EngineConfig;
pub use connection::JdwpConnection;
pub use dispatch::{DispatchOutcome, EventDispatcher, EventOrigin, RawEventBatch};
pub use eventrequest::{
    EventKind, Filter, RequestBuilder, RequestId, RequestTarget, StepDepth, StepSize,
    SuspendPolicy,
};
pub use eventset::{DisconnectCause, EventSet, EventSetSummary, MatchedEvent};
pub use filter::ClassPattern;
pub use listener::{EventListener, ListenerId, ListenerRegistry};
pub use protocol::{JdwpError, JdwpResult};
pub use rawevent::{ClassNameCache, EventPayload, RawEvent};
pub use registry::{RequestInfo, RequestRegistry};
pub use session::{DebugSession, EventStream, StreamItem};
pub use stackframe::{FrameHandle, MonitorSnapshot};
pub use suspend::{SuspendCoordinator, SuspendRecord, ThreadState};
pub use thread::Frame;
pub use types::{EventLocation, Location, ThreadId};
