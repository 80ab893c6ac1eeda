// Debug session
//
// Owns the engine pieces for one connection and the two background tasks:
// the event pump, the only consumer of transport events, and the control
// forwarder, which sends VM-bound commands in order. Listener callbacks run
// on the pump; `EventStream` subscribers see the same event sets afterwards.

use crate::config::EngineConfig;
use crate::connection::JdwpConnection;
use crate::control::{
    spawn_control_forwarder, Attribution, ControlChannel, ControlCommand, InstalledRequests,
};
use crate::dispatch::{DispatchOutcome, EventDispatcher, EventOrigin, RawEventBatch};
use crate::eventloop::TransportEvent;
use crate::eventrequest::{EventKind, Filter, RequestTarget};
use crate::eventset::{DisconnectCause, EventSet};
use crate::listener::{EventListener, ListenerId, ListenerRegistry};
use crate::protocol::{JdwpError, JdwpResult};
use crate::rawevent::{ClassNameCache, EventPayload, RawEvent};
use crate::registry::RequestRegistry;
use crate::stackframe::{FrameHandle, MonitorSnapshot};
use crate::suspend::{SuspendCoordinator, ThreadState};
use crate::types::ThreadId;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a batch waits for the Set replies naming its requests
const INSTALL_WAIT: Duration = Duration::from_secs(2);
/// Bound on each lookup that fills in details the VM did not report
const LOOKUP_WAIT: Duration = Duration::from_secs(2);

/// What `EventStream` subscribers receive
#[derive(Debug, Clone)]
pub enum StreamItem {
    EventSet(Arc<EventSet>),
    Disconnected(DisconnectCause),
}

type CauseSlot = Arc<Mutex<Option<DisconnectCause>>>;

/// Pull-style view of delivered event sets. Every wait is bounded.
pub struct EventStream {
    rx: broadcast::Receiver<StreamItem>,
    default_timeout: Duration,
    cause: Option<DisconnectCause>,
}

impl EventStream {
    /// Next delivered event set, or `Timeout` once `timeout` has passed
    pub async fn next_event_set(&mut self, timeout: Duration) -> JdwpResult<Arc<EventSet>> {
        self.next_before(Instant::now() + timeout, timeout).await
    }

    /// `next_event_set` with the configured default timeout
    pub async fn next(&mut self) -> JdwpResult<Arc<EventSet>> {
        self.next_event_set(self.default_timeout).await
    }

    /// Wait for a set containing an event of `kind`. Sets without one are
    /// skipped and left as they are; suspended ones still need a resume.
    pub async fn wait_for(&mut self, kind: EventKind, timeout: Duration) -> JdwpResult<Arc<EventSet>> {
        let deadline = Instant::now() + timeout;
        loop {
            let set = self.next_before(deadline, timeout).await?;
            if set.events().iter().any(|e| e.event.kind == kind) {
                return Ok(set);
            }
            debug!("Skipping event set {} while waiting for {:?}", set.sequence(), kind);
        }
    }

    pub fn disconnect_cause(&self) -> Option<&DisconnectCause> {
        self.cause.as_ref()
    }

    async fn next_before(&mut self, deadline: Instant, timeout: Duration) -> JdwpResult<Arc<EventSet>> {
        if self.cause.is_some() {
            return Err(JdwpError::ConnectionClosed);
        }
        loop {
            let item = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .map_err(|_| JdwpError::Timeout(timeout))?;

            match item {
                Ok(StreamItem::EventSet(set)) => return Ok(set),
                Ok(StreamItem::Disconnected(cause)) => {
                    self.cause = Some(cause);
                    return Err(JdwpError::ConnectionClosed);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event stream lagged, {} event set(s) skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(JdwpError::ConnectionClosed),
            }
        }
    }
}

/// Deliver the terminal notification to listeners and subscribers, once
fn end_session(
    dispatcher: &EventDispatcher,
    stream_tx: &broadcast::Sender<StreamItem>,
    slot: &Mutex<Option<DisconnectCause>>,
    cause: DisconnectCause,
) {
    if !dispatcher.disconnect(&cause) {
        return;
    }
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(cause.clone());
    dispatcher.coordinator().reset();
    // no subscribers is fine
    let _ = stream_tx.send(StreamItem::Disconnected(cause));
}

struct EventPump {
    dispatcher: Arc<EventDispatcher>,
    names: Arc<ClassNameCache>,
    stream_tx: broadcast::Sender<StreamItem>,
    cause: CauseSlot,
    connection: JdwpConnection,
    installed: Arc<InstalledRequests>,
    forwarder: AbortHandle,
}

impl EventPump {
    async fn run(self, mut transport: mpsc::Receiver<TransportEvent>) {
        info!("Event pump started");

        let cause = loop {
            let Some(item) = transport.recv().await else {
                break DisconnectCause::TransportClosed("event channel closed".to_string());
            };

            let wire = match item {
                TransportEvent::Batch(wire) => wire,
                TransportEvent::Disconnected(cause) => break cause,
            };

            let raw: JdwpResult<Vec<RawEvent>> =
                wire.events.iter().map(|e| self.names.to_raw(e)).collect();
            let raw = match raw {
                Ok(raw) => raw,
                Err(e) => break DisconnectCause::ProtocolViolation(e.to_string()),
            };

            let deadline = Instant::now() + INSTALL_WAIT;
            let mut events = Vec::with_capacity(raw.len());
            for (event, reported) in raw.into_iter().zip(&wire.events) {
                let origin = match self.installed.resolve(reported.request_id, deadline).await {
                    Attribution::Request(id) => EventOrigin::Request(id),
                    Attribution::Retired => EventOrigin::Retired,
                    Attribution::Unknown => EventOrigin::Unattributed,
                };
                let event = match origin {
                    EventOrigin::Unattributed => self.complete(event).await,
                    _ => event,
                };
                events.push((event, origin));
            }

            let vm_died = events.iter().any(|(e, _)| e.kind == EventKind::VmDeath);
            let outcome = self
                .dispatcher
                .dispatch(RawEventBatch::attributed(wire.suspend_policy, events));
            if let DispatchOutcome::Delivered(set) = outcome {
                let _ = self.stream_tx.send(StreamItem::EventSet(set));
            }
            if vm_died {
                break DisconnectCause::VmDeath;
            }
        };

        // nothing reads the transport past this point
        self.forwarder.abort();
        self.connection.shutdown();

        end_session(&self.dispatcher, &self.stream_tx, &self.cause, cause);
        info!("Event pump stopped");
    }

    /// Fill in what local filters of enabled requests need but the VM left
    /// out of an event it did not attribute: the exception's class, a
    /// prepared class's source file and the frame's `this`.
    async fn complete(&self, mut event: RawEvent) -> RawEvent {
        let registry = self.dispatcher.registry();
        let mut connection = self.connection.clone();

        if let EventPayload::Exception {
            exception,
            exception_class: class @ None,
            ..
        } = &mut event.payload
        {
            let bound = registry.any_enabled(EventKind::Exception, |target, _| {
                matches!(target, RequestTarget::Exception { class_id: Some(_), .. })
            });
            if bound {
                *class = self
                    .lookup("exception class", connection.get_object_reference_type(*exception))
                    .await;
            }
        }

        if let EventPayload::ClassPrepare {
            class_id,
            class_name,
            source_name: source @ None,
            ..
        } = &mut event.payload
        {
            let wanted = registry.any_enabled(EventKind::ClassPrepare, |_, filters| {
                filters.iter().any(|f| matches!(f, Filter::SourceNameMatch(_)))
            });
            if wanted {
                if let Some(Some(name)) = self
                    .lookup("source file", connection.get_source_file(*class_id))
                    .await
                {
                    self.names
                        .register_class(*class_id, class_name.clone(), Some(name.clone()));
                    *source = Some(name);
                }
            }
        }

        if let (Some(thread), None) = (event.thread, event.this_object) {
            let wanted = event.location.is_some()
                && registry.any_enabled(event.kind, |_, filters| {
                    filters.iter().any(|f| matches!(f, Filter::InstanceOnly(_)))
                });
            if wanted {
                let top = self
                    .lookup("top frame", connection.get_frames(thread, 0, 1))
                    .await
                    .and_then(|frames| frames.into_iter().next());
                if let Some(frame) = top {
                    event.this_object = self
                        .lookup("this object", connection.get_this_object(thread, frame.frame_id))
                        .await
                        .flatten();
                }
            }
        }

        event
    }

    async fn lookup<T>(&self, what: &str, query: impl Future<Output = JdwpResult<T>>) -> Option<T> {
        match tokio::time::timeout(LOOKUP_WAIT, query).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                debug!("Could not look up {}: {}", what, e);
                None
            }
            Err(_) => {
                debug!("Timed out looking up {}", what);
                None
            }
        }
    }
}

type Startup = (mpsc::Receiver<TransportEvent>, mpsc::UnboundedReceiver<ControlCommand>);

pub struct DebugSession {
    connection: JdwpConnection,
    config: EngineConfig,
    registry: Arc<RequestRegistry>,
    coordinator: Arc<SuspendCoordinator>,
    listeners: Arc<ListenerRegistry>,
    dispatcher: Arc<EventDispatcher>,
    names: Arc<ClassNameCache>,
    stream_tx: broadcast::Sender<StreamItem>,
    cause: CauseSlot,
    installed: Arc<InstalledRequests>,
    startup: Option<Startup>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DebugSession {
    /// Connect to a JVM and start a session on the connection
    pub async fn attach(host: &str, port: u16, config: EngineConfig) -> JdwpResult<Arc<Self>> {
        config.validate()?;
        let (connection, events) = JdwpConnection::connect(host, port, &config).await?;
        Self::start(connection, events, config).await
    }

    /// Start a session on an established connection
    pub async fn start(
        connection: JdwpConnection,
        events: mpsc::Receiver<TransportEvent>,
        config: EngineConfig,
    ) -> JdwpResult<Arc<Self>> {
        Self::new(connection, events, config).launch().await
    }

    /// Build a session without starting its tasks, so listeners can be added
    /// before the first event is delivered.
    pub fn new(
        connection: JdwpConnection,
        events: mpsc::Receiver<TransportEvent>,
        config: EngineConfig,
    ) -> Self {
        let (control, control_rx) = ControlChannel::new();
        let installed = control.installed().clone();
        let registry = Arc::new(RequestRegistry::new(control.clone()));
        let coordinator = Arc::new(SuspendCoordinator::new(control));
        let listeners = Arc::new(ListenerRegistry::new());
        let dispatcher = Arc::new(EventDispatcher::new(
            registry.clone(),
            coordinator.clone(),
            listeners.clone(),
        ));
        let (stream_tx, _) = broadcast::channel(config.broadcast_capacity);

        Self {
            connection,
            config,
            registry,
            coordinator,
            listeners,
            dispatcher,
            names: Arc::new(ClassNameCache::new()),
            stream_tx,
            cause: Arc::new(Mutex::new(None)),
            installed,
            startup: Some((events, control_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Learn the VM's threads, then spawn the event pump and the control forwarder
    pub async fn launch(mut self) -> JdwpResult<Arc<Self>> {
        let (events, control_rx) = self
            .startup
            .take()
            .ok_or_else(|| JdwpError::IncompatibleState("session already started".to_string()))?;

        match self.connection.clone().get_all_threads().await {
            Ok(threads) => {
                debug!("Target has {} thread(s)", threads.len());
                for thread in threads {
                    self.coordinator.register_thread(thread);
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Could not list threads: {}", e),
        }

        let forwarder = spawn_control_forwarder(
            self.connection.clone(),
            control_rx,
            self.installed.clone(),
        );
        let pump = EventPump {
            dispatcher: self.dispatcher.clone(),
            names: self.names.clone(),
            stream_tx: self.stream_tx.clone(),
            cause: self.cause.clone(),
            connection: self.connection.clone(),
            installed: self.installed.clone(),
            forwarder: forwarder.abort_handle(),
        };
        let pump = tokio::spawn(pump.run(events));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([forwarder, pump]);

        info!("Debug session started");
        Ok(Arc::new(self))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn requests(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<SuspendCoordinator> {
        &self.coordinator
    }

    pub fn class_names(&self) -> &Arc<ClassNameCache> {
        &self.names
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn subscribe(&self) -> EventStream {
        let rx = self.stream_tx.subscribe();
        EventStream {
            rx,
            default_timeout: self.config.default_wait_timeout(),
            cause: self.disconnect_cause(),
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.dispatcher.is_disconnected()
    }

    pub fn disconnect_cause(&self) -> Option<DisconnectCause> {
        self.cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ensure_open(&self) -> JdwpResult<()> {
        if self.dispatcher.is_disconnected() {
            return Err(JdwpError::ConnectionClosed);
        }
        Ok(())
    }

    fn suspended_state(&self, thread: ThreadId) -> JdwpResult<Arc<ThreadState>> {
        self.coordinator
            .thread_state(thread)
            .filter(|state| state.is_suspended())
            .ok_or_else(|| {
                JdwpError::IncompatibleState(format!("thread {:#x} is not suspended", thread))
            })
    }

    /// Stack of a suspended thread, top frame first. Fetched once per
    /// suspension; the handles go stale when the thread runs again.
    pub async fn frames(&self, thread: ThreadId) -> JdwpResult<Vec<FrameHandle>> {
        self.ensure_open()?;
        let state = self.suspended_state(thread)?;
        let epoch = state.epoch();

        let cached = {
            let cache = state.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if cache.epoch == epoch {
                cache.frames.clone()
            } else {
                None
            }
        };

        let frames = match cached {
            Some(frames) => frames,
            None => {
                let fetched = Arc::new(self.connection.clone().get_frames(thread, 0, -1).await?);
                let mut cache = state.cache.lock().unwrap_or_else(PoisonError::into_inner);
                let current = state.epoch();
                if current != epoch {
                    return Err(JdwpError::StaleHandle {
                        thread,
                        fetched: epoch,
                        current,
                    });
                }
                cache.epoch = epoch;
                cache.frames = Some(fetched.clone());
                fetched
            }
        };

        Ok(frames
            .iter()
            .enumerate()
            .map(|(depth, frame)| FrameHandle::new(state.clone(), epoch, depth, frame.clone()))
            .collect())
    }

    pub async fn owned_monitors(&self, thread: ThreadId) -> JdwpResult<MonitorSnapshot> {
        self.ensure_open()?;
        let state = self.suspended_state(thread)?;
        let epoch = state.epoch();

        let monitors = self.connection.clone().get_owned_monitors(thread).await?;
        let current = state.epoch();
        if current != epoch {
            return Err(JdwpError::StaleHandle {
                thread,
                fetched: epoch,
                current,
            });
        }
        Ok(MonitorSnapshot::new(state, epoch, monitors))
    }

    /// Pop every frame above and including `frame`. The thread must be
    /// suspended by an event; all of its handles go stale afterwards.
    pub async fn pop_frames(&self, frame: &FrameHandle) -> JdwpResult<()> {
        self.ensure_open()?;
        let frame_id = frame.frame_id()?;
        let thread = frame.thread();
        let state = self.suspended_state(thread)?;
        if !state.is_event_suspended() {
            return Err(JdwpError::IncompatibleState(format!(
                "thread {:#x} must be suspended by an event to pop frames",
                thread
            )));
        }

        self.connection.clone().pop_frames(thread, frame_id).await?;
        state.invalidate();
        info!("Popped frames of thread {:#x} up to depth {}", thread, frame.depth());
        Ok(())
    }

    /// Drop all requests, release the target and end the session
    pub async fn detach(&self) -> JdwpResult<()> {
        if self.dispatcher.is_disconnected() {
            return Ok(());
        }

        self.registry.clear();
        end_session(&self.dispatcher, &self.stream_tx, &self.cause, DisconnectCause::Detached);

        if let Err(e) = self.connection.clone().dispose().await {
            debug!("Dispose not acknowledged: {}", e);
        }
        self.abort_tasks();
        Ok(())
    }

    fn abort_tasks(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{
        command_sets, event_commands, event_kinds, object_reference_commands,
        reference_type_commands, stack_frame_commands, thread_commands, vm_commands,
    };
    use crate::eventrequest::{RequestBuilder, RequestId, SuspendPolicy};
    use crate::events::{EventDetails, WireEvent, WireEventSet};
    use crate::eventset::MatchedEvent;
    use crate::testutil::{loopback, FakeVm};
    use crate::thread::Frame;
    use crate::types::Location;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(2);
    const SHORT: Duration = Duration::from_millis(100);

    fn here() -> Location {
        Location::new(0x100, 0x200, 7)
    }

    fn thrown(exception: u64, request_id: i32) -> WireEvent {
        WireEvent {
            kind: event_kinds::EXCEPTION,
            request_id,
            details: EventDetails::Exception {
                thread: 1,
                location: here(),
                exception,
                catch_location: None,
            },
        }
    }

    fn prepared(ref_type: u64, signature: &str, request_id: i32) -> WireEvent {
        WireEvent {
            kind: event_kinds::CLASS_PREPARE,
            request_id,
            details: EventDetails::ClassPrepare {
                thread: 1,
                ref_type,
                signature: signature.to_string(),
                status: 7,
            },
        }
    }

    struct Harness {
        session: Arc<DebugSession>,
        feed: mpsc::Sender<TransportEvent>,
        vm: FakeVm,
    }

    impl Harness {
        async fn new(threads: &[ThreadId]) -> Self {
            let (connection, vm) = loopback();
            vm.set_threads(threads);
            let (feed, events) = mpsc::channel(16);
            let session = DebugSession::start(connection, events, EngineConfig::default())
                .await
                .unwrap();
            Self { session, feed, vm }
        }

        async fn send(&self, suspend_policy: SuspendPolicy, events: Vec<WireEvent>) {
            self.feed
                .send(TransportEvent::Batch(WireEventSet {
                    suspend_policy,
                    events,
                }))
                .await
                .unwrap();
        }

        async fn eventually_sent(&self, command_set: u8, command: u8, expected: usize) {
            let deadline = Instant::now() + WAIT;
            while self.vm.count(command_set, command) != expected {
                assert!(
                    Instant::now() < deadline,
                    "expected {} command(s) {}/{}, saw {}",
                    expected,
                    command_set,
                    command,
                    self.vm.count(command_set, command)
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    /// A hit the VM did not attribute; the engine matches it against every request
    fn breakpoint(thread: ThreadId) -> WireEvent {
        WireEvent {
            kind: event_kinds::BREAKPOINT,
            request_id: 0,
            details: EventDetails::Breakpoint {
                thread,
                location: here(),
            },
        }
    }

    #[derive(Default)]
    struct Disconnects {
        causes: Mutex<Vec<DisconnectCause>>,
    }

    impl EventListener for Disconnects {
        fn disconnected(&self, cause: &DisconnectCause) {
            self.causes.lock().unwrap().push(cause.clone());
        }
    }

    #[tokio::test]
    async fn test_count_one_event_thread_hit_from_two_threads() {
        let h = Harness::new(&[1, 2]).await;
        let mut stream = h.session.subscribe();
        let id = h
            .session
            .requests()
            .create(
                RequestBuilder::breakpoint(here())
                    .suspend_policy(SuspendPolicy::EventThread)
                    .count_filter(1)
                    .enabled(),
            )
            .unwrap();

        h.send(SuspendPolicy::EventThread, vec![breakpoint(1)]).await;
        h.send(SuspendPolicy::None, vec![breakpoint(2)]).await;

        let set = stream.next_event_set(WAIT).await.unwrap();
        assert_eq!(set.thread(), Some(1));
        assert_eq!(set.requests().collect::<Vec<_>>(), vec![id]);
        assert!(matches!(
            stream.next_event_set(SHORT).await,
            Err(JdwpError::Timeout(_))
        ));

        let coordinator = h.session.coordinator();
        assert_eq!(coordinator.suspend_count(1), 1);
        assert_eq!(coordinator.suspend_count(2), 0);
        assert!(h.session.requests().get(id).is_err());
        h.eventually_sent(command_sets::EVENT_REQUEST, event_commands::CLEAR, 1)
            .await;

        set.resume().unwrap();
        assert_eq!(coordinator.suspend_count(1), 0);
        h.eventually_sent(command_sets::THREAD_REFERENCE, thread_commands::RESUME, 1)
            .await;
    }

    struct Toggler {
        registry: Arc<RequestRegistry>,
        ids: Vec<RequestId>,
        sets: AtomicUsize,
    }

    impl EventListener for Toggler {
        fn event_set_received(&self, _set: &EventSet) {
            for id in &self.ids {
                self.registry.disable(*id).unwrap();
                self.registry.enable(*id).unwrap();
            }
        }

        fn event_set_complete(&self, set: &EventSet) {
            self.sets.fetch_add(1, Ordering::SeqCst);
            set.resume().unwrap();
        }
    }

    #[tokio::test]
    async fn test_toggle_requests_inside_handler() {
        let h = Harness::new(&[1, 2]).await;
        let registry = h.session.requests().clone();
        let ids: Vec<RequestId> = (0..2)
            .map(|_| {
                registry
                    .create(RequestBuilder::breakpoint(here()).enabled())
                    .unwrap()
            })
            .collect();
        let toggler = Arc::new(Toggler {
            registry: registry.clone(),
            ids: ids.clone(),
            sets: AtomicUsize::new(0),
        });
        h.session.add_listener(toggler.clone());
        let mut stream = h.session.subscribe();

        for round in 1..=2u64 {
            h.send(SuspendPolicy::All, vec![breakpoint(1)]).await;
            let set = stream.next_event_set(WAIT).await.unwrap();
            assert_eq!(set.sequence(), round);
            assert_eq!(set.requests().collect::<Vec<_>>(), ids);
            assert!(set.is_resumed());
            assert!(!h.session.coordinator().all_suspended());
        }

        assert_eq!(toggler.sets.load(Ordering::SeqCst), 2);
        for id in &ids {
            assert!(registry.is_enabled(*id).unwrap());
        }
        // two installs, then a clear and reinstall per request per round
        h.eventually_sent(command_sets::EVENT_REQUEST, event_commands::SET, 6)
            .await;
        h.eventually_sent(command_sets::EVENT_REQUEST, event_commands::CLEAR, 4)
            .await;
        h.eventually_sent(command_sets::VIRTUAL_MACHINE, vm_commands::RESUME, 2)
            .await;
    }

    #[tokio::test]
    async fn test_frames_cached_then_stale_after_resume() {
        let h = Harness::new(&[1]).await;
        h.vm.set_frames(
            1,
            vec![
                Frame {
                    frame_id: 10,
                    location: here(),
                },
                Frame {
                    frame_id: 11,
                    location: Location::new(0x100, 0x300, 0),
                },
            ],
        );
        h.session
            .requests()
            .create(RequestBuilder::breakpoint(here()).enabled())
            .unwrap();
        let mut stream = h.session.subscribe();

        h.send(SuspendPolicy::All, vec![breakpoint(1)]).await;
        let set = stream.next_event_set(WAIT).await.unwrap();

        let frames = h.session.frames(1).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].depth(), 1);
        assert_eq!(frames[1].frame_id().unwrap(), 11);
        let again = h.session.frames(1).await.unwrap();
        assert_eq!(again[0].frame_id().unwrap(), 10);
        assert_eq!(h.vm.count(command_sets::THREAD_REFERENCE, thread_commands::FRAMES), 1);

        set.resume().unwrap();

        assert!(matches!(
            frames[0].frame(),
            Err(JdwpError::StaleHandle { thread: 1, .. })
        ));
        assert!(matches!(
            h.session.frames(1).await,
            Err(JdwpError::IncompatibleState(_))
        ));
    }

    #[tokio::test]
    async fn test_owned_monitors_snapshot() {
        let h = Harness::new(&[1]).await;
        h.vm.set_monitors(1, vec![0x55, 0x66]);

        assert!(matches!(
            h.session.owned_monitors(1).await,
            Err(JdwpError::IncompatibleState(_))
        ));

        h.session.coordinator().suspend_thread(1);
        let snapshot = h.session.owned_monitors(1).await.unwrap();
        assert_eq!(snapshot.monitors().unwrap(), &[0x55, 0x66]);

        h.session.coordinator().resume_thread(1).unwrap();
        assert!(!snapshot.is_valid());
    }

    struct DeleteAll {
        registry: Arc<RequestRegistry>,
        deleted: AtomicUsize,
    }

    impl EventListener for DeleteAll {
        fn breakpoint(&self, _set: &EventSet, _event: &MatchedEvent) {
            let n = self.registry.delete_all(EventKind::Breakpoint);
            self.deleted.fetch_add(n, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_bulk_delete_during_dispatch() {
        let h = Harness::new(&[1]).await;
        let registry = h.session.requests().clone();
        for _ in 0..2 {
            registry
                .create(
                    RequestBuilder::breakpoint(here())
                        .suspend_policy(SuspendPolicy::None)
                        .enabled(),
                )
                .unwrap();
        }
        let listener = Arc::new(DeleteAll {
            registry: registry.clone(),
            deleted: AtomicUsize::new(0),
        });
        h.session.add_listener(listener.clone());
        let mut stream = h.session.subscribe();

        h.send(SuspendPolicy::None, vec![breakpoint(1)]).await;
        let set = stream.next_event_set(WAIT).await.unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(listener.deleted.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());

        h.send(SuspendPolicy::None, vec![breakpoint(1)]).await;
        assert!(matches!(
            stream.next_event_set(SHORT).await,
            Err(JdwpError::Timeout(_))
        ));
        h.eventually_sent(command_sets::EVENT_REQUEST, event_commands::CLEAR, 2)
            .await;
    }

    #[tokio::test]
    async fn test_suspend_all_round_trip() {
        let h = Harness::new(&[1, 2, 3]).await;
        h.session
            .requests()
            .create(RequestBuilder::breakpoint(here()).enabled())
            .unwrap();
        let mut stream = h.session.subscribe();

        h.send(SuspendPolicy::All, vec![breakpoint(2)]).await;
        let set = stream.next_event_set(WAIT).await.unwrap();
        let coordinator = h.session.coordinator();
        assert!(coordinator.all_suspended());
        assert_eq!(set.suspend_record().threads(), &[1, 2, 3]);

        set.resume().unwrap();
        for thread in [1, 2, 3] {
            assert_eq!(coordinator.suspend_count(thread), 0);
        }
        assert!(matches!(set.resume(), Err(JdwpError::ImbalancedResume(_))));
        h.eventually_sent(command_sets::VIRTUAL_MACHINE, vm_commands::RESUME, 1)
            .await;
    }

    #[tokio::test]
    async fn test_wait_for_skips_other_kinds() {
        let h = Harness::new(&[1]).await;
        let registry = h.session.requests();
        registry
            .create(
                RequestBuilder::of_kind(EventKind::ThreadStart)
                    .suspend_policy(SuspendPolicy::None)
                    .enabled(),
            )
            .unwrap();
        registry
            .create(
                RequestBuilder::breakpoint(here())
                    .suspend_policy(SuspendPolicy::None)
                    .enabled(),
            )
            .unwrap();
        let mut stream = h.session.subscribe();

        h.send(
            SuspendPolicy::None,
            vec![WireEvent {
                kind: event_kinds::THREAD_START,
                request_id: 1,
                details: EventDetails::ThreadStart { thread: 9 },
            }],
        )
        .await;
        h.send(SuspendPolicy::None, vec![breakpoint(9)]).await;

        let set = stream.wait_for(EventKind::Breakpoint, WAIT).await.unwrap();
        assert_eq!(set.sequence(), 2);
        assert_eq!(h.session.coordinator().live_threads(), vec![1, 9]);
        assert!(matches!(
            stream.wait_for(EventKind::Breakpoint, SHORT).await,
            Err(JdwpError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_class_prepare_teaches_class_names() {
        let h = Harness::new(&[1]).await;
        let registry = h.session.requests();
        registry
            .create(
                RequestBuilder::of_kind(EventKind::ClassPrepare)
                    .suspend_policy(SuspendPolicy::None)
                    .class_filter("com.example.*")
                    .enabled(),
            )
            .unwrap();
        registry
            .create(
                RequestBuilder::breakpoint(here())
                    .suspend_policy(SuspendPolicy::None)
                    .class_filter("com.example.Foo")
                    .enabled(),
            )
            .unwrap();
        let mut stream = h.session.subscribe();

        h.send(
            SuspendPolicy::None,
            vec![WireEvent {
                kind: event_kinds::CLASS_PREPARE,
                request_id: 1,
                details: EventDetails::ClassPrepare {
                    thread: 1,
                    ref_type: 0x100,
                    signature: "Lcom/example/Foo;".to_string(),
                    status: 7,
                },
            }],
        )
        .await;
        h.send(SuspendPolicy::None, vec![breakpoint(1)]).await;

        let prepared = stream.wait_for(EventKind::ClassPrepare, WAIT).await.unwrap();
        assert_eq!(prepared.events()[0].event.subject_class(), Some("com.example.Foo"));
        let hit = stream.wait_for(EventKind::Breakpoint, WAIT).await.unwrap();
        let location = hit.events()[0].event.location.as_ref().unwrap();
        assert_eq!(location.declaring_type, "com.example.Foo");
        assert_eq!(
            h.session.class_names().class_name(0x100).as_deref(),
            Some("com.example.Foo")
        );
    }

    #[tokio::test]
    async fn test_vm_death_ends_session_once() {
        let h = Harness::new(&[1]).await;
        let disconnects = Arc::new(Disconnects::default());
        h.session.add_listener(disconnects.clone());
        let mut stream = h.session.subscribe();

        h.send(
            SuspendPolicy::None,
            vec![WireEvent {
                kind: event_kinds::VM_DEATH,
                request_id: 0,
                details: EventDetails::VMDeath,
            }],
        )
        .await;
        // the transport also reports the closed socket; it must not be delivered
        h.feed
            .send(TransportEvent::Disconnected(DisconnectCause::TransportClosed(
                "eof".to_string(),
            )))
            .await
            .ok();

        let set = stream.next_event_set(WAIT).await.unwrap();
        assert_eq!(set.events()[0].request, RequestId::AUTOMATIC);
        assert!(matches!(
            stream.next_event_set(WAIT).await,
            Err(JdwpError::ConnectionClosed)
        ));
        assert_eq!(stream.disconnect_cause(), Some(&DisconnectCause::VmDeath));

        tokio::time::sleep(SHORT).await;
        assert_eq!(*disconnects.causes.lock().unwrap(), vec![DisconnectCause::VmDeath]);
        assert!(!h.session.is_connected());
        assert!(matches!(
            h.session.frames(1).await,
            Err(JdwpError::ConnectionClosed)
        ));

        let late = h.session.subscribe();
        assert_eq!(late.disconnect_cause(), Some(&DisconnectCause::VmDeath));
    }

    #[tokio::test]
    async fn test_protocol_violation_is_reported() {
        let h = Harness::new(&[1]).await;
        let disconnects = Arc::new(Disconnects::default());
        h.session.add_listener(disconnects.clone());
        let mut stream = h.session.subscribe();

        h.feed
            .send(TransportEvent::Disconnected(DisconnectCause::ProtocolViolation(
                "bad packet".to_string(),
            )))
            .await
            .unwrap();

        assert!(matches!(
            stream.next_event_set(WAIT).await,
            Err(JdwpError::ConnectionClosed)
        ));
        let causes = disconnects.causes.lock().unwrap().clone();
        assert_eq!(causes.len(), 1);
        assert!(causes[0].is_failure());
    }

    #[tokio::test]
    async fn test_pop_frames_needs_event_suspension() {
        let h = Harness::new(&[1]).await;
        h.vm.set_frames(
            1,
            vec![
                Frame {
                    frame_id: 10,
                    location: here(),
                },
                Frame {
                    frame_id: 11,
                    location: here(),
                },
            ],
        );

        h.session.coordinator().suspend_thread(1);
        let frames = h.session.frames(1).await.unwrap();
        assert!(matches!(
            h.session.pop_frames(&frames[0]).await,
            Err(JdwpError::IncompatibleState(_))
        ));
        h.session.coordinator().resume_thread(1).unwrap();

        h.session
            .requests()
            .create(
                RequestBuilder::breakpoint(here())
                    .suspend_policy(SuspendPolicy::EventThread)
                    .enabled(),
            )
            .unwrap();
        let mut stream = h.session.subscribe();
        h.send(SuspendPolicy::EventThread, vec![breakpoint(1)]).await;
        let set = stream.next_event_set(WAIT).await.unwrap();

        let frames = h.session.frames(1).await.unwrap();
        h.session.pop_frames(&frames[0]).await.unwrap();
        assert_eq!(h.vm.count(command_sets::STACK_FRAME, stack_frame_commands::POP_FRAMES), 1);
        assert!(!frames[1].is_valid());
        assert!(h.session.coordinator().is_suspended(1));

        set.resume().unwrap();
    }

    #[tokio::test]
    async fn test_detach_clears_requests_and_disposes() {
        let h = Harness::new(&[1]).await;
        let disconnects = Arc::new(Disconnects::default());
        h.session.add_listener(disconnects.clone());
        h.session
            .requests()
            .create(RequestBuilder::of_kind(EventKind::ThreadStart).enabled())
            .unwrap();

        h.session.detach().await.unwrap();
        h.session.detach().await.unwrap();

        assert!(h.session.requests().is_empty());
        assert_eq!(h.vm.count(command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE), 1);
        assert_eq!(*disconnects.causes.lock().unwrap(), vec![DisconnectCause::Detached]);
        assert_eq!(h.session.disconnect_cause(), Some(DisconnectCause::Detached));
    }

    #[tokio::test]
    async fn test_launch_registers_vm_threads() {
        let h = Harness::new(&[4, 5, 6]).await;
        assert_eq!(h.session.coordinator().live_threads(), vec![4, 5, 6]);
        assert_eq!(h.vm.count(command_sets::VIRTUAL_MACHINE, vm_commands::ALL_THREADS), 1);
    }

    #[tokio::test]
    async fn test_install_mirrors_filters_to_vm() {
        let h = Harness::new(&[1]).await;
        let registry = h.session.requests();
        registry
            .create(
                RequestBuilder::exception(None, true, true)
                    .class_filter("com.example.*")
                    .count_filter(3)
                    .enabled(),
            )
            .unwrap();
        // thread start takes no class modifier, so neither filter goes out
        registry
            .create(
                RequestBuilder::of_kind(EventKind::ThreadStart)
                    .class_filter("com.example.*")
                    .count_filter(2)
                    .enabled(),
            )
            .unwrap();
        h.eventually_sent(command_sets::EVENT_REQUEST, event_commands::SET, 2)
            .await;

        let sets: Vec<_> = h
            .vm
            .commands()
            .into_iter()
            .filter(|p| p.command_set == command_sets::EVENT_REQUEST && p.command == event_commands::SET)
            .collect();
        assert_eq!(sets[0].data[0], event_kinds::EXCEPTION);
        assert_eq!(&sets[0].data[2..6], &3i32.to_be_bytes());
        // the count modifier is the last one
        assert_eq!(&sets[0].data[sets[0].data.len() - 5..], &[1, 0, 0, 0, 3]);
        assert_eq!(sets[1].data[0], event_kinds::THREAD_START);
        assert_eq!(&sets[1].data[2..6], &0i32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_vm_counted_hit_is_delivered_and_resumed() {
        let h = Harness::new(&[1, 2]).await;
        let id = h
            .session
            .requests()
            .create(RequestBuilder::exception(None, true, true).count_filter(3).enabled())
            .unwrap();
        let mut stream = h.session.subscribe();

        // the VM only reports the third throw
        h.send(SuspendPolicy::All, vec![thrown(0x99, 1)]).await;

        let set = stream.next_event_set(WAIT).await.unwrap();
        assert_eq!(set.requests().collect::<Vec<_>>(), vec![id]);
        assert!(h.session.requests().get(id).is_err());
        set.resume().unwrap();
        assert!(!h.session.coordinator().all_suspended());
        h.eventually_sent(command_sets::VIRTUAL_MACHINE, vm_commands::RESUME, 1)
            .await;
        h.eventually_sent(command_sets::EVENT_REQUEST, event_commands::CLEAR, 1)
            .await;
    }

    #[tokio::test]
    async fn test_hit_for_cleared_request_is_resumed() {
        let h = Harness::new(&[1, 2]).await;
        let registry = h.session.requests();
        let id = registry
            .create(RequestBuilder::breakpoint(here()).enabled())
            .unwrap();
        h.eventually_sent(command_sets::EVENT_REQUEST, event_commands::SET, 1)
            .await;
        registry.delete(id).unwrap();
        h.eventually_sent(command_sets::EVENT_REQUEST, event_commands::CLEAR, 1)
            .await;
        let mut stream = h.session.subscribe();

        let mut late = breakpoint(1);
        late.request_id = 1;
        h.send(SuspendPolicy::All, vec![late]).await;

        h.eventually_sent(command_sets::VIRTUAL_MACHINE, vm_commands::RESUME, 1)
            .await;
        assert!(matches!(
            stream.next_event_set(SHORT).await,
            Err(JdwpError::Timeout(_))
        ));
        assert!(!h.session.coordinator().all_suspended());
    }

    #[tokio::test]
    async fn test_exception_matches_its_class_binding() {
        let h = Harness::new(&[1]).await;
        let registry = h.session.requests();
        let io = registry
            .create(
                RequestBuilder::exception(Some(0x10), true, true)
                    .suspend_policy(SuspendPolicy::None)
                    .enabled(),
            )
            .unwrap();
        let npe = registry
            .create(
                RequestBuilder::exception(Some(0x20), true, true)
                    .suspend_policy(SuspendPolicy::None)
                    .enabled(),
            )
            .unwrap();
        h.vm.set_object_class(0x99, 0x20);
        let mut stream = h.session.subscribe();

        // reported for the first request
        h.send(SuspendPolicy::None, vec![thrown(0x98, 1)]).await;
        let set = stream.next_event_set(WAIT).await.unwrap();
        assert_eq!(set.requests().collect::<Vec<_>>(), vec![io]);
        assert_eq!(
            h.vm.count(command_sets::OBJECT_REFERENCE, object_reference_commands::REFERENCE_TYPE),
            0
        );

        // unattributed: the engine asks for the class and binds on it
        h.send(SuspendPolicy::None, vec![thrown(0x99, 0)]).await;
        let set = stream.next_event_set(WAIT).await.unwrap();
        assert_eq!(set.requests().collect::<Vec<_>>(), vec![npe]);
        match &set.events()[0].event.payload {
            EventPayload::Exception { exception_class, .. } => assert_eq!(*exception_class, Some(0x20)),
            other => panic!("unexpected payload: {:?}", other),
        }
        assert_eq!(
            h.vm.count(command_sets::OBJECT_REFERENCE, object_reference_commands::REFERENCE_TYPE),
            1
        );
    }

    #[tokio::test]
    async fn test_class_prepare_source_filter() {
        let h = Harness::new(&[1]).await;
        let id = h
            .session
            .requests()
            .create(
                RequestBuilder::of_kind(EventKind::ClassPrepare)
                    .suspend_policy(SuspendPolicy::None)
                    .source_name_filter("Foo.java")
                    .enabled(),
            )
            .unwrap();
        h.vm.set_source_file(0x100, "Foo.java");
        h.vm.set_source_file(0x200, "Bar.java");
        let mut stream = h.session.subscribe();

        h.send(
            SuspendPolicy::None,
            vec![
                prepared(0x200, "Lcom/example/Bar;", 0),
                prepared(0x100, "Lcom/example/Foo;", 0),
            ],
        )
        .await;

        let set = stream.next_event_set(WAIT).await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.events()[0].request, id);
        assert_eq!(set.events()[0].event.subject_class(), Some("com.example.Foo"));
        assert_eq!(set.events()[0].event.source_name(), Some("Foo.java"));
        assert_eq!(
            h.session.class_names().source_name(0x100).as_deref(),
            Some("Foo.java")
        );
        assert_eq!(
            h.vm.count(command_sets::REFERENCE_TYPE, reference_type_commands::SOURCE_FILE),
            2
        );

        // the VM matched the source name itself
        h.send(SuspendPolicy::None, vec![prepared(0x300, "Lcom/example/Baz;", 1)]).await;
        let set = stream.next_event_set(WAIT).await.unwrap();
        assert_eq!(set.events()[0].event.subject_class(), Some("com.example.Baz"));
        assert_eq!(
            h.vm.count(command_sets::REFERENCE_TYPE, reference_type_commands::SOURCE_FILE),
            2
        );
    }

    #[tokio::test]
    async fn test_instance_filter_uses_frame_this() {
        let h = Harness::new(&[1]).await;
        h.vm.set_frames(
            1,
            vec![Frame {
                frame_id: 10,
                location: here(),
            }],
        );
        h.vm.set_this_object(10, 0x6);
        let id = h
            .session
            .requests()
            .create(
                RequestBuilder::breakpoint(here())
                    .suspend_policy(SuspendPolicy::None)
                    .instance_filter(0x5)
                    .enabled(),
            )
            .unwrap();
        let mut stream = h.session.subscribe();

        h.send(SuspendPolicy::None, vec![breakpoint(1)]).await;
        assert!(matches!(
            stream.next_event_set(SHORT).await,
            Err(JdwpError::Timeout(_))
        ));
        assert_eq!(h.vm.count(command_sets::STACK_FRAME, stack_frame_commands::THIS_OBJECT), 1);

        h.vm.set_this_object(10, 0x5);
        h.send(SuspendPolicy::None, vec![breakpoint(1)]).await;
        let set = stream.next_event_set(WAIT).await.unwrap();
        assert_eq!(set.events()[0].request, id);
        assert_eq!(set.events()[0].event.this_object, Some(0x5));

        // reported for the request: the VM already compared the instance
        let mut reported = breakpoint(1);
        reported.request_id = 1;
        h.send(SuspendPolicy::None, vec![reported]).await;
        let set = stream.next_event_set(WAIT).await.unwrap();
        assert_eq!(set.events()[0].event.this_object, Some(0x5));
        assert_eq!(h.vm.count(command_sets::STACK_FRAME, stack_frame_commands::THIS_OBJECT), 2);
    }

    #[tokio::test]
    async fn test_toggle_inside_handler_with_two_suspending_threads() {
        let h = Harness::new(&[1, 2]).await;
        let registry = h.session.requests().clone();
        let ids: Vec<RequestId> = (0..2)
            .map(|_| {
                registry
                    .create(RequestBuilder::breakpoint(here()).enabled())
                    .unwrap()
            })
            .collect();
        let toggler = Arc::new(Toggler {
            registry: registry.clone(),
            ids: ids.clone(),
            sets: AtomicUsize::new(0),
        });
        h.session.add_listener(toggler.clone());
        let mut stream = h.session.subscribe();

        // both threads hit in one composite
        h.send(SuspendPolicy::All, vec![breakpoint(1), breakpoint(2)]).await;
        let set = stream.next_event_set(WAIT).await.unwrap();
        assert_eq!(set.len(), 4);
        let threads: Vec<_> = set.events().iter().filter_map(|e| e.event.thread).collect();
        assert_eq!(threads, vec![1, 1, 2, 2]);
        assert!(set.is_resumed());

        // then one batch each, back to back
        h.send(SuspendPolicy::All, vec![breakpoint(1)]).await;
        h.send(SuspendPolicy::All, vec![breakpoint(2)]).await;
        for thread in [1, 2] {
            let set = stream.next_event_set(WAIT).await.unwrap();
            assert_eq!(set.thread(), Some(thread));
            assert_eq!(set.requests().collect::<Vec<_>>(), ids);
            assert!(set.is_resumed());
        }

        assert_eq!(toggler.sets.load(Ordering::SeqCst), 3);
        let coordinator = h.session.coordinator();
        for thread in [1, 2] {
            assert_eq!(coordinator.suspend_count(thread), 0);
        }
        for id in &ids {
            assert!(registry.is_enabled(*id).unwrap());
        }
        // two installs, then a clear and reinstall per request per set
        h.eventually_sent(command_sets::EVENT_REQUEST, event_commands::SET, 8)
            .await;
        h.eventually_sent(command_sets::EVENT_REQUEST, event_commands::CLEAR, 6)
            .await;
        h.eventually_sent(command_sets::VIRTUAL_MACHINE, vm_commands::RESUME, 3)
            .await;
    }

    #[tokio::test]
    async fn test_undecodable_event_stops_session_tasks() {
        let h = Harness::new(&[1]).await;
        let disconnects = Arc::new(Disconnects::default());
        h.session.add_listener(disconnects.clone());
        let mut stream = h.session.subscribe();

        h.send(
            SuspendPolicy::None,
            vec![WireEvent {
                kind: 77,
                request_id: 0,
                details: EventDetails::ThreadStart { thread: 1 },
            }],
        )
        .await;

        assert!(matches!(
            stream.next_event_set(WAIT).await,
            Err(JdwpError::ConnectionClosed)
        ));
        assert!(matches!(
            stream.disconnect_cause(),
            Some(DisconnectCause::ProtocolViolation(_))
        ));

        let deadline = Instant::now() + WAIT;
        while !h.vm.is_shut_down() {
            assert!(Instant::now() < deadline, "transport still running");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.session
            .requests()
            .create(RequestBuilder::of_kind(EventKind::ThreadStart).enabled())
            .unwrap();
        tokio::time::sleep(SHORT).await;
        assert_eq!(h.vm.count(command_sets::EVENT_REQUEST, event_commands::SET), 0);
        assert_eq!(disconnects.causes.lock().unwrap().len(), 1);
    }
}
