//! Pooled backend connection and its worker task
//!
//! Each connection owns one transport, a queue of utterances waiting for it,
//! and a registry of the contexts it has open. The worker task is the only
//! code that touches the transport; everybody else talks to the connection
//! through its locks and the wake-up notifier.

use crate::config::SpeechConfig;
use crate::context::{ConnectionId, ContextRegistry, GenerationContext};
use crate::events::{emit, EventSender, SpeechEvent};
use crate::playback::PlaybackHandle;
use crate::pool::Switchboard;
use crate::protocol::{decode_audio, ClientMessage, Result, ServerMessage, TtsError};
use crate::transport::{Connector, Transport};

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Handshake done, nothing streaming
    Ready,
    /// A context is streaming
    Busy,
    /// Socket being (re)opened
    Refreshing,
    /// Socket lost or never opened; waits for a refresh
    Stale,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Refreshing => "refreshing",
            Self::Stale => "stale",
        };
        f.write_str(name)
    }
}

/// Text for one generation context. Units arrive over a channel so an
/// utterance can still be growing while its first units are synthesized;
/// the sender side closing ends the utterance.
#[derive(Debug)]
pub struct Utterance {
    units: UnboundedReceiver<String>,
    epoch: u64,
    fade_in: bool,
}

impl Utterance {
    pub fn channel(epoch: u64, fade_in: bool) -> (UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                units: rx,
                epoch,
                fade_in,
            },
        )
    }

    pub fn from_units(units: Vec<String>, epoch: u64, fade_in: bool) -> Self {
        let (tx, utt) = Self::channel(epoch, fade_in);
        for unit in units {
            let _ = tx.send(unit);
        }
        utt
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Everything the workers share with each other and with the pool.
pub struct WorkerShared {
    pub connector: Arc<dyn Connector>,
    pub config: SpeechConfig,
    pub playback: PlaybackHandle,
    pub switchboard: Arc<Switchboard>,
    pub events: EventSender,
    pub shutdown: CancellationToken,
}

impl WorkerShared {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: SpeechConfig,
        playback: PlaybackHandle,
        switchboard: Arc<Switchboard>,
        events: EventSender,
    ) -> Self {
        Self {
            connector,
            config,
            playback,
            switchboard,
            events,
            shutdown: CancellationToken::new(),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Connection {
    id: ConnectionId,
    state: Mutex<ConnectionState>,
    registry: Mutex<ContextRegistry>,
    queue: Mutex<VecDeque<Utterance>>,
    wake: Notify,
    refresh_pending: AtomicBool,
    last_used: Mutex<Instant>,
}

impl Connection {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: Mutex::new(ConnectionState::Refreshing),
            registry: Mutex::new(ContextRegistry::new()),
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            refresh_pending: AtomicBool::new(false),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!("Connection {}: {} -> {}", self.id, *state, next);
            *state = next;
        }
    }

    /// Ready with nothing queued, so a new utterance would start at once.
    pub fn is_idle_ready(&self) -> bool {
        let state = lock(&self.state);
        *state == ConnectionState::Ready && lock(&self.queue).is_empty()
    }

    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_used).elapsed()
    }

    fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    /// Appends an utterance behind whatever this connection is doing.
    pub fn enqueue(&self, utterance: Utterance) {
        lock(&self.queue).push_back(utterance);
        self.wake.notify_one();
    }

    /// Pops the next utterance and marks the connection busy, but only when
    /// it is ready.
    fn claim_next(&self) -> Option<Utterance> {
        let mut state = lock(&self.state);
        if *state != ConnectionState::Ready {
            return None;
        }
        let utterance = lock(&self.queue).pop_front()?;
        *state = ConnectionState::Busy;
        Some(utterance)
    }

    fn register(&self, ctx: Arc<GenerationContext>) -> Result<()> {
        lock(&self.registry).register(ctx)
    }

    fn deregister(&self, id: &str) {
        lock(&self.registry).deregister(id);
    }

    /// Cancels the streaming context and drops every queued utterance.
    /// Returns the id of the canceled context, if there was one.
    ///
    /// The local flag is set before the context leaves the registry; the
    /// backend cancel is sent later by the worker.
    pub fn interrupt(&self) -> Option<String> {
        let canceled = {
            let mut registry = lock(&self.registry);
            let current = registry.current().cloned();
            match current {
                Some(ctx) => {
                    let moved = ctx.cancel();
                    registry.deregister(ctx.id());
                    moved.then(|| ctx.id().to_string())
                }
                None => None,
            }
        };

        let dropped = {
            let mut queue = lock(&self.queue);
            let n = queue.len();
            queue.clear();
            n
        };

        if canceled.is_some() || dropped > 0 {
            info!(
                "Connection {} interrupted: canceled {:?}, dropped {} queued utterances",
                self.id, canceled, dropped
            );
        }
        self.wake.notify_one();
        canceled
    }

    /// Stale connections are always eligible; a ready one only while it is
    /// not the audible connection.
    pub fn refresh_eligible(&self, active: bool) -> bool {
        match self.state() {
            ConnectionState::Stale => true,
            ConnectionState::Ready => !active,
            ConnectionState::Busy | ConnectionState::Refreshing => false,
        }
    }

    /// Asks the worker to reopen the socket once it is idle.
    pub fn schedule_refresh(&self) {
        self.refresh_pending.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Consumes a pending refresh request if the connection may refresh
    /// now. A request against the active ready connection is discarded.
    fn begin_refresh(&self, active: bool) -> bool {
        if !self.refresh_pending.load(Ordering::Acquire) {
            return false;
        }
        let mut state = lock(&self.state);
        let eligible = match *state {
            ConnectionState::Stale => true,
            ConnectionState::Ready => !active,
            _ => return false,
        };
        self.refresh_pending.store(false, Ordering::Release);
        if eligible {
            *state = ConnectionState::Refreshing;
        }
        eligible
    }

    /// Transport failure: the queue is dropped rather than retried on a new
    /// socket.
    fn mark_stale(&self) {
        let dropped = {
            let mut queue = lock(&self.queue);
            let n = queue.len();
            queue.clear();
            n
        };
        for ctx in lock(&self.registry).clear() {
            ctx.fail();
        }
        if dropped > 0 {
            warn!("Connection {} dropped {} queued utterances", self.id, dropped);
        }
        self.set_state(ConnectionState::Stale);
    }
}

/// How a streaming pass ended.
enum StreamOutcome {
    Finished,
    TransportLost(TtsError),
    Shutdown,
}

async fn recv_opt(transport: &mut Option<Transport>) -> Result<ServerMessage> {
    match transport {
        Some(t) => t.recv().await,
        None => std::future::pending().await,
    }
}

/// Drives one connection until shutdown.
pub async fn run_worker(conn: Arc<Connection>, shared: Arc<WorkerShared>) {
    let mut transport: Option<Transport> = None;
    let id = conn.id();

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        if conn.state() == ConnectionState::Refreshing {
            transport = None;
            let connected = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                res = shared.connector.connect() => res,
            };
            match connected {
                Ok(t) => {
                    transport = Some(t);
                    conn.touch();
                    conn.set_state(ConnectionState::Ready);
                    info!("Connection {} ready", id);
                    emit(&shared.events, SpeechEvent::ConnectionReady { connection: id });
                }
                Err(e) => {
                    warn!("Connection {} failed to connect: {}", id, e);
                    conn.set_state(ConnectionState::Stale);
                    emit(
                        &shared.events,
                        SpeechEvent::ConnectionStale {
                            connection: id,
                            reason: e.to_string(),
                        },
                    );
                }
            }
            continue;
        }

        if let Some(t) = transport.as_mut() {
            if let Some(utterance) = conn.claim_next() {
                match stream_utterance(&conn, &shared, t, utterance).await {
                    StreamOutcome::Finished => {
                        conn.touch();
                        let mut state = lock(&conn.state);
                        if *state == ConnectionState::Busy {
                            *state = ConnectionState::Ready;
                        }
                    }
                    StreamOutcome::TransportLost(e) => {
                        lose_transport(&conn, &shared, &mut transport, e);
                    }
                    StreamOutcome::Shutdown => break,
                }
                continue;
            }
        }

        if conn.begin_refresh(shared.switchboard.is_active(id)) {
            info!("Refreshing connection {}", id);
            continue;
        }

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = conn.wake.notified() => {}
            msg = recv_opt(&mut transport) => match msg {
                Ok(msg) => {
                    debug!("Connection {} discarding idle message for {:?}", id, msg.context_id());
                }
                Err(e) if e.is_transport() => {
                    lose_transport(&conn, &shared, &mut transport, e);
                }
                Err(e) => {
                    debug!("Connection {} ignoring malformed idle message: {}", id, e);
                }
            },
        }
    }

    for ctx in lock(&conn.registry).clear() {
        ctx.cancel();
    }
    debug!("Connection {} worker stopped", id);
}

fn lose_transport(
    conn: &Connection,
    shared: &WorkerShared,
    transport: &mut Option<Transport>,
    e: TtsError,
) {
    error!("Connection {} lost its transport: {}", conn.id(), e);
    *transport = None;
    conn.mark_stale();
    emit(
        &shared.events,
        SpeechEvent::ConnectionStale {
            connection: conn.id(),
            reason: e.to_string(),
        },
    );
    conn.schedule_refresh();
}

/// Streams one utterance as a single generation context.
async fn stream_utterance(
    conn: &Connection,
    shared: &WorkerShared,
    transport: &mut Transport,
    utterance: Utterance,
) -> StreamOutcome {
    let Utterance {
        mut units,
        epoch,
        fade_in,
    } = utterance;

    if shared.switchboard.current().epoch != epoch {
        debug!("Connection {} skipping utterance from epoch {}", conn.id(), epoch);
        return StreamOutcome::Finished;
    }

    let ctx = Arc::new(GenerationContext::new(conn.id(), epoch, fade_in));
    if let Err(e) = conn.register(ctx.clone()) {
        error!("Connection {}: {}", conn.id(), e);
        return StreamOutcome::Finished;
    }
    // A switch may have landed between the claim and the registration
    if shared.switchboard.current().epoch != epoch {
        ctx.cancel();
    }

    info!("Context {} opened on connection {}", ctx.id(), conn.id());
    emit(
        &shared.events,
        SpeechEvent::ContextStarted {
            connection: conn.id(),
            context_id: ctx.id().to_string(),
        },
    );

    let mut sent_any = false;
    let mut input_done = false;
    let mut frames = 0usize;

    let outcome = loop {
        tokio::select! {
            biased;

            _ = shared.shutdown.cancelled() => {
                ctx.cancel();
                break StreamOutcome::Shutdown;
            }

            _ = ctx.cancelled() => {
                if sent_any {
                    if let Err(e) = transport.send(ClientMessage::cancel(ctx.id())) {
                        debug!("Cancel for {} not sent: {}", ctx.id(), e);
                    }
                }
                info!("Context {} canceled after {} frames", ctx.id(), frames);
                break StreamOutcome::Finished;
            }

            unit = units.recv(), if !input_done => match unit {
                Some(text) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    let req = shared.config.request(ctx.id(), &text, true);
                    if let Err(e) = transport.send(ClientMessage::Generate(req)) {
                        ctx.fail();
                        break StreamOutcome::TransportLost(e);
                    }
                    ctx.start_streaming();
                    sent_any = true;
                    debug!("Context {} sent unit {:?}", ctx.id(), text);
                }
                None => {
                    input_done = true;
                    if !sent_any {
                        ctx.complete();
                        break StreamOutcome::Finished;
                    }
                    let req = shared.config.request(ctx.id(), "", false);
                    if let Err(e) = transport.send(ClientMessage::Generate(req)) {
                        ctx.fail();
                        break StreamOutcome::TransportLost(e);
                    }
                }
            },

            msg = transport.recv() => match msg {
                Ok(ServerMessage::Chunk { context_id, data, done }) if context_id == ctx.id() => {
                    match decode_audio(&data) {
                        Ok(pcm) => {
                            if shared.switchboard.current().epoch != ctx.epoch() {
                                ctx.cancel();
                                continue;
                            }
                            frames += 1;
                            shared.playback.push_frame(ctx.clone(), pcm);
                        }
                        Err(e) => {
                            warn!("Context {} received bad audio: {}", ctx.id(), e);
                            ctx.fail();
                            break StreamOutcome::Finished;
                        }
                    }
                    if done {
                        ctx.complete();
                        break StreamOutcome::Finished;
                    }
                }
                Ok(ServerMessage::Timestamps { context_id, word_timestamps }) if context_id == ctx.id() => {
                    emit(
                        &shared.events,
                        SpeechEvent::Words {
                            context_id,
                            words: word_timestamps.timings(),
                        },
                    );
                }
                Ok(ServerMessage::Done { context_id }) if context_id == ctx.id() => {
                    ctx.complete();
                    break StreamOutcome::Finished;
                }
                Ok(ServerMessage::Error { context_id, error })
                    if context_id.as_deref().map_or(true, |c| c == ctx.id()) =>
                {
                    let e = TtsError::Backend { context_id, message: error };
                    warn!("Context {} failed: {}", ctx.id(), e);
                    ctx.fail();
                    break StreamOutcome::Finished;
                }
                Ok(other) => {
                    debug!("Discarding message for context {:?}", other.context_id());
                }
                Err(e) if e.is_transport() => {
                    ctx.fail();
                    break StreamOutcome::TransportLost(e);
                }
                Err(e) => {
                    warn!("Context {} protocol error: {}", ctx.id(), e);
                    ctx.fail();
                    break StreamOutcome::Finished;
                }
            },
        }
    };

    conn.deregister(ctx.id());
    shared.playback.end_of_context(ctx.clone());

    let state = ctx.state();
    info!("Context {} {} ({} frames)", ctx.id(), state, frames);
    emit(
        &shared.events,
        SpeechEvent::ContextFinished {
            connection: conn.id(),
            context_id: ctx.id().to_string(),
            state,
        },
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextState;
    use crate::loopback::{LoopbackConnector, LoopbackSettings};
    use crate::playback::{PlaybackEngine, PlaybackSettings};
    use crate::sink::{AudioSink, CaptureSink};
    use tokio::sync::broadcast;

    struct Harness {
        conn: Arc<Connection>,
        shared: Arc<WorkerShared>,
        capture: CaptureSink,
        events: broadcast::Receiver<SpeechEvent>,
        connector: LoopbackConnector,
        _engine: PlaybackEngine,
    }

    fn settings() -> LoopbackSettings {
        LoopbackSettings {
            chunks_per_unit: 2,
            chunk_interval: Duration::from_millis(3),
            cancel_lag: 2,
            connect_delay: Duration::from_millis(2),
            render: Arc::new(|t: &str, i: usize| format!("[{}{}]", t.trim(), i).into_bytes()),
            fail_on: Some("boom".to_string()),
            corrupt_on: Some("noise".to_string()),
            drop_after: None,
        }
    }

    fn harness(loopback: LoopbackSettings) -> Harness {
        let capture = CaptureSink::new();
        let switchboard = Arc::new(Switchboard::new(0));
        let sink = capture.clone();
        let engine = PlaybackEngine::start(
            PlaybackSettings {
                initial_frames: 1,
                poll: Duration::from_millis(5),
                ..Default::default()
            },
            switchboard.clone(),
            move || Ok(Box::new(sink) as Box<dyn AudioSink>),
        )
        .unwrap();
        let connector = LoopbackConnector::new(loopback);
        let events = crate::events::channel();
        let rx = events.subscribe();
        let shared = Arc::new(WorkerShared::new(
            Arc::new(connector.clone()),
            SpeechConfig::default(),
            engine.handle(),
            switchboard,
            events,
        ));
        let conn = Arc::new(Connection::new(0));
        tokio::spawn(run_worker(conn.clone(), shared.clone()));
        Harness {
            conn,
            shared,
            capture,
            events: rx,
            connector,
            _engine: engine,
        }
    }

    async fn finished(events: &mut broadcast::Receiver<SpeechEvent>) -> ContextState {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(SpeechEvent::ContextFinished { state, .. }) = events.recv().await {
                    return state;
                }
            }
        })
        .await
        .unwrap()
    }

    async fn wait_state(conn: &Connection, want: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while conn.state() != want {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn settle(capture: &CaptureSink, expected: &[u8]) {
        let ok = tokio::time::timeout(Duration::from_secs(2), async {
            while capture.bytes() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(ok.is_ok(), "got {:?}", String::from_utf8_lossy(&capture.bytes()));
    }

    #[tokio::test]
    async fn test_utterance_streams_in_order() {
        let mut h = harness(settings());
        wait_state(&h.conn, ConnectionState::Ready).await;

        h.conn.enqueue(Utterance::from_units(vec!["One.".into(), " Two.".into()], 0, false));
        assert_eq!(finished(&mut h.events).await, ContextState::Completed);
        settle(&h.capture, b"[One.0][One.1][Two.0][Two.1]").await;
        wait_state(&h.conn, ConnectionState::Ready).await;
    }

    #[tokio::test]
    async fn test_empty_utterance_completes_without_request() {
        let mut h = harness(settings());
        wait_state(&h.conn, ConnectionState::Ready).await;

        h.conn.enqueue(Utterance::from_units(vec!["   ".into()], 0, false));
        assert_eq!(finished(&mut h.events).await, ContextState::Completed);
        assert!(h.capture.bytes().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_cancels_and_drops_late_frames() {
        let mut s = settings();
        s.chunk_interval = Duration::from_millis(25);
        let mut h = harness(s);
        wait_state(&h.conn, ConnectionState::Ready).await;

        let (tx, utt) = Utterance::channel(0, false);
        tx.send("Long text.".into()).unwrap();
        h.conn.enqueue(utt);
        h.conn.enqueue(Utterance::from_units(vec!["Queued.".into()], 0, false));
        wait_state(&h.conn, ConnectionState::Busy).await;

        let canceled = h.conn.interrupt();
        assert!(canceled.is_some());
        assert_eq!(h.conn.queued(), 0);
        assert_eq!(finished(&mut h.events).await, ContextState::Canceled);

        // Lagging chunks of the canceled context land on the idle loop
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!h.capture.bytes().windows(7).any(|w| w == b"Queued."));

        h.conn.enqueue(Utterance::from_units(vec!["Next.".into()], 0, false));
        assert_eq!(finished(&mut h.events).await, ContextState::Completed);
        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            while !h.capture.bytes().ends_with(b"[Next.0][Next.1]") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(ended.is_ok());
        let heard = String::from_utf8(h.capture.bytes()).unwrap();
        assert!(!heard.contains("Long text.1"), "heard {}", heard);
    }

    #[tokio::test]
    async fn test_backend_error_fails_context_only() {
        let mut h = harness(settings());
        wait_state(&h.conn, ConnectionState::Ready).await;

        h.conn.enqueue(Utterance::from_units(vec!["boom.".into()], 0, false));
        assert_eq!(finished(&mut h.events).await, ContextState::Failed);
        wait_state(&h.conn, ConnectionState::Ready).await;
        assert_eq!(h.connector.connect_count(), 1);

        h.conn.enqueue(Utterance::from_units(vec!["Fine.".into()], 0, false));
        assert_eq!(finished(&mut h.events).await, ContextState::Completed);
    }

    #[tokio::test]
    async fn test_bad_audio_fails_context_without_reconnect() {
        let mut h = harness(settings());
        wait_state(&h.conn, ConnectionState::Ready).await;

        h.conn.enqueue(Utterance::from_units(vec!["Static noise.".into()], 0, false));
        assert_eq!(finished(&mut h.events).await, ContextState::Failed);
        wait_state(&h.conn, ConnectionState::Ready).await;
        assert!(h.capture.bytes().is_empty());

        h.conn.enqueue(Utterance::from_units(vec!["Clear.".into()], 0, false));
        assert_eq!(finished(&mut h.events).await, ContextState::Completed);
        settle(&h.capture, b"[Clear.0][Clear.1]").await;
        assert_eq!(h.connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_loss_marks_stale_and_reconnects() {
        let mut s = settings();
        s.drop_after = Some(1);
        let mut h = harness(s);
        wait_state(&h.conn, ConnectionState::Ready).await;

        h.conn.enqueue(Utterance::from_units(vec!["Dropped.".into()], 0, false));
        h.conn.enqueue(Utterance::from_units(vec!["Also dropped.".into()], 0, false));
        assert_eq!(finished(&mut h.events).await, ContextState::Failed);

        let reconnected = tokio::time::timeout(Duration::from_secs(2), async {
            while h.connector.connect_count() < 2 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await;
        assert!(reconnected.is_ok());
        wait_state(&h.conn, ConnectionState::Ready).await;
        assert_eq!(h.conn.queued(), 0);
        h.shared.shutdown.cancel();
    }

    #[test]
    fn test_refresh_eligibility_by_state() {
        let conn = Connection::new(0);
        assert!(!conn.refresh_eligible(false));
        conn.set_state(ConnectionState::Ready);
        assert!(conn.refresh_eligible(false));
        assert!(!conn.refresh_eligible(true));
        conn.set_state(ConnectionState::Busy);
        assert!(!conn.refresh_eligible(false));
        conn.set_state(ConnectionState::Stale);
        assert!(conn.refresh_eligible(true));

        conn.schedule_refresh();
        assert!(conn.begin_refresh(true));
        assert_eq!(conn.state(), ConnectionState::Refreshing);
        assert!(!conn.begin_refresh(false));
    }
}
