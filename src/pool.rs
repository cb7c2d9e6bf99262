//! Connection pool and hot-swap
//!
//! The pool owns a fixed set of connections, each driven by its own worker
//! task. Exactly one connection is audible at a time; which one is recorded
//! in the `Switchboard` together with an epoch that moves on every switch.

use crate::connection::{run_worker, Connection, ConnectionState, WorkerShared};
use crate::context::{ConnectionId, GenerationContext};
use crate::events::{emit, SpeechEvent};

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The audible connection and the activation epoch it was chosen in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSlot {
    pub index: ConnectionId,
    pub epoch: u64,
}

/// Single source of truth for which connection may be heard.
///
/// Readers take a fresh snapshot every time; nobody keeps a copy across
/// frames.
#[derive(Debug)]
pub struct Switchboard {
    slot: Mutex<ActiveSlot>,
}

impl Switchboard {
    pub fn new(index: ConnectionId) -> Self {
        Self {
            slot: Mutex::new(ActiveSlot { index, epoch: 0 }),
        }
    }

    pub fn current(&self) -> ActiveSlot {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `index` audible and starts a new epoch, even when `index` is
    /// already the active connection. Returns the new slot.
    pub fn activate(&self, index: ConnectionId) -> ActiveSlot {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.index = index;
        slot.epoch += 1;
        *slot
    }

    pub fn is_active(&self, index: ConnectionId) -> bool {
        self.current().index == index
    }

    /// Whether a frame of `ctx` may be written right now.
    pub fn is_audible(&self, ctx: &GenerationContext) -> bool {
        if ctx.is_canceled() {
            return false;
        }
        let slot = self.current();
        slot.index == ctx.connection() && slot.epoch == ctx.epoch()
    }
}

pub struct ConnectionPool {
    connections: Vec<Arc<Connection>>,
    shared: Arc<WorkerShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Creates the connections and spawns one worker per connection plus the
    /// housekeeper. Connections start out refreshing and become ready as
    /// their handshakes complete.
    pub fn start(size: usize, shared: Arc<WorkerShared>) -> Arc<Self> {
        let size = size.max(1);
        let connections: Vec<Arc<Connection>> =
            (0..size).map(|id| Arc::new(Connection::new(id))).collect();

        let mut tasks = Vec::with_capacity(size + 1);
        for conn in &connections {
            tasks.push(tokio::spawn(run_worker(conn.clone(), shared.clone())));
        }

        let pool = Arc::new(Self {
            connections,
            shared,
            tasks: Mutex::new(Vec::new()),
        });

        tasks.push(tokio::spawn(housekeeper(pool.clone())));
        *pool.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;

        info!("Connection pool started with {} connections", size);
        pool
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Out-of-range ids wrap around so callers never index past the pool.
    pub fn connection(&self, id: ConnectionId) -> &Arc<Connection> {
        &self.connections[id % self.connections.len()]
    }

    pub fn activate(&self, id: ConnectionId) -> ActiveSlot {
        let slot = self.shared.switchboard.activate(id % self.connections.len());
        debug!("Activated connection {} (epoch {})", slot.index, slot.epoch);
        slot
    }

    /// Asks the worker of `id` to reopen its socket. Returns false when the
    /// connection is not eligible: active and healthy, streaming, or already
    /// refreshing.
    pub fn refresh(&self, id: ConnectionId) -> bool {
        let conn = self.connection(id);
        if !conn.refresh_eligible(self.shared.switchboard.is_active(conn.id())) {
            return false;
        }
        conn.schedule_refresh();
        true
    }

    /// Next ready, idle connection after `previous` in round-robin order,
    /// never `previous` itself.
    pub fn next_ready(&self, previous: ConnectionId) -> Option<ConnectionId> {
        let n = self.connections.len();
        (1..n)
            .map(|step| (previous + step) % n)
            .find(|&i| self.connections[i].is_idle_ready())
    }

    /// Chooses the connection to switch to during a barge-in.
    ///
    /// With a single connection there is nothing to wait for. Otherwise the
    /// pool is polled with a linearly growing delay, and after the last
    /// attempt the previous connection is reused.
    pub async fn select_next(&self, previous: ConnectionId) -> ConnectionId {
        if self.connections.len() == 1 {
            return previous;
        }

        let config = &self.shared.config;
        let attempts = config.ready_poll_attempts.max(1);
        for attempt in 0..attempts {
            if let Some(next) = self.next_ready(previous) {
                return next;
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(config.ready_poll_interval * (attempt as u32 + 1)).await;
            }
        }

        warn!(
            "No ready connection after {} attempts, reusing connection {}",
            attempts, previous
        );
        emit(
            &self.shared.events,
            SpeechEvent::PoolExhausted { fallback: previous },
        );
        previous
    }

    /// Waits until every connection has finished its handshake.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let all_ready = || {
            self.connections
                .iter()
                .all(|c| c.state() == ConnectionState::Ready)
        };
        let result = tokio::time::timeout(timeout, async {
            while !all_ready() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        result.is_ok()
    }

    /// One housekeeping pass: stale connections are always reopened, and
    /// ready background connections are reopened once they sat idle too
    /// long.
    pub fn housekeep(&self) {
        let active = self.shared.switchboard.current().index;
        for conn in &self.connections {
            let stale = conn.state() == ConnectionState::Stale;
            let idle_too_long = conn.id() != active
                && conn.state() == ConnectionState::Ready
                && conn.idle_for() >= self.shared.config.idle_refresh_after;
            if stale || idle_too_long {
                debug!(
                    "Housekeeper refreshing connection {} (stale: {})",
                    conn.id(),
                    stale
                );
                conn.schedule_refresh();
            }
        }
    }

    /// Stops every worker and the housekeeper. Open contexts are canceled.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            let _ = task.await;
        }
        info!("Connection pool stopped");
    }
}

async fn housekeeper(pool: Arc<ConnectionPool>) {
    let mut ticker = tokio::time::interval(pool.shared.config.housekeeping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = pool.shared.shutdown.cancelled() => break,
            _ = ticker.tick() => pool.housekeep(),
        }
    }
    debug!("Housekeeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeechConfig;
    use crate::connection::Utterance;
    use crate::loopback::{LoopbackConnector, LoopbackSettings};
    use crate::playback::{PlaybackEngine, PlaybackSettings};
    use crate::sink::{AudioSink, CaptureSink};

    struct Harness {
        pool: Arc<ConnectionPool>,
        connector: LoopbackConnector,
        _engine: PlaybackEngine,
    }

    fn harness(size: usize, config: SpeechConfig) -> Harness {
        let switchboard = Arc::new(Switchboard::new(0));
        let sink = CaptureSink::new();
        let engine = PlaybackEngine::start(PlaybackSettings::default(), switchboard.clone(), move || {
            Ok(Box::new(sink) as Box<dyn AudioSink>)
        })
        .unwrap();
        let connector = LoopbackConnector::new(LoopbackSettings {
            connect_delay: Duration::from_millis(5),
            chunk_interval: Duration::from_millis(5),
            ..Default::default()
        });
        let shared = Arc::new(WorkerShared::new(
            Arc::new(connector.clone()),
            config,
            engine.handle(),
            switchboard,
            crate::events::channel(),
        ));
        Harness {
            pool: ConnectionPool::start(size, shared),
            connector,
            _engine: engine,
        }
    }

    #[test]
    fn test_switchboard_epochs() {
        let board = Switchboard::new(0);
        let ctx = GenerationContext::new(0, 0, false);
        assert!(board.is_audible(&ctx));

        let slot = board.activate(0);
        assert_eq!(slot, ActiveSlot { index: 0, epoch: 1 });
        assert!(!board.is_audible(&ctx));

        let on_one = GenerationContext::new(1, 1, false);
        assert!(!board.is_audible(&on_one));
        board.activate(1);
        let on_one = GenerationContext::new(1, 2, false);
        assert!(board.is_audible(&on_one));
        on_one.cancel();
        assert!(!board.is_audible(&on_one));
    }

    #[tokio::test]
    async fn test_round_robin_skips_previous() {
        let h = harness(3, SpeechConfig::default());
        assert!(h.pool.wait_ready(Duration::from_secs(2)).await);
        assert_eq!(h.connector.connect_count(), 3);

        assert_eq!(h.pool.next_ready(0), Some(1));
        assert_eq!(h.pool.next_ready(1), Some(2));
        assert_eq!(h.pool.next_ready(2), Some(0));
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_select_next_falls_back_when_exhausted() {
        let config = SpeechConfig {
            ready_poll_interval: Duration::from_millis(1),
            ready_poll_attempts: 3,
            ..Default::default()
        };
        let h = harness(2, config);
        assert!(h.pool.wait_ready(Duration::from_secs(2)).await);

        let mut events = h.pool.shared.events.subscribe();
        // Keep connection 1 busy with a long utterance
        let (_tx, utt) = Utterance::channel(0, false);
        h.pool.connection(1).enqueue(utt);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.pool.connection(1).state(), ConnectionState::Busy);

        assert_eq!(h.pool.select_next(0).await, 0);
        let exhausted = loop {
            match events.recv().await.unwrap() {
                SpeechEvent::PoolExhausted { fallback } => break fallback,
                _ => continue,
            }
        };
        assert_eq!(exhausted, 0);
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_connection_never_polls() {
        let h = harness(1, SpeechConfig::default());
        assert_eq!(h.pool.select_next(0).await, 0);
        assert_eq!(h.pool.next_ready(0), None);
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_eligibility() {
        let h = harness(2, SpeechConfig::default());
        assert!(h.pool.wait_ready(Duration::from_secs(2)).await);

        // Active and healthy
        assert!(!h.pool.refresh(0));
        // Background and ready
        assert!(h.pool.refresh(1));

        let refreshed = tokio::time::timeout(Duration::from_secs(2), async {
            while h.connector.connect_count() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(refreshed.is_ok());
        assert!(h.pool.wait_ready(Duration::from_secs(2)).await);
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_housekeeper_refreshes_idle_background_connection() {
        let config = SpeechConfig {
            housekeeping_interval: Duration::from_millis(20),
            idle_refresh_after: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness(2, config);
        assert!(h.pool.wait_ready(Duration::from_secs(2)).await);

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Only the background connection is recycled
        assert!(h.connector.connect_count() > 2);
        assert!(h.pool.wait_ready(Duration::from_secs(2)).await);
        h.pool.shutdown().await;
    }
}
