//! Speech controller
//!
//! Entry point for callers. `speak` queues text behind whatever is playing;
//! `interrupt_and_speak` cuts the current speech off and starts the new
//! text on a pre-warmed connection, so the switch costs a handful of lock
//! operations and no network round-trip.

use crate::config::SpeechConfig;
use crate::connection::{ConnectionState, Utterance, WorkerShared};
use crate::context::ConnectionId;
use crate::events::{self, emit, EventSender, SpeechEvent};
use crate::playback::{PlaybackControl, PlaybackEngine, PlaybackSettings};
use crate::pool::{ConnectionPool, Switchboard};
use crate::protocol::Result;
use crate::segmenter::{speakable_units, split_text};
use crate::sink::{AudioError, AudioSink, PulseSink};
use crate::transport::{Connector, WsConnector};

use futures_util::{Stream, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// What a barge-in did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BargeIn {
    pub from: ConnectionId,
    pub to: ConnectionId,
    /// Context that was cut off, if anything was streaming
    pub canceled: Option<String>,
}

pub struct SpeechController {
    config: SpeechConfig,
    pool: Arc<ConnectionPool>,
    switchboard: Arc<Switchboard>,
    control: Arc<PlaybackControl>,
    engine: Mutex<Option<PlaybackEngine>>,
    events: EventSender,
    /// Serializes barge-ins and stops against each other
    barge_lock: tokio::sync::Mutex<()>,
}

impl SpeechController {
    /// Starts the playback thread and the connection pool. Connections come
    /// up in the background; see `wait_ready`.
    pub fn start<F>(config: SpeechConfig, connector: Arc<dyn Connector>, open_sink: F) -> Result<Self>
    where
        F: FnOnce() -> std::result::Result<Box<dyn AudioSink>, AudioError> + Send + 'static,
    {
        let switchboard = Arc::new(Switchboard::new(0));
        let settings = PlaybackSettings {
            encoding: config.encoding(),
            sample_rate: config.output_format.sample_rate,
            initial_frames: config.initial_buffer_frames(),
            fade_samples: config.fade_samples(),
            poll: config.playback_poll,
        };
        let engine = PlaybackEngine::start(settings, switchboard.clone(), open_sink)?;
        let events = events::channel();

        let shared = Arc::new(WorkerShared::new(
            connector,
            config.clone(),
            engine.handle(),
            switchboard.clone(),
            events.clone(),
        ));
        let pool = ConnectionPool::start(config.pool_size(), shared);

        Ok(Self {
            config,
            pool,
            switchboard,
            control: engine.control(),
            engine: Mutex::new(Some(engine)),
            events,
            barge_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Hosted backend over websockets, played through PulseAudio.
    pub fn connect(config: SpeechConfig) -> Result<Self> {
        let connector = Arc::new(WsConnector::new(config.endpoint()?, config.connect_timeout));
        let format = config.output_format;
        Self::start(config, connector, move || {
            Ok(Box::new(PulseSink::new("rhospeak", &format)?) as Box<dyn AudioSink>)
        })
    }

    pub fn config(&self) -> &SpeechConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpeechEvent> {
        self.events.subscribe()
    }

    /// Waits until every pooled connection has completed its handshake.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        self.pool.wait_ready(timeout).await
    }

    pub fn active_connection(&self) -> ConnectionId {
        self.switchboard.current().index
    }

    /// Whether the audible connection is streaming or has text waiting.
    pub fn is_speaking(&self) -> bool {
        let conn = self.pool.connection(self.active_connection());
        conn.state() == ConnectionState::Busy || conn.queued() > 0
    }

    /// Queues `text` on the active connection without disturbing what is
    /// already playing. Returns false when there is nothing to say.
    pub fn speak(&self, text: &str) -> bool {
        let units = split_text(text);
        if units.is_empty() {
            return false;
        }
        let slot = self.switchboard.current();
        debug!("Queueing {} units on connection {}", units.len(), slot.index);
        self.pool
            .connection(slot.index)
            .enqueue(Utterance::from_units(units, slot.epoch, false));
        true
    }

    /// Speaks a fragment stream as one context, segmenting as it arrives.
    /// The returned task yields the number of units fed; it stops early
    /// once the utterance is interrupted.
    pub fn speak_stream<S>(&self, fragments: S) -> JoinHandle<usize>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let slot = self.switchboard.current();
        let (tx, utterance) = Utterance::channel(slot.epoch, false);
        self.pool.connection(slot.index).enqueue(utterance);
        tokio::spawn(feed_units(fragments, tx))
    }

    /// Barge-in: cancels what is playing and speaks `text` instead.
    pub async fn interrupt_and_speak(&self, text: &str) -> BargeIn {
        let units = split_text(text);
        self.barge_in(move |epoch| Utterance::from_units(units, epoch, true))
            .await
    }

    /// Barge-in with a fragment stream as the replacement speech.
    pub async fn interrupt_and_speak_stream<S>(&self, fragments: S) -> (BargeIn, JoinHandle<usize>)
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let mut feeder = None;
        let barge = self
            .barge_in(|epoch| {
                let (tx, utterance) = Utterance::channel(epoch, true);
                feeder = Some(tx);
                utterance
            })
            .await;
        let handle = match feeder {
            Some(tx) => tokio::spawn(feed_units(fragments, tx)),
            None => tokio::spawn(async { 0 }),
        };
        (barge, handle)
    }

    async fn barge_in<F>(&self, build: F) -> BargeIn
    where
        F: FnOnce(u64) -> Utterance,
    {
        let _guard = self.barge_lock.lock().await;

        let previous = self.switchboard.current();
        let old = self.pool.connection(previous.index);
        let canceled = old.interrupt();
        // The device still holds audio of the canceled context
        self.control.request_flush();
        self.control.resume();

        let next = self.pool.select_next(previous.index).await;
        let slot = self.pool.activate(next);
        self.pool.connection(slot.index).enqueue(build(slot.epoch));

        if slot.index != previous.index {
            old.schedule_refresh();
        }

        info!(
            "Barge-in: connection {} -> {} (epoch {}), canceled {:?}",
            previous.index, slot.index, slot.epoch, canceled
        );
        emit(
            &self.events,
            SpeechEvent::Interrupted {
                from: previous.index,
                to: slot.index,
                canceled: canceled.clone(),
            },
        );

        BargeIn {
            from: previous.index,
            to: slot.index,
            canceled,
        }
    }

    /// Silences the active connection and drops its queue. Returns the id
    /// of the canceled context.
    ///
    /// The connection stays active but moves to a new epoch, so an utterance
    /// its worker claimed just before the stop never becomes audible.
    pub async fn stop(&self) -> Option<String> {
        let _guard = self.barge_lock.lock().await;
        let active = self.active_connection();
        let canceled = self.pool.connection(active).interrupt();
        self.pool.activate(active);
        self.control.request_flush();
        info!("Speech stopped, canceled {:?}", canceled);
        canceled
    }

    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    /// Returns true when playback is now paused.
    pub fn toggle_pause(&self) -> bool {
        self.control.toggle_pause()
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn set_volume(&self, volume: f32) {
        self.control.set_volume(volume)
    }

    pub fn volume(&self) -> f32 {
        self.control.volume()
    }

    pub fn playback(&self) -> &PlaybackControl {
        &self.control
    }

    /// Stops the workers, then the playback thread.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        let engine = self
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut engine) = engine {
            engine.shutdown();
        }
        info!("Speech controller shut down");
    }
}

async fn feed_units<S>(fragments: S, tx: tokio::sync::mpsc::UnboundedSender<String>) -> usize
where
    S: Stream<Item = String> + Send + 'static,
{
    let units = speakable_units(fragments);
    tokio::pin!(units);
    let mut fed = 0;
    loop {
        let unit = tokio::select! {
            _ = tx.closed() => None,
            unit = units.next() => unit,
        };
        let Some(unit) = unit else {
            break;
        };
        if tx.send(unit).is_err() {
            break;
        }
        fed += 1;
    }
    if tx.is_closed() {
        debug!("Utterance closed after {} units, stopping feeder", fed);
    }
    fed
}
