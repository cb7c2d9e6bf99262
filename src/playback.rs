//! Playback engine
//!
//! A dedicated thread owns the output device and consumes audio frames in
//! arrival order. Every frame is checked against the switchboard right
//! before it is written, so a context canceled while its frames were queued
//! never reaches the speaker.
//!
//! The first frames of each context are held back and written as one block
//! once enough have arrived, which smooths out uneven arrival at startup.
//!
//! The device keeps only a short queue of its own. A barge-in or stop
//! flushes it; a pause pulls the unheard part back, fades it out and plays
//! the remainder again on resume.

use crate::context::GenerationContext;
use crate::pool::Switchboard;
use crate::protocol::Encoding;
use crate::sink::{AudioError, AudioSink};

use smallvec::SmallVec;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Decoded audio for one context.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub context: Arc<GenerationContext>,
    pub pcm: Vec<u8>,
}

#[derive(Debug)]
pub enum PlaybackItem {
    Frame(AudioFrame),
    /// No more frames will follow for this context
    EndOfContext(Arc<GenerationContext>),
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackSettings {
    pub encoding: Encoding,
    pub sample_rate: u32,
    /// Frames withheld at the start of each context
    pub initial_frames: usize,
    /// Fade ramp length in samples, used for fade-in and fade-out; zero disables
    pub fade_samples: usize,
    /// Queue poll interval, which also bounds shutdown latency
    pub poll: Duration,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            encoding: Encoding::PcmF32le,
            sample_rate: 22_050,
            initial_frames: 3,
            fade_samples: 0,
            poll: Duration::from_millis(20),
        }
    }
}

impl PlaybackSettings {
    /// Bytes of recently written audio kept for replay after a pause.
    fn history_bytes(&self) -> usize {
        (self.sample_rate as usize / 2) * self.encoding.bytes_per_sample()
    }
}

/// Shared knobs and counters of the playback thread.
#[derive(Debug)]
pub struct PlaybackControl {
    volume: AtomicU32,
    paused: AtomicBool,
    resume_fade: AtomicBool,
    flush: AtomicBool,
    written: AtomicU64,
    dropped: AtomicU64,
}

impl Default for PlaybackControl {
    fn default() -> Self {
        Self {
            volume: AtomicU32::new(1.0f32.to_bits()),
            paused: AtomicBool::new(false),
            resume_fade: AtomicBool::new(false),
            flush: AtomicBool::new(false),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }
}

impl PlaybackControl {
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    /// Output gain, clamped to `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) {
        let v = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 1.0 };
        self.volume.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Fades out and holds every frame until `resume`. Returns true if the
    /// engine was playing.
    pub fn pause(&self) -> bool {
        !self.paused.swap(true, Ordering::AcqRel)
    }

    /// Returns true if the engine was paused.
    pub fn resume(&self) -> bool {
        let was_paused = self.paused.swap(false, Ordering::AcqRel);
        if was_paused {
            self.resume_fade.store(true, Ordering::Release);
        }
        was_paused
    }

    /// Flips the paused flag and returns the new value.
    pub fn toggle_pause(&self) -> bool {
        if self.is_paused() {
            self.resume();
            false
        } else {
            self.pause();
            true
        }
    }

    /// Asks the playback thread to drop whatever the device still has
    /// queued, together with audio held back by a pause. Must be set before
    /// the playback that replaces it is resumed or enqueued.
    pub fn request_flush(&self) {
        self.flush.store(true, Ordering::Release);
    }

    fn take_flush(&self) -> bool {
        self.flush.swap(false, Ordering::AcqRel)
    }

    /// Frames that reached the sink.
    pub fn frames_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Frames discarded by the gate.
    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Cloneable producer side of the playback queue.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    tx: Sender<PlaybackItem>,
}

impl PlaybackHandle {
    pub fn push_frame(&self, context: Arc<GenerationContext>, pcm: Vec<u8>) {
        if self.tx.send(PlaybackItem::Frame(AudioFrame { context, pcm })).is_err() {
            debug!("Playback engine stopped, dropping frame");
        }
    }

    pub fn end_of_context(&self, context: Arc<GenerationContext>) {
        let _ = self.tx.send(PlaybackItem::EndOfContext(context));
    }
}

pub struct PlaybackEngine {
    handle: PlaybackHandle,
    control: Arc<PlaybackControl>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackEngine {
    /// Spawns the playback thread. The sink is opened on that thread, and
    /// this call returns once it is open (or failed to open).
    pub fn start<F>(
        settings: PlaybackSettings,
        switchboard: Arc<Switchboard>,
        open_sink: F,
    ) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<Box<dyn AudioSink>, AudioError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let (opened_tx, opened_rx) = mpsc::channel();
        let control = Arc::new(PlaybackControl::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let control = control.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("playback".to_string())
                .spawn(move || {
                    let sink = match open_sink() {
                        Ok(sink) => {
                            let _ = opened_tx.send(Ok(()));
                            sink
                        }
                        Err(e) => {
                            let _ = opened_tx.send(Err(e));
                            return;
                        }
                    };
                    Player::new(sink, settings, switchboard, control).run(rx, &shutdown);
                })?
        };

        match opened_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => return Err(AudioError::Closed),
        }

        info!(
            "Playback engine started (initial buffer {} frames, fade {} samples)",
            settings.initial_frames, settings.fade_samples
        );

        Ok(Self {
            handle: PlaybackHandle { tx },
            control,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> PlaybackHandle {
        self.handle.clone()
    }

    pub fn control(&self) -> Arc<PlaybackControl> {
        self.control.clone()
    }

    /// Stops the thread after the current poll; queued frames are discarded.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Playback thread panicked");
            }
            info!("Playback engine stopped");
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Linear gain ramp between silence and full level.
#[derive(Debug, Clone, Copy)]
struct Ramp {
    pos: usize,
    len: usize,
    falling: bool,
}

impl Ramp {
    fn rising(len: usize) -> Self {
        Self {
            pos: 0,
            len,
            falling: false,
        }
    }

    fn falling(len: usize) -> Self {
        Self {
            pos: 0,
            len,
            falling: true,
        }
    }

    fn next_gain(&mut self) -> f32 {
        if self.pos >= self.len {
            return if self.falling { 0.0 } else { 1.0 };
        }
        self.pos += 1;
        let g = self.pos as f32 / self.len as f32;
        if self.falling {
            1.0 - g
        } else {
            g
        }
    }

    fn finished(&self) -> bool {
        self.pos >= self.len
    }
}

/// Audio of one context that has been handed to the sink.
type Written = (Arc<GenerationContext>, Vec<u8>);

/// State owned by the playback thread.
struct Player {
    sink: Box<dyn AudioSink>,
    settings: PlaybackSettings,
    switchboard: Arc<Switchboard>,
    control: Arc<PlaybackControl>,
    /// Context whose frames are currently flowing
    current: Option<Arc<GenerationContext>>,
    primed: bool,
    pending: SmallVec<[AudioFrame; 4]>,
    ramp: Option<Ramp>,
    /// Most recent writes, newest last, up to `history_bytes`
    history: VecDeque<Written>,
    history_len: usize,
    /// Audio the device dropped on pause, written again on resume
    replay: VecDeque<Written>,
    /// Whether the pause has been applied to the device
    output_paused: bool,
}

impl Player {
    fn new(
        sink: Box<dyn AudioSink>,
        settings: PlaybackSettings,
        switchboard: Arc<Switchboard>,
        control: Arc<PlaybackControl>,
    ) -> Self {
        Self {
            sink,
            settings,
            switchboard,
            control,
            current: None,
            primed: false,
            pending: SmallVec::new(),
            ramp: None,
            history: VecDeque::new(),
            history_len: 0,
            replay: VecDeque::new(),
            output_paused: false,
        }
    }

    fn run(mut self, rx: Receiver<PlaybackItem>, shutdown: &AtomicBool) {
        debug!("Playback thread running");
        // Item dequeued just as a pause came in
        let mut held: Option<PlaybackItem> = None;

        while !shutdown.load(Ordering::Acquire) {
            if self.control.take_flush() {
                self.flush_output();
            }

            if self.control.is_paused() {
                if !self.output_paused {
                    self.pause_output();
                }
                std::thread::sleep(self.settings.poll);
                continue;
            }

            if self.output_paused {
                // A flush requested before the resume must win over the replay
                if self.control.take_flush() {
                    self.flush_output();
                }
                self.resume_output();
            }

            let item = match held.take() {
                Some(item) => item,
                None => match rx.recv_timeout(self.settings.poll) {
                    Ok(item) => item,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };

            if self.control.is_paused() {
                held = Some(item);
                continue;
            }

            match item {
                PlaybackItem::Frame(frame) => self.on_frame(frame),
                PlaybackItem::EndOfContext(ctx) => self.on_end(&ctx),
            }
        }

        if let Err(e) = self.sink.drain() {
            warn!("Failed to drain audio output: {}", e);
        }
        debug!("Playback thread exiting");
    }

    fn audible(&self, ctx: &GenerationContext) -> bool {
        self.switchboard.is_audible(ctx)
    }

    fn on_frame(&mut self, frame: AudioFrame) {
        if !self.audible(&frame.context) {
            self.drop_frames(1);
            return;
        }

        let is_new = self
            .current
            .as_ref()
            .map_or(true, |cur| cur.id() != frame.context.id());
        if is_new {
            // Leftovers of an unfinished context are flushed only if still
            // audible, which in practice means they are discarded.
            self.flush_pending();
            self.primed = false;
            if frame.context.fade_in() && self.settings.fade_samples > 0 {
                self.ramp = Some(Ramp::rising(self.settings.fade_samples));
            }
            debug!("Playback switched to context {}", frame.context.id());
            self.current = Some(frame.context.clone());
        }

        if self.primed {
            let AudioFrame { context, pcm } = frame;
            self.write(context, pcm, 1);
            return;
        }

        self.pending.push(frame);
        if self.pending.len() >= self.settings.initial_frames.max(1) {
            debug!("Jitter buffer primed with {} frames", self.pending.len());
            self.flush_pending();
            self.primed = true;
        }
    }

    fn on_end(&mut self, ctx: &GenerationContext) {
        let is_current = self.current.as_ref().is_some_and(|cur| cur.id() == ctx.id());
        if !is_current {
            return;
        }
        self.flush_pending();
        self.current = None;
        self.primed = false;
        debug!("Playback finished context {} ({})", ctx.id(), ctx.state());
    }

    /// Writes withheld frames as one block, re-checking each one.
    fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let frames = std::mem::take(&mut self.pending);
        let mut block = Vec::new();
        let mut context = None;
        let mut count = 0;
        for frame in frames {
            if self.audible(&frame.context) {
                block.extend_from_slice(&frame.pcm);
                context = Some(frame.context);
                count += 1;
            } else {
                self.drop_frames(1);
            }
        }
        if let Some(context) = context {
            self.write(context, block, count);
        }
    }

    fn drop_frames(&self, n: u64) {
        self.control.dropped.fetch_add(n, Ordering::Relaxed);
    }

    fn write(&mut self, context: Arc<GenerationContext>, pcm: Vec<u8>, frames: u64) {
        if self.control.resume_fade.swap(false, Ordering::AcqRel) && self.settings.fade_samples > 0 {
            self.ramp = Some(Ramp::rising(self.settings.fade_samples));
        }
        if self.output(&pcm) {
            self.control.written.fetch_add(frames, Ordering::Relaxed);
        }
        self.remember(context, pcm);
    }

    /// Applies volume and the running ramp, then writes to the sink.
    fn output(&mut self, pcm: &[u8]) -> bool {
        let volume = self.control.volume();
        let out = apply_gain(pcm, self.settings.encoding, volume, &mut self.ramp);
        if self.ramp.is_some_and(|r| r.finished()) {
            self.ramp = None;
        }

        match self.sink.write(&out) {
            Ok(()) => true,
            Err(e) => {
                error!("Audio output write failed: {}", e);
                false
            }
        }
    }

    fn remember(&mut self, context: Arc<GenerationContext>, pcm: Vec<u8>) {
        self.history_len += pcm.len();
        self.history.push_back((context, pcm));
        let limit = self.settings.history_bytes();
        while self.history_len > limit {
            match self.history.pop_front() {
                Some((_, old)) => self.history_len -= old.len(),
                None => break,
            }
        }
    }

    /// Removes the newest `bytes` of history, oldest first.
    fn take_recent(&mut self, bytes: usize) -> VecDeque<Written> {
        let width = self.settings.encoding.bytes_per_sample();
        let mut wanted = bytes - bytes % width;
        let mut recent = VecDeque::new();
        while wanted > 0 {
            let Some((ctx, mut pcm)) = self.history.pop_back() else {
                break;
            };
            self.history_len -= pcm.len();
            if pcm.len() > wanted {
                let tail = pcm.split_off(pcm.len() - wanted);
                self.history_len += pcm.len();
                self.history.push_back((ctx.clone(), pcm));
                recent.push_front((ctx, tail));
                break;
            }
            wanted -= pcm.len();
            recent.push_front((ctx, pcm));
        }
        recent
    }

    /// Barge-in or stop: the device queue and any replay are stale.
    fn flush_output(&mut self) {
        match self.sink.flush() {
            Ok(bytes) => debug!("Output flushed ({} bytes dropped)", bytes),
            Err(e) => warn!("Failed to flush audio output: {}", e),
        }
        self.history.clear();
        self.history_len = 0;
        self.replay.clear();
    }

    /// Pulls unheard audio back from the device, fades out over its first
    /// samples and keeps the rest for `resume_output`.
    fn pause_output(&mut self) {
        self.output_paused = true;
        let unheard = match self.sink.flush() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to flush audio output on pause: {}", e);
                0
            }
        };
        let mut recent = self.take_recent(unheard);
        self.history.clear();
        self.history_len = 0;

        let width = self.settings.encoding.bytes_per_sample();
        let fade_bytes = self.settings.fade_samples * width;
        let mut faded = Vec::with_capacity(fade_bytes);
        while faded.len() < fade_bytes {
            let Some((ctx, mut pcm)) = recent.pop_front() else {
                break;
            };
            if !self.audible(&ctx) {
                continue;
            }
            let take = (fade_bytes - faded.len()).min(pcm.len());
            let rest = pcm.split_off(take);
            faded.extend_from_slice(&pcm);
            if !rest.is_empty() {
                recent.push_front((ctx, rest));
            }
        }
        if !faded.is_empty() {
            self.ramp = Some(Ramp::falling(self.settings.fade_samples));
            self.output(&faded);
            self.ramp = None;
        }

        debug!(
            "Playback paused, {} bytes faded out, {} bytes kept",
            faded.len(),
            recent.iter().map(|(_, pcm)| pcm.len()).sum::<usize>()
        );
        self.replay = recent;
    }

    /// Writes back the audio pulled at pause, fading in.
    fn resume_output(&mut self) {
        self.output_paused = false;
        if self.control.resume_fade.swap(false, Ordering::AcqRel) && self.settings.fade_samples > 0 {
            self.ramp = Some(Ramp::rising(self.settings.fade_samples));
        }
        while let Some((ctx, pcm)) = self.replay.pop_front() {
            if !self.audible(&ctx) {
                continue;
            }
            self.output(&pcm);
            self.remember(ctx, pcm);
        }
        debug!("Playback resumed");
    }
}

/// Scales samples by `volume` times the ramp gain. Trailing bytes that do
/// not form a whole sample are passed through untouched.
fn apply_gain<'a>(
    pcm: &'a [u8],
    encoding: Encoding,
    volume: f32,
    ramp: &mut Option<Ramp>,
) -> Cow<'a, [u8]> {
    if volume == 1.0 && ramp.is_none() {
        return Cow::Borrowed(pcm);
    }

    let width = encoding.bytes_per_sample();
    let mut out = Vec::with_capacity(pcm.len());
    let chunks = pcm.chunks_exact(width);
    let rest = chunks.remainder();

    for b in chunks {
        let gain = volume * ramp.as_mut().map_or(1.0, Ramp::next_gain);
        match encoding {
            Encoding::PcmF32le => {
                let s = f32::from_le_bytes([b[0], b[1], b[2], b[3]]) * gain;
                out.extend_from_slice(&s.to_le_bytes());
            }
            Encoding::PcmS16le => {
                let s = i16::from_le_bytes([b[0], b[1]]) as f32 * gain;
                let s = s.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
    }
    out.extend_from_slice(rest);
    Cow::Owned(out)
}
