//! Audio output devices
//!
//! Every sink receives raw interleaved PCM in the negotiated output format.
//! Sinks are owned by the playback thread and never shared.

use crate::protocol::{Encoding, OutputFormat};

use libpulse_binding::def::BufferAttr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Samples of silence written when a Pulse stream opens, so the first real
/// audio does not land on a cold device.
const WARMUP_SAMPLES: usize = 512;

/// Audio the server keeps queued ahead of the speaker. Everything inside
/// this window has already passed the playback gate, so it bounds how long
/// stale speech can linger until the next flush.
const TARGET_LATENCY_MS: u32 = 80;
/// Audio required before a stopped stream starts again
const PREBUF_MS: u32 = 20;

/// Error type for audio output
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("PulseAudio error: {0}")]
    Pulse(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audio output closed")]
    Closed,
}

/// Destination for PCM bytes.
pub trait AudioSink {
    /// Blocking write of one contiguous block.
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError>;

    /// Wait until everything written so far has been played.
    fn drain(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    /// Drop audio that was written but not heard yet. Returns roughly how
    /// many bytes were dropped.
    fn flush(&mut self) -> Result<usize, AudioError> {
        Ok(0)
    }
}

impl AudioSink for Box<dyn AudioSink> {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        (**self).write(pcm)
    }

    fn drain(&mut self) -> Result<(), AudioError> {
        (**self).drain()
    }

    fn flush(&mut self) -> Result<usize, AudioError> {
        (**self).flush()
    }
}

/// Playback on the default PulseAudio sink through the simple API.
pub struct PulseSink {
    simple: Simple,
    bytes_per_sample: usize,
    bytes_per_second: u64,
}

impl PulseSink {
    pub fn new(app_name: &str, format: &OutputFormat) -> Result<Self, AudioError> {
        let spec = Spec {
            format: match format.encoding {
                Encoding::PcmF32le => Format::F32le,
                Encoding::PcmS16le => Format::S16le,
            },
            channels: 1,
            rate: format.sample_rate,
        };
        if !spec.is_valid() {
            return Err(AudioError::Pulse(format!("invalid sample spec {:?}", spec)));
        }

        let bytes_per_sample = format.encoding.bytes_per_sample();
        let bytes_per_second = format.sample_rate as u64 * bytes_per_sample as u64;
        let ms_to_bytes = |ms: u32| (bytes_per_second * ms as u64 / 1000) as u32;

        // Keep the server-side queue short so a flush silences stale audio at once
        let buffer_attr = BufferAttr {
            maxlength: u32::MAX, // server default
            tlength: ms_to_bytes(TARGET_LATENCY_MS),
            prebuf: ms_to_bytes(PREBUF_MS),
            minreq: u32::MAX,   // server default
            fragsize: u32::MAX, // recording only
        };

        let simple = Simple::new(
            None,     // default server
            app_name, // application name
            Direction::Playback,
            None,     // default device
            "speech", // stream description
            &spec,
            None, // default channel map
            Some(&buffer_attr),
        )
        .map_err(|e| AudioError::Pulse(ToString::to_string(&e)))?;

        info!(
            "Opened PulseAudio playback: {:?} @ {} Hz, {} ms target latency",
            format.encoding, format.sample_rate, TARGET_LATENCY_MS
        );

        let mut sink = Self {
            simple,
            bytes_per_sample,
            bytes_per_second,
        };
        let silence = vec![0u8; WARMUP_SAMPLES * format.encoding.bytes_per_sample()];
        sink.write(&silence)?;
        Ok(sink)
    }
}

impl AudioSink for PulseSink {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        self.simple
            .write(pcm)
            .map_err(|e| AudioError::Pulse(ToString::to_string(&e)))
    }

    fn drain(&mut self) -> Result<(), AudioError> {
        self.simple
            .drain()
            .map_err(|e| AudioError::Pulse(ToString::to_string(&e)))
    }

    fn flush(&mut self) -> Result<usize, AudioError> {
        let queued = self
            .simple
            .get_latency()
            .map_or(0, |latency| queued_bytes(latency.0, self.bytes_per_second, self.bytes_per_sample));
        self.simple
            .flush()
            .map_err(|e| AudioError::Pulse(ToString::to_string(&e)))?;
        debug!("Flushed about {} queued bytes from PulseAudio", queued);
        Ok(queued)
    }
}

/// Bytes of audio covering `micros`, rounded down to whole samples.
fn queued_bytes(micros: u64, bytes_per_second: u64, bytes_per_sample: usize) -> usize {
    let bytes = (micros as u128 * bytes_per_second as u128 / 1_000_000) as usize;
    bytes - bytes % bytes_per_sample.max(1)
}

/// Records everything that reaches the output into a mono WAV file.
pub struct WavSink {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    encoding: Encoding,
}

impl WavSink {
    pub fn create(path: impl AsRef<Path>, format: &OutputFormat) -> Result<Self, AudioError> {
        let spec = match format.encoding {
            Encoding::PcmF32le => hound::WavSpec {
                channels: 1,
                sample_rate: format.sample_rate,
                bits_per_sample: 32,
                sample_format: hound::SampleFormat::Float,
            },
            Encoding::PcmS16le => hound::WavSpec {
                channels: 1,
                sample_rate: format.sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            },
        };
        let writer = hound::WavWriter::create(path.as_ref(), spec)?;
        info!("Recording speech output to {}", path.as_ref().display());
        Ok(Self {
            writer: Some(writer),
            encoding: format.encoding,
        })
    }

    /// Writes the header and closes the file.
    pub fn finalize(mut self) -> Result<(), AudioError> {
        match self.writer.take() {
            Some(writer) => Ok(writer.finalize()?),
            None => Ok(()),
        }
    }
}

impl AudioSink for WavSink {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        let writer = self.writer.as_mut().ok_or(AudioError::Closed)?;
        match self.encoding {
            Encoding::PcmF32le => {
                for b in pcm.chunks_exact(4) {
                    writer.write_sample(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))?;
                }
            }
            Encoding::PcmS16le => {
                for b in pcm.chunks_exact(2) {
                    writer.write_sample(i16::from_le_bytes([b[0], b[1]]))?;
                }
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), AudioError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// In-memory sink; clones share the same buffer so a test can keep one
/// handle while the playback thread owns the other.
#[derive(Debug, Clone, Default)]
pub struct CaptureSink {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    flushes: Arc<AtomicUsize>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write call, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All bytes written, concatenated.
    pub fn bytes(&self) -> Vec<u8> {
        self.writes().concat()
    }

    /// Number of flush requests received.
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl AudioSink for CaptureSink {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        debug!("Captured {} bytes", pcm.len());
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pcm.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> Result<usize, AudioError> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(0)
    }
}
