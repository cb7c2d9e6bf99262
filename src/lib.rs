//! rhospeak - interruptible speech playback over streaming TTS websockets
//!
//! Text is cut into speakable units, synthesized over a small pool of
//! pre-warmed connections and played through a jitter buffer. A barge-in
//! silences the current speech and moves to another connection immediately,
//! while the interrupted one is reopened in the background.

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod context;
pub mod controller;
pub mod events;
pub mod llm;
pub mod loopback;
pub mod playback;
pub mod pool;
pub mod protocol;
pub mod segmenter;
pub mod sink;
pub mod transport;

pub use config::SpeechConfig;
pub use context::{ContextState, GenerationContext};
pub use controller::{BargeIn, SpeechController};
pub use events::SpeechEvent;
pub use llm::{ChatAgent, ChatConfig, LlmError};
pub use loopback::{LoopbackConnector, LoopbackSettings};
pub use protocol::{Result, TtsError};
pub use segmenter::{split_text, SentenceSegmenter};
pub use sink::{AudioError, AudioSink, CaptureSink, PulseSink, WavSink};
pub use transport::{Connector, WsConnector};
