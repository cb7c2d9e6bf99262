//! Streaming TTS wire protocol
//!
//! Client records are JSON objects sent as websocket text frames. Server
//! records are tagged by their `type` field and always name the context
//! they belong to, which is how several utterances share one socket.

use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Error as WsError;

/// Audio container requested from the backend.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Raw,
}

/// Sample encoding of the raw PCM stream.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    #[serde(rename = "pcm_f32le")]
    PcmF32le,
    #[serde(rename = "pcm_s16le")]
    PcmS16le,
}

impl Encoding {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::PcmF32le => 4,
            Self::PcmS16le => 2,
        }
    }
}

/// Output audio format descriptor sent with every generation request.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub container: Container,
    pub encoding: Encoding,
    pub sample_rate: u32,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            container: Container::Raw,
            encoding: Encoding::PcmF32le,
            sample_rate: 22_050,
        }
    }
}

/// Voice selector.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Voice {
    Id { id: String },
}

/// One transcript piece for a context.
///
/// `continue_` tells the backend more text will follow on the same context,
/// so prosody carries across speakable units.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model_id: String,
    pub transcript: String,
    pub voice: Voice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub output_format: OutputFormat,
    pub context_id: String,
    #[serde(rename = "continue")]
    pub continue_: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub add_timestamps: bool,
}

/// Server-side abort of a context.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub context_id: String,
    pub cancel: bool,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ClientMessage {
    Generate(GenerationRequest),
    Cancel(CancelRequest),
}

impl ClientMessage {
    pub fn cancel(context_id: &str) -> Self {
        Self::Cancel(CancelRequest {
            context_id: context_id.to_string(),
            cancel: true,
        })
    }

    pub fn context_id(&self) -> &str {
        match self {
            Self::Generate(req) => &req.context_id,
            Self::Cancel(req) => &req.context_id,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(TtsError::Serialization)
    }
}

/// Word alignment for a stretch of generated audio, in seconds.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct WordTimestamps {
    #[serde(default)]
    pub words: Vec<String>,
    #[serde(default)]
    pub start: Vec<f64>,
    #[serde(default)]
    pub end: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

impl WordTimestamps {
    /// Zips the parallel arrays, stopping at the shortest one.
    pub fn timings(&self) -> Vec<WordTiming> {
        self.words
            .iter()
            .zip(self.start.iter().zip(self.end.iter()))
            .map(|(word, (start, end))| WordTiming {
                word: word.clone(),
                start: *start,
                end: *end,
            })
            .collect()
    }
}

/// Server -> client messages
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Chunk {
        context_id: String,
        data: String,
        #[serde(default)]
        done: bool,
    },
    Timestamps {
        context_id: String,
        word_timestamps: WordTimestamps,
    },
    Done {
        context_id: String,
    },
    Error {
        #[serde(default)]
        context_id: Option<String>,
        error: String,
    },
}

impl ServerMessage {
    pub fn context_id(&self) -> Option<&str> {
        match self {
            Self::Chunk { context_id, .. }
            | Self::Timestamps { context_id, .. }
            | Self::Done { context_id } => Some(context_id),
            Self::Error { context_id, .. } => context_id.as_deref(),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(TtsError::Serialization)
    }
}

/// Decodes the base64 payload of a `chunk` record into PCM bytes.
pub fn decode_audio(data: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(data)
        .map_err(TtsError::Base64)
}

pub fn encode_audio(pcm: &[u8]) -> String {
    general_purpose::STANDARD.encode(pcm)
}

/// Error type for synthesis backend operations
#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Backend error for context {context_id:?}: {message}")]
    Backend {
        context_id: Option<String>,
        message: String,
    },

    #[error("Context {0} is already registered")]
    DuplicateContext(String),

    #[error("Audio output error: {0}")]
    Audio(#[from] crate::sink::AudioError),

    #[error("Other error: {0}")]
    Other(String),
}

impl TtsError {
    /// Transport failures invalidate the whole connection; everything else
    /// is scoped to a single context.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_) | Self::ConnectionClosed | Self::ChannelClosed | Self::Timeout
        )
    }
}

pub type Result<T> = std::result::Result<T, TtsError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn request(more: bool) -> GenerationRequest {
        GenerationRequest {
            model_id: "sonic".to_string(),
            transcript: "Hello there.".to_string(),
            voice: Voice::Id { id: "voice-1".to_string() },
            language: None,
            output_format: OutputFormat::default(),
            context_id: "ctx-1".to_string(),
            continue_: more,
            add_timestamps: false,
        }
    }

    #[test]
    fn test_generation_request_serialization() {
        let msg = ClientMessage::Generate(request(true));
        let parsed: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(parsed["model_id"], "sonic");
        assert_eq!(parsed["transcript"], "Hello there.");
        assert_eq!(parsed["voice"]["mode"], "id");
        assert_eq!(parsed["voice"]["id"], "voice-1");
        assert_eq!(parsed["output_format"]["container"], "raw");
        assert_eq!(parsed["output_format"]["encoding"], "pcm_f32le");
        assert_eq!(parsed["output_format"]["sample_rate"], 22050);
        assert_eq!(parsed["context_id"], "ctx-1");
        assert_eq!(parsed["continue"], true);
        assert!(parsed.get("language").is_none());
        assert!(parsed.get("add_timestamps").is_none());
    }

    #[test]
    fn test_cancel_serialization() {
        let msg = ClientMessage::cancel("ctx-9");
        let parsed: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, serde_json::json!({"context_id": "ctx-9", "cancel": true}));
        assert_eq!(msg.context_id(), "ctx-9");
    }

    #[test]
    fn test_server_message_variants() {
        let chunk = ServerMessage::parse(
            r#"{"type":"chunk","data":"AQID","done":false,"status_code":206,"context_id":"a"}"#,
        )
        .unwrap();
        match &chunk {
            ServerMessage::Chunk { context_id, data, done } => {
                assert_eq!(context_id, "a");
                assert_eq!(decode_audio(data).unwrap(), vec![1, 2, 3]);
                assert!(!done);
            }
            other => panic!("Unexpected message: {:?}", other),
        }

        let done = ServerMessage::parse(r#"{"type":"done","context_id":"a"}"#).unwrap();
        assert_eq!(done.context_id(), Some("a"));

        let err = ServerMessage::parse(r#"{"type":"error","error":"bad voice"}"#).unwrap();
        assert_eq!(err.context_id(), None);

        let ts = ServerMessage::parse(
            r#"{"type":"timestamps","context_id":"b","word_timestamps":{"words":["hi","you"],"start":[0.0,0.4],"end":[0.3,0.7]}}"#,
        )
        .unwrap();
        match ts {
            ServerMessage::Timestamps { word_timestamps, .. } => {
                let timings = word_timestamps.timings();
                assert_eq!(timings.len(), 2);
                assert_eq!(timings[1].word, "you");
                assert_eq!(timings[1].start, 0.4);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_messages_are_protocol_errors() {
        let err = ServerMessage::parse(r#"{"type":"mystery"}"#).unwrap_err();
        assert!(!err.is_transport());

        let err = decode_audio("not base64!").unwrap_err();
        assert!(matches!(err, TtsError::Base64(_)));
        assert!(!err.is_transport());

        assert!(TtsError::ConnectionClosed.is_transport());
    }
}
