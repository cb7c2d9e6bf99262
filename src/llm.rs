//! Conversational text source backed by a local Ollama server
//!
//! Replies stream as newline-delimited JSON from `/api/chat`. The agent keeps
//! the conversation history; a reply is added to it once its stream ends,
//! or when the stream is dropped early, in which case it is marked as
//! interrupted.

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

const INTERRUPTED_MARKER: &str = " (Interrupted)";

/// Error type for the upstream chat model
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Chat server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode chat response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub url: String,
    pub model: String,
    pub system_prompt: Option<String>,
    /// Upper bound on generated tokens per reply
    pub max_tokens: u32,
    /// How long the server keeps the model loaded; negative keeps it forever
    pub keep_alive: i64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
            system_prompt: Some(
                "You are a helpful voice assistant. Answer conversationally in a few short sentences."
                    .to_string(),
            ),
            max_tokens: 1000,
            keep_alive: -1,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
    keep_alive: i64,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// One decoded NDJSON line.
#[derive(Debug, PartialEq, Eq)]
enum ChunkEvent {
    Text(String),
    Done(String),
    Failed(String),
}

fn parse_line(line: &str) -> Result<ChunkEvent, LlmError> {
    let chunk: ChatChunk = serde_json::from_str(line)?;
    if let Some(error) = chunk.error {
        return Ok(ChunkEvent::Failed(error));
    }
    let text = chunk.message.map(|m| m.content).unwrap_or_default();
    Ok(if chunk.done {
        ChunkEvent::Done(text)
    } else {
        ChunkEvent::Text(text)
    })
}

/// Removes every complete line from `buf`, leaving a trailing partial line.
fn drain_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line).trim().to_string();
        if !text.is_empty() {
            lines.push(text);
        }
    }
    lines
}

type History = Arc<Mutex<Vec<ChatMessage>>>;

/// Accumulates a reply and appends it to the history when dropped.
struct ReplyRecorder {
    history: History,
    text: String,
    finished: bool,
}

impl Drop for ReplyRecorder {
    fn drop(&mut self) {
        let mut content = std::mem::take(&mut self.text);
        if !self.finished {
            content.push_str(INTERRUPTED_MARKER);
        }
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ChatMessage::new(Role::Assistant, content));
    }
}

struct ReplyState<B> {
    body: B,
    buf: Vec<u8>,
    lines: std::collections::VecDeque<String>,
    recorder: ReplyRecorder,
    ended: bool,
}

/// Turns a raw NDJSON body into a stream of text fragments.
fn reply_stream<B, T, E>(body: B, recorder: ReplyRecorder) -> impl Stream<Item = String>
where
    B: Stream<Item = Result<T, E>> + Unpin,
    T: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let state = ReplyState {
        body,
        buf: Vec::new(),
        lines: Default::default(),
        recorder,
        ended: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            while let Some(line) = st.lines.pop_front() {
                match parse_line(&line) {
                    Ok(ChunkEvent::Text(text)) => {
                        if text.is_empty() {
                            continue;
                        }
                        st.recorder.text.push_str(&text);
                        return Some((text, st));
                    }
                    Ok(ChunkEvent::Done(text)) => {
                        st.recorder.finished = true;
                        st.ended = true;
                        st.lines.clear();
                        if text.is_empty() {
                            return None;
                        }
                        st.recorder.text.push_str(&text);
                        return Some((text, st));
                    }
                    Ok(ChunkEvent::Failed(error)) => {
                        warn!("Chat server error: {}", error);
                        return None;
                    }
                    Err(e) => {
                        warn!("Skipping undecodable chat line: {}", e);
                    }
                }
            }

            if st.ended {
                return None;
            }

            match st.body.next().await {
                Some(Ok(bytes)) => {
                    st.buf.extend_from_slice(bytes.as_ref());
                    st.lines.extend(drain_lines(&mut st.buf));
                }
                Some(Err(e)) => {
                    warn!("Chat stream failed: {}", e);
                    return None;
                }
                None => {
                    st.ended = true;
                    st.buf.push(b'\n');
                    st.lines.extend(drain_lines(&mut st.buf));
                    if st.lines.is_empty() {
                        return None;
                    }
                }
            }
        }
    })
}

/// Chat agent with conversation memory.
#[derive(Clone)]
pub struct ChatAgent {
    client: reqwest::Client,
    config: ChatConfig,
    history: History,
}

impl ChatAgent {
    pub fn new(config: ChatConfig) -> Self {
        let mut history = Vec::new();
        if let Some(prompt) = &config.system_prompt {
            history.push(ChatMessage::new(Role::System, prompt.clone()));
        }
        Self {
            client: reqwest::Client::new(),
            config,
            history: Arc::new(Mutex::new(history)),
        }
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_to_history(&self, role: Role, content: impl Into<String>) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ChatMessage::new(role, content));
    }

    /// Forgets the conversation, optionally keeping a leading system prompt.
    pub fn clear_history(&self, keep_system: bool) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let system = history
            .first()
            .filter(|m| keep_system && m.role == Role::System)
            .cloned();
        history.clear();
        history.extend(system);
    }

    /// Sends `prompt` and streams the reply as text fragments.
    pub async fn ask_stream(&self, prompt: &str) -> Result<BoxStream<'static, String>, LlmError> {
        self.add_to_history(Role::User, prompt);
        let messages = self.history();

        let body = ChatRequest {
            model: &self.config.model,
            messages: &messages,
            stream: true,
            options: ChatOptions {
                num_predict: self.config.max_tokens,
            },
            keep_alive: self.config.keep_alive,
        };

        let url = format!("{}/api/chat", self.config.url.trim_end_matches('/'));
        debug!("POST {} with {} messages", url, messages.len());
        let resp = self.client.post(&url).json(&body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        info!("Streaming reply from {}", self.config.model);
        Ok(self.reply(resp.bytes_stream().boxed()))
    }

    /// Streams the fragments of a raw `/api/chat` body and records the reply
    /// in the history once the stream ends or is dropped.
    pub(crate) fn reply<B, T, E>(&self, body: B) -> BoxStream<'static, String>
    where
        B: Stream<Item = Result<T, E>> + Unpin + Send + 'static,
        T: AsRef<[u8]> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let recorder = ReplyRecorder {
            history: self.history.clone(),
            text: String::new(),
            finished: false,
        };
        reply_stream(body, recorder).boxed()
    }
}
