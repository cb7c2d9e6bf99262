//! In-process synthesis backend
//!
//! Speaks the same record protocol as the hosted service over in-memory
//! channels. Audio is paced one record per tick, and a cancel leaves a few
//! records of the context in flight, so slow server-side cancellation can be
//! reproduced without a network.

use crate::protocol::{
    encode_audio, ClientMessage, GenerationRequest, Result, ServerMessage, TtsError,
    WordTimestamps,
};
use crate::transport::{Connector, Transport};

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Produces the PCM for chunk `index` of a transcript.
pub type RenderFn = Arc<dyn Fn(&str, usize) -> Vec<u8> + Send + Sync>;

#[derive(Clone)]
pub struct LoopbackSettings {
    /// Audio records produced per non-empty transcript
    pub chunks_per_unit: usize,
    /// Delay between two outbound records
    pub chunk_interval: Duration,
    /// Records of a canceled context still delivered after the cancel
    pub cancel_lag: usize,
    /// Simulated handshake time
    pub connect_delay: Duration,
    pub render: RenderFn,
    /// Transcripts containing this text get a backend `error` record
    pub fail_on: Option<String>,
    /// Transcripts containing this text get an audio record that is not base64
    pub corrupt_on: Option<String>,
    /// Close the socket after this many records
    pub drop_after: Option<usize>,
}

impl Default for LoopbackSettings {
    fn default() -> Self {
        Self {
            chunks_per_unit: 4,
            chunk_interval: Duration::from_millis(20),
            cancel_lag: 2,
            connect_delay: Duration::from_millis(30),
            render: Arc::new(sine_tone),
            fail_on: None,
            corrupt_on: None,
            drop_after: None,
        }
    }
}

impl fmt::Debug for LoopbackSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackSettings")
            .field("chunks_per_unit", &self.chunks_per_unit)
            .field("chunk_interval", &self.chunk_interval)
            .field("cancel_lag", &self.cancel_lag)
            .field("connect_delay", &self.connect_delay)
            .field("fail_on", &self.fail_on)
            .field("corrupt_on", &self.corrupt_on)
            .field("drop_after", &self.drop_after)
            .finish()
    }
}

/// 20 ms of a soft f32le tone at 22.05 kHz, pitched by transcript length.
pub fn sine_tone(transcript: &str, index: usize) -> Vec<u8> {
    const RATE: f32 = 22_050.0;
    const SAMPLES: usize = 441;
    let freq = 180.0 + (transcript.len() % 40) as f32 * 8.0;
    let offset = index * SAMPLES;
    (0..SAMPLES)
        .flat_map(|i| {
            let t = (offset + i) as f32 / RATE;
            (0.2 * (2.0 * std::f32::consts::PI * freq * t).sin()).to_le_bytes()
        })
        .collect()
}

/// Connector handing out loopback transports.
#[derive(Debug, Clone, Default)]
pub struct LoopbackConnector {
    settings: LoopbackSettings,
    connects: Arc<AtomicUsize>,
}

impl LoopbackConnector {
    pub fn new(settings: LoopbackSettings) -> Self {
        Self {
            settings,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Completed handshakes across all clones.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Transport> {
        if !self.settings.connect_delay.is_zero() {
            tokio::time::sleep(self.settings.connect_delay).await;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let server = LoopbackServer::new(self.settings.clone(), in_tx);
        let handle = tokio::spawn(server.run(out_rx));
        Ok(Transport::new(out_tx, in_rx, Some(handle)))
    }
}

struct LoopbackServer {
    settings: LoopbackSettings,
    tx: UnboundedSender<Result<ServerMessage>>,
    backlog: VecDeque<ServerMessage>,
    canceled: HashSet<String>,
    sent: usize,
}

impl LoopbackServer {
    fn new(settings: LoopbackSettings, tx: UnboundedSender<Result<ServerMessage>>) -> Self {
        Self {
            settings,
            tx,
            backlog: VecDeque::new(),
            canceled: HashSet::new(),
            sent: 0,
        }
    }

    async fn run(mut self, mut rx: UnboundedReceiver<ClientMessage>) {
        let interval = self.settings.chunk_interval.max(Duration::from_millis(1));
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(ClientMessage::Generate(req)) => self.generate(req),
                    Some(ClientMessage::Cancel(req)) => self.cancel(&req.context_id),
                    None => {
                        debug!("Loopback client went away");
                        return;
                    }
                },
                _ = tokio::time::sleep(interval), if !self.backlog.is_empty() => {
                    if let Some(msg) = self.backlog.pop_front() {
                        if self.tx.send(Ok(msg)).is_err() {
                            return;
                        }
                        self.sent += 1;
                        if self.settings.drop_after.is_some_and(|n| self.sent >= n) {
                            debug!("Loopback dropping connection after {} records", self.sent);
                            let _ = self.tx.send(Err(TtsError::ConnectionClosed));
                            return;
                        }
                    }
                }
            }
        }
    }

    fn generate(&mut self, req: GenerationRequest) {
        let id = req.context_id;
        if self.canceled.contains(&id) {
            return;
        }

        let failing = self
            .settings
            .fail_on
            .as_deref()
            .is_some_and(|needle| req.transcript.contains(needle));
        if failing {
            self.backlog.push_back(ServerMessage::Error {
                context_id: Some(id.clone()),
                error: format!("cannot synthesize {:?}", req.transcript),
            });
            self.canceled.insert(id);
            return;
        }

        let corrupt = self
            .settings
            .corrupt_on
            .as_deref()
            .is_some_and(|needle| req.transcript.contains(needle));
        if corrupt {
            self.backlog.push_back(ServerMessage::Chunk {
                context_id: id.clone(),
                data: "%%garbled%%".to_string(),
                done: false,
            });
            self.canceled.insert(id);
            return;
        }

        if !req.transcript.trim().is_empty() {
            for index in 0..self.settings.chunks_per_unit {
                let pcm = (self.settings.render)(&req.transcript, index);
                self.backlog.push_back(ServerMessage::Chunk {
                    context_id: id.clone(),
                    data: encode_audio(&pcm),
                    done: false,
                });
            }
            if req.add_timestamps {
                self.backlog.push_back(ServerMessage::Timestamps {
                    context_id: id.clone(),
                    word_timestamps: fake_timestamps(&req.transcript),
                });
            }
        }

        if !req.continue_ {
            self.backlog.push_back(ServerMessage::Done { context_id: id });
        }
    }

    /// Keeps the first `cancel_lag` records of the context, drops the rest.
    fn cancel(&mut self, context_id: &str) {
        self.canceled.insert(context_id.to_string());
        let mut lag = self.settings.cancel_lag;
        self.backlog.retain(|msg| {
            if msg.context_id() != Some(context_id) {
                return true;
            }
            if lag > 0 && matches!(msg, ServerMessage::Chunk { .. }) {
                lag -= 1;
                return true;
            }
            false
        });
    }
}

fn fake_timestamps(transcript: &str) -> WordTimestamps {
    let words: Vec<String> = transcript.split_whitespace().map(String::from).collect();
    let start = (0..words.len()).map(|i| i as f64 * 0.3).collect();
    let end = (0..words.len()).map(|i| i as f64 * 0.3 + 0.25).collect();
    WordTimestamps { words, start, end }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_audio, OutputFormat, Voice};

    fn settings() -> LoopbackSettings {
        LoopbackSettings {
            chunks_per_unit: 3,
            chunk_interval: Duration::from_millis(2),
            cancel_lag: 1,
            connect_delay: Duration::ZERO,
            render: Arc::new(|t: &str, i: usize| format!("{}#{}", t, i).into_bytes()),
            fail_on: Some("boom".to_string()),
            corrupt_on: Some("noise".to_string()),
            drop_after: None,
        }
    }

    fn request(id: &str, transcript: &str, more: bool) -> ClientMessage {
        ClientMessage::Generate(GenerationRequest {
            model_id: "sonic".to_string(),
            transcript: transcript.to_string(),
            voice: Voice::Id { id: "v".to_string() },
            language: None,
            output_format: OutputFormat::default(),
            context_id: id.to_string(),
            continue_: more,
            add_timestamps: false,
        })
    }

    async fn next(transport: &mut Transport) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), transport.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_chunks_then_done() {
        let connector = LoopbackConnector::new(settings());
        let mut transport = connector.connect().await.unwrap();
        assert_eq!(connector.connect_count(), 1);

        transport.send(request("a", "Hi.", true)).unwrap();
        transport.send(request("a", "", false)).unwrap();

        for i in 0..3 {
            match next(&mut transport).await {
                ServerMessage::Chunk { context_id, data, .. } => {
                    assert_eq!(context_id, "a");
                    assert_eq!(decode_audio(&data).unwrap(), format!("Hi.#{}", i).into_bytes());
                }
                other => panic!("Unexpected message: {:?}", other),
            }
        }
        assert!(matches!(next(&mut transport).await, ServerMessage::Done { .. }));
    }

    #[tokio::test]
    async fn test_cancel_leaves_lagging_chunk() {
        let connector = LoopbackConnector::new(settings());
        let mut transport = connector.connect().await.unwrap();

        transport.send(request("a", "One.", false)).unwrap();
        transport.send(ClientMessage::cancel("a")).unwrap();
        transport.send(request("b", "Two.", false)).unwrap();

        match next(&mut transport).await {
            ServerMessage::Chunk { context_id, .. } => assert_eq!(context_id, "a"),
            other => panic!("Unexpected message: {:?}", other),
        }
        for _ in 0..3 {
            assert_eq!(next(&mut transport).await.context_id(), Some("b"));
        }
        assert!(matches!(next(&mut transport).await, ServerMessage::Done { context_id } if context_id == "b"));
    }

    #[tokio::test]
    async fn test_corrupt_chunk_is_not_base64() {
        let connector = LoopbackConnector::new(settings());
        let mut transport = connector.connect().await.unwrap();

        transport.send(request("a", "noise.", true)).unwrap();
        transport.send(request("a", "More.", false)).unwrap();
        match next(&mut transport).await {
            ServerMessage::Chunk { context_id, data, .. } => {
                assert_eq!(context_id, "a");
                assert!(decode_audio(&data).is_err());
            }
            other => panic!("Unexpected message: {:?}", other),
        }

        transport.send(request("b", "Fine.", false)).unwrap();
        assert_eq!(next(&mut transport).await.context_id(), Some("b"));
    }

    #[tokio::test]
    async fn test_backend_error_and_drop() {
        let mut s = settings();
        s.drop_after = Some(2);
        let connector = LoopbackConnector::new(s);
        let mut transport = connector.connect().await.unwrap();

        transport.send(request("a", "boom.", false)).unwrap();
        assert!(matches!(next(&mut transport).await, ServerMessage::Error { .. }));

        transport.send(request("b", "fine.", false)).unwrap();
        assert!(matches!(next(&mut transport).await, ServerMessage::Chunk { .. }));
        let err = tokio::time::timeout(Duration::from_secs(1), transport.recv())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_transport());
    }
}
