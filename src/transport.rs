//! Duplex message transport to a synthesis backend
//!
//! A `Transport` is one open socket seen as a pair of channels. The websocket
//! is split into a sink and a stream, each owned by its own task, so sends
//! never wait behind a slow reader and vice versa.

use crate::protocol::{ClientMessage, Result, ServerMessage, TtsError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// One open duplex connection.
///
/// Dropping the transport closes the outbound channel (which makes the
/// writer close the socket) and stops the reader.
pub struct Transport {
    outbound: UnboundedSender<ClientMessage>,
    inbound: UnboundedReceiver<Result<ServerMessage>>,
    reader: Option<JoinHandle<()>>,
}

impl Transport {
    pub fn new(
        outbound: UnboundedSender<ClientMessage>,
        inbound: UnboundedReceiver<Result<ServerMessage>>,
        reader: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            reader,
        }
    }

    /// Queue a message for the writer; fails only when the socket is gone.
    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .map_err(|_| TtsError::ChannelClosed)
    }

    /// Next server message. A closed channel is reported as a closed
    /// connection so callers see one terminal error.
    pub async fn recv(&mut self) -> Result<ServerMessage> {
        match self.inbound.recv().await {
            Some(msg) => msg,
            None => Err(TtsError::ConnectionClosed),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Opens transports to a backend.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Transport>;
}

/// Websocket connector for the hosted streaming backend.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Transport> {
        info!("Connecting to synthesis backend at {}", redact(&self.url));

        let (ws_stream, resp) = tokio::time::timeout(self.timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                error!("Timeout while opening websocket");
                TtsError::Timeout
            })?
            .map_err(TtsError::WebSocket)?;

        debug!("WebSocket connection response status: {}", resp.status());

        let (mut sink, mut stream) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Result<ServerMessage>>();

        // Writer: serializes everything queued on the outbound channel
        let writer_err_tx = in_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                debug!("Sending {} bytes for context {}", json.len(), msg.context_id());

                if let Err(e) = sink.send(Message::text(json)).await {
                    error!("Failed to send message: {:?}", e);
                    let _ = writer_err_tx.send(Err(TtsError::WebSocket(e)));
                    return;
                }
            }
            debug!("Outbound channel closed, closing websocket");
            let _ = sink.close().await;
        });

        // Reader: parses server records and forwards them in arrival order
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("Ignoring non-UTF8 binary frame ({} bytes)", bytes.len());
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        info!("WebSocket closed: {:?}", frame);
                        let _ = in_tx.send(Err(TtsError::ConnectionClosed));
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("WebSocket error: {:?}", e);
                        let _ = in_tx.send(Err(TtsError::WebSocket(e)));
                        return;
                    }
                };

                let parsed = ServerMessage::parse(&text);
                if let Err(e) = &parsed {
                    warn!("Failed to parse server message: {}", e);
                    debug!("Raw message: {}", text);
                }
                if in_tx.send(parsed).is_err() {
                    return;
                }
            }
            let _ = in_tx.send(Err(TtsError::ConnectionClosed));
        });

        info!("Connected to synthesis backend");
        Ok(Transport::new(out_tx, in_rx, Some(reader)))
    }
}

/// Strips query parameters (which carry the API key) before logging.
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
