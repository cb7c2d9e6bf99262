//! rhospeak - spoken chat in the terminal
//!
//! Each line typed on stdin is sent to a local Ollama model and the reply is
//! spoken as it streams in. Typing a new prompt while the assistant is still
//! talking interrupts it. Without `CARTESIA_API_KEY` (or with
//! `RHOSPEAK_OFFLINE` set) speech comes from the in-process loopback backend.

#![forbid(unsafe_code)]

use rhospeak::llm::{ChatAgent, ChatConfig};
use rhospeak::loopback::LoopbackConnector;
use rhospeak::sink::{AudioSink, PulseSink, WavSink};
use rhospeak::transport::{Connector, WsConnector};
use rhospeak::{SpeechConfig, SpeechController, SpeechEvent};

use anyhow::Context;
use futures_util::StreamExt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Prompt(String),
    Say(String),
    Pause,
    Resume,
    Stop,
    Volume(f32),
    Quit,
    Empty,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        if !line.starts_with('/') {
            return Command::Prompt(line.to_string());
        }

        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        match name {
            "/pause" => Command::Pause,
            "/resume" => Command::Resume,
            "/stop" => Command::Stop,
            "/quit" | "/exit" => Command::Quit,
            "/say" if !rest.is_empty() => Command::Say(rest.to_string()),
            "/volume" => match rest.parse::<f32>() {
                Ok(v) if (0.0..=1.0).contains(&v) => Command::Volume(v),
                _ => Command::Unknown(line.to_string()),
            },
            _ => Command::Unknown(line.to_string()),
        }
    }
}

fn build_speech(config: SpeechConfig) -> anyhow::Result<SpeechController> {
    let offline = config.api_key.is_empty() || std::env::var("RHOSPEAK_OFFLINE").is_ok();
    let connector: Arc<dyn Connector> = if offline {
        info!("No API key, using the loopback speech backend");
        Arc::new(LoopbackConnector::default())
    } else {
        Arc::new(WsConnector::new(config.endpoint()?, config.connect_timeout))
    };

    let format = config.output_format;
    let wav_path = std::env::var("RHOSPEAK_WAV").ok();
    let speech = SpeechController::start(config, connector, move || match wav_path {
        Some(path) => Ok(Box::new(WavSink::create(path, &format)?) as Box<dyn AudioSink>),
        None => Ok(Box::new(PulseSink::new("rhospeak", &format)?) as Box<dyn AudioSink>),
    })?;
    Ok(speech)
}

/// Logs what the pipeline is doing without blocking it.
fn spawn_event_log(speech: &SpeechController) {
    let mut events = speech.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SpeechEvent::Interrupted { from, to, canceled }) => {
                    info!("Interrupted {:?}, speaking on {} (was {})", canceled, to, from);
                }
                Ok(SpeechEvent::ConnectionStale { connection, reason }) => {
                    warn!("Connection {} went stale: {}", connection, reason);
                }
                Ok(SpeechEvent::PoolExhausted { fallback }) => {
                    warn!("No idle connection, reusing {}", fallback);
                }
                Ok(event) => debug!("{:?}", event),
                Err(RecvError::Lagged(n)) => debug!("Event log skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Stops the feeder of the previous reply and waits for it, so the cut-off
/// reply lands in the history before the next prompt does.
async fn settle(feeder: Option<JoinHandle<usize>>) {
    if let Some(feeder) = feeder {
        feeder.abort();
        match feeder.await {
            Ok(fed) => debug!("Previous reply fed {} units", fed),
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!("Reply feeder failed: {}", e),
        }
    }
}

async fn answer(
    speech: &SpeechController,
    agent: &ChatAgent,
    prompt: &str,
    previous: Option<JoinHandle<usize>>,
) -> JoinHandle<usize> {
    settle(previous).await;
    let reply = match agent.ask_stream(prompt).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Chat model unavailable ({}), echoing the prompt", e);
            futures_util::stream::iter(vec![prompt.to_string()]).boxed()
        }
    };
    let reply = reply.inspect(|fragment| {
        print!("{}", fragment);
        let _ = std::io::stdout().flush();
    });

    if speech.is_speaking() {
        let (barge, feeder) = speech.interrupt_and_speak_stream(reply).await;
        debug!("Barge-in moved speech {} -> {}", barge.from, barge.to);
        feeder
    } else {
        speech.speak_stream(reply)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rhospeak=info")),
        )
        .init();

    let config = SpeechConfig::from_env();
    let speech = build_speech(config).context("starting speech pipeline")?;
    spawn_event_log(&speech);

    if !speech.wait_ready(Duration::from_secs(15)).await {
        warn!("Not every connection is ready yet, continuing anyway");
    }

    let mut chat = ChatConfig::default();
    if let Ok(url) = std::env::var("OLLAMA_HOST") {
        chat.url = url;
    }
    if let Ok(model) = std::env::var("RHOSPEAK_LLM_MODEL") {
        chat.model = model;
    }
    let agent = ChatAgent::new(chat);

    println!("🔊 rhospeak ready. Type a prompt and press enter.");
    println!("Commands: /say <text>, /pause, /resume, /stop, /volume <0..1>, /quit");

    let mut feeder = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Command::Prompt(prompt) => {
                feeder = Some(answer(&speech, &agent, &prompt, feeder.take()).await);
            }
            Command::Say(text) => {
                settle(feeder.take()).await;
                if speech.is_speaking() {
                    speech.interrupt_and_speak(&text).await;
                } else {
                    speech.speak(&text);
                }
            }
            Command::Pause => {
                speech.pause();
                println!("⏸ paused");
            }
            Command::Resume => {
                speech.resume();
                println!("▶ resumed");
            }
            Command::Stop => {
                settle(feeder.take()).await;
                speech.stop().await;
            }
            Command::Volume(v) => {
                speech.set_volume(v);
                println!("volume {:.2}", speech.volume());
            }
            Command::Quit => break,
            Command::Empty => {}
            Command::Unknown(cmd) => println!("Unknown command: {}", cmd),
        }
    }

    settle(feeder.take()).await;
    speech.shutdown().await;
    info!("Bye");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("  hello there "), Command::Prompt("hello there".into()));
        assert_eq!(Command::parse(""), Command::Empty);
        assert_eq!(Command::parse("/pause"), Command::Pause);
        assert_eq!(Command::parse("/say  Hi. "), Command::Say("Hi.".into()));
        assert_eq!(Command::parse("/volume 0.5"), Command::Volume(0.5));
        assert_eq!(Command::parse("/quit"), Command::Quit);
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        assert_eq!(Command::parse("/volume 3"), Command::Unknown("/volume 3".into()));
        assert_eq!(Command::parse("/say"), Command::Unknown("/say".into()));
        assert_eq!(Command::parse("/dance"), Command::Unknown("/dance".into()));
    }
}
