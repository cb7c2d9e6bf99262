/// Barge-in stress demo
/// Starts a long passage, then keeps interrupting it and reports how quickly
/// each replacement becomes audible.
use rhospeak::loopback::LoopbackConnector;
use rhospeak::sink::{AudioSink, PulseSink, WavSink};
use rhospeak::transport::{Connector, WsConnector};
use rhospeak::{SpeechConfig, SpeechController, SpeechEvent};

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const PASSAGE: &str = "The lighthouse keeper climbed the stairs every evening, one hundred and twelve steps, \
counting each one aloud. At the top he trimmed the wick, polished the lens, and watched the ships \
slide past the rocks. Nobody ever thanked him, and he never expected them to.";

const INTERRUPTIONS: [&str; 5] = [
    "Wait, stop there.",
    "Actually, tell me about the ships instead.",
    "No, never mind that.",
    "Let me ask something else, quickly.",
    "What time is it? Thank you.",
];

/// Waits for the first context to start on `connection`.
async fn wait_started(
    events: &mut broadcast::Receiver<SpeechEvent>,
    connection: usize,
    limit: Duration,
) -> Option<Duration> {
    let start = Instant::now();
    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return None,
            event = events.recv() => match event {
                Ok(SpeechEvent::ContextStarted { connection: c, .. }) if c == connection => {
                    return Some(start.elapsed());
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = SpeechConfig::from_env();
    let offline = config.api_key.is_empty();
    let connector: Arc<dyn Connector> = if offline {
        Arc::new(LoopbackConnector::default())
    } else {
        Arc::new(WsConnector::new(config.endpoint()?, config.connect_timeout))
    };

    let format = config.output_format;
    let wav_path = std::env::var("RHOSPEAK_WAV").ok();
    let speech = SpeechController::start(config, connector, move || match wav_path {
        Some(path) => Ok(Box::new(WavSink::create(path, &format)?) as Box<dyn AudioSink>),
        None => Ok(Box::new(PulseSink::new("speak_demo", &format)?) as Box<dyn AudioSink>),
    })?;

    println!("🗣  Barge-in stress demo");
    println!(
        "Pool of {} connection(s), {} backend, {} frame buffer",
        speech.pool().len(),
        if offline { "loopback" } else { "hosted" },
        speech.config().initial_buffer_frames()
    );
    println!();

    if !speech.wait_ready(Duration::from_secs(15)).await {
        println!("⚠️ Some connections are still connecting");
    }

    let mut events = speech.subscribe();
    speech.speak(PASSAGE);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut latencies = Vec::new();
    for (i, text) in INTERRUPTIONS.iter().enumerate() {
        let barge = speech.interrupt_and_speak(text).await;
        let started = wait_started(&mut events, barge.to, Duration::from_secs(5)).await;
        match started {
            Some(latency) => {
                println!(
                    "#{} {} -> {} in {:?}: {}",
                    i + 1,
                    barge.from,
                    barge.to,
                    latency,
                    text
                );
                latencies.push(latency);
            }
            None => println!("#{} {} -> {} never started", i + 1, barge.from, barge.to),
        }
        tokio::time::sleep(Duration::from_millis(400 + 150 * i as u64)).await;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    if !latencies.is_empty() {
        let total: Duration = latencies.iter().sum();
        println!();
        println!(
            "✅ {} barge-ins, mean switch {:?}, {} frames played, {} dropped",
            latencies.len(),
            total / latencies.len() as u32,
            speech.playback().frames_written(),
            speech.playback().frames_dropped()
        );
    }

    speech.shutdown().await;
    Ok(())
}
