//! Speech pipeline configuration

use crate::protocol::{Encoding, GenerationRequest, OutputFormat, Result, TtsError, Voice};

use reqwest::Url;

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_URL: &str = "wss://api.cartesia.ai/tts/websocket";
pub const DEFAULT_API_VERSION: &str = "2024-06-10";
pub const DEFAULT_VOICE: &str = "043cfc81-d69f-4bee-ae1e-7862cb358650";

#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub url: String,
    pub api_key: String,
    pub api_version: String,
    pub model_id: String,
    pub voice_id: String,
    pub language: Option<String>,
    pub add_timestamps: bool,
    pub output_format: OutputFormat,
    /// Number of pooled connections (at least one)
    pub pool_size: usize,
    /// Frames withheld at the start of each context
    pub initial_buffer_frames: usize,
    /// Length of the fade-in ramp; zero disables fading
    pub fade: Duration,
    pub ready_poll_interval: Duration,
    pub ready_poll_attempts: usize,
    pub housekeeping_interval: Duration,
    /// Idle time after which a background connection is reopened
    pub idle_refresh_after: Duration,
    pub connect_timeout: Duration,
    pub playback_poll: Duration,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            api_key: String::new(),
            api_version: DEFAULT_API_VERSION.to_string(),
            model_id: "sonic".to_string(),
            voice_id: DEFAULT_VOICE.to_string(),
            language: None,
            add_timestamps: false,
            output_format: OutputFormat::default(),
            pool_size: 2,
            initial_buffer_frames: 3,
            fade: Duration::from_millis(30),
            ready_poll_interval: Duration::from_millis(50),
            ready_poll_attempts: 6,
            housekeeping_interval: Duration::from_secs(1),
            idle_refresh_after: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(10),
            playback_poll: Duration::from_millis(20),
        }
    }
}

impl SpeechConfig {
    pub fn from_api_key(api_key: &str, config: Option<SpeechConfig>) -> Self {
        let mut config = config.unwrap_or_default();
        config.api_key = api_key.to_string();
        config
    }

    /// Defaults overridden by `CARTESIA_API_KEY` and `RHOSPEAK_*` variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(key) = std::env::var("CARTESIA_API_KEY") {
            config.api_key = key;
        }
        if let Ok(url) = std::env::var("RHOSPEAK_URL") {
            config.url = url;
        }
        if let Ok(voice) = std::env::var("RHOSPEAK_VOICE") {
            config.voice_id = voice;
        }
        if let Ok(model) = std::env::var("RHOSPEAK_MODEL") {
            config.model_id = model;
        }
        if let Some(n) = env_parse("RHOSPEAK_POOL_SIZE") {
            config.pool_size = n;
        }
        if let Some(rate) = env_parse("RHOSPEAK_SAMPLE_RATE") {
            config.output_format.sample_rate = rate;
        }
        if let Some(frames) = env_parse("RHOSPEAK_INITIAL_FRAMES") {
            config.initial_buffer_frames = frames;
        }
        if let Some(ms) = env_parse("RHOSPEAK_FADE_MS") {
            config.fade = Duration::from_millis(ms);
        }
        config
    }

    /// Full websocket URL including credentials.
    /// Websocket URL with the key and API version in the query string.
    pub fn endpoint(&self) -> Result<String> {
        let params = [
            ("api_key", self.api_key.as_str()),
            ("cartesia_version", self.api_version.as_str()),
        ];
        let url = Url::parse_with_params(&self.url, &params)
            .map_err(|e| TtsError::Other(format!("invalid endpoint {:?}: {}", self.url, e)))?;
        Ok(url.into())
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size.max(1)
    }

    pub fn initial_buffer_frames(&self) -> usize {
        self.initial_buffer_frames.clamp(1, 16)
    }

    /// Ramp length in samples at the output rate.
    pub fn fade_samples(&self) -> usize {
        (self.fade.as_micros() * self.output_format.sample_rate as u128 / 1_000_000) as usize
    }

    pub fn encoding(&self) -> Encoding {
        self.output_format.encoding
    }

    /// Builds one transcript record; `more` marks that the context continues.
    pub fn request(&self, context_id: &str, transcript: &str, more: bool) -> GenerationRequest {
        GenerationRequest {
            model_id: self.model_id.clone(),
            transcript: transcript.to_string(),
            voice: Voice::Id {
                id: self.voice_id.clone(),
            },
            language: self.language.clone(),
            output_format: self.output_format,
            context_id: context_id.to_string(),
            continue_: more,
            add_timestamps: self.add_timestamps,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_clamps() {
        let mut config = SpeechConfig::from_api_key("k", None);
        assert_eq!(config.api_key, "k");
        assert_eq!(config.pool_size(), 2);
        assert_eq!(config.initial_buffer_frames(), 3);
        assert_eq!(config.fade_samples(), 661);

        config.pool_size = 0;
        config.initial_buffer_frames = 100;
        config.fade = Duration::ZERO;
        assert_eq!(config.pool_size(), 1);
        assert_eq!(config.initial_buffer_frames(), 16);
        assert_eq!(config.fade_samples(), 0);
    }

    #[test]
    fn test_endpoint_and_request() {
        let config = SpeechConfig::from_api_key("secret", None);
        assert_eq!(
            config.endpoint().unwrap(),
            "wss://api.cartesia.ai/tts/websocket?api_key=secret&cartesia_version=2024-06-10"
        );

        let req = config.request("ctx", "Hello.", true);
        assert_eq!(req.context_id, "ctx");
        assert_eq!(req.model_id, "sonic");
        assert!(req.continue_);
        assert_eq!(req.output_format.sample_rate, 22_050);
    }

    #[test]
    fn test_endpoint_encodes_key() {
        let mut config = SpeechConfig::from_api_key("a&b=c d/+", None);
        assert_eq!(
            config.endpoint().unwrap(),
            "wss://api.cartesia.ai/tts/websocket?api_key=a%26b%3Dc+d%2F%2B&cartesia_version=2024-06-10"
        );

        config.url = "not a url".to_string();
        assert!(config.endpoint().is_err());
    }
}
