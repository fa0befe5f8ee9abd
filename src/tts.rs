//! Text-to-speech adapter.
//!
//! Produces 8 kHz 16-bit mono PCM from a prompt string. Voice selection
//! is a fixed per-language table; the streaming endpoint is tried first
//! and the batch fallback second. A service that returns a WAV container
//! instead of raw PCM gets unwrapped transparently.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::audio;
use crate::config::TtsConfig;
use crate::error::{EngineError, Result};
use crate::language::Language;

/// Text-to-speech capability.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize `text` in `language`, returning telephony-rate PCM.
    async fn synthesize(&self, text: &str, language: Language) -> Result<Vec<u8>>;
}

/// HTTP adapter for the hosted synthesis service.
pub struct HttpTts {
    client: reqwest::Client,
    config: TtsConfig,
}

impl HttpTts {
    pub fn new(config: TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EngineError::TtsFailure(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Voice id for a language; unsupported languages speak with the
    /// English voice (the prompt catalog will already have fallen back
    /// to the English string).
    fn voice_for(&self, language: Language) -> &str {
        self.config
            .voices
            .get(language.tag())
            .or_else(|| self.config.voices.get(Language::English.tag()))
            .map_or("default", String::as_str)
    }

    async fn request(&self, endpoint: &str, text: &str, language: Language) -> Result<Vec<u8>> {
        let body = serde_json::json!({
            "text": text,
            "language": language.tag(),
            "voice": self.voice_for(language),
            "sample_rate": audio::SAMPLE_RATE_HZ,
            "format": "pcm16",
        });
        let mut request = self.client.post(endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::TtsFailure(format!("request: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::TtsFailure(format!(
                "service returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::TtsFailure(format!("response body: {e}")))?;
        let bytes = bytes.to_vec();
        if audio::looks_like_wav(&bytes) {
            return audio::pcm_from_wav(&bytes);
        }
        Ok(bytes)
    }
}

#[async_trait]
impl TextToSpeech for HttpTts {
    async fn synthesize(&self, text: &str, language: Language) -> Result<Vec<u8>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        match self.request(&self.config.endpoint, text, language).await {
            Ok(pcm) => {
                debug!(
                    language = %language,
                    audio_ms = audio::duration_ms(&pcm),
                    "synthesized via streaming endpoint"
                );
                Ok(pcm)
            }
            Err(streaming_err) => {
                warn!(error = %streaming_err, "streaming TTS failed, trying fallback endpoint");
                self.request(&self.config.fallback_endpoint, text, language)
                    .await
                    .map_err(|fallback_err| {
                        EngineError::TtsFailure(format!(
                            "both endpoints failed: {streaming_err}; {fallback_err}"
                        ))
                    })
            }
        }
    }
}
