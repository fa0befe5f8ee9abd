//! Speech-to-text adapter.
//!
//! Utterances go out as WAV uploads to the transcription service; the
//! result is a transcript plus an optional detected language tag. The
//! adapter is deliberately forgiving: short audio is skipped without a
//! network call, rate-limit denials and exhausted retries all collapse
//! to an empty transcript so the dialog's re-prompt path handles them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::audio;
use crate::buffer::Utterance;
use crate::config::AsrConfig;
use crate::error::{EngineError, Result};
use crate::language::Language;
use crate::rate_limit::SlidingWindowLimiter;

/// Transcription result. An empty transcript means "heard nothing
/// usable", whether from silence, short audio, a rate-limit denial or
/// an upstream failure.
#[derive(Debug, Clone, Default)]
pub struct AsrOutcome {
    pub transcript: String,
    /// Language code reported by the service, when it reports one and
    /// the engine recognizes it.
    pub language: Option<Language>,
}

impl AsrOutcome {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transcript.trim().is_empty()
    }
}

/// Speech-to-text capability.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, utterance: &Utterance, hint: Option<Language>)
    -> Result<AsrOutcome>;
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    language: Option<String>,
}

/// HTTP adapter for the hosted transcription service.
pub struct HttpAsr {
    client: reqwest::Client,
    config: AsrConfig,
    limiter: Arc<Mutex<SlidingWindowLimiter>>,
}

impl HttpAsr {
    pub fn new(config: AsrConfig, limiter: Arc<Mutex<SlidingWindowLimiter>>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EngineError::AsrTransient(format!("http client: {e}")))?;
        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    async fn attempt(&self, wav: Vec<u8>, hint: Option<Language>) -> Result<TranscribeResponse> {
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| EngineError::AsrTransient(format!("multipart: {e}")))?;
        let mut form = reqwest::multipart::Form::new().part("audio", part);
        if let Some(hint) = hint {
            form = form.text("language_hint", hint.tag());
        }

        let mut request = self.client.post(&self.config.endpoint).multipart(form);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::AsrTransient(format!("request: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::AsrTransient(format!(
                "service returned {}",
                response.status()
            )));
        }
        response
            .json::<TranscribeResponse>()
            .await
            .map_err(|e| EngineError::AsrTransient(format!("response body: {e}")))
    }
}

#[async_trait]
impl SpeechToText for HttpAsr {
    async fn transcribe(
        &self,
        utterance: &Utterance,
        hint: Option<Language>,
    ) -> Result<AsrOutcome> {
        if utterance.duration_ms < self.config.min_audio_ms
            || utterance.pcm.len() < self.config.min_audio_bytes
        {
            debug!(
                duration_ms = utterance.duration_ms,
                bytes = utterance.pcm.len(),
                "utterance below ASR minimum, skipping"
            );
            return Ok(AsrOutcome::default());
        }

        // Non-blocking: a denied slot is an empty transcript, not a wait.
        let denied = {
            let mut limiter = self
                .limiter
                .lock()
                .map_err(|_| EngineError::AsrTransient("limiter poisoned".to_owned()))?;
            limiter.try_acquire().err()
        };
        if let Some(denied) = denied {
            warn!(%denied, "ASR rate limit denied, dropping utterance");
            return Ok(AsrOutcome::default());
        }

        let wav = audio::to_wav(&utterance.pcm)?;
        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.attempt(wav.clone(), hint).await {
                Ok(response) => {
                    let language = response.language.as_deref().and_then(Language::from_tag);
                    return Ok(AsrOutcome {
                        transcript: response.transcript,
                        language,
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "ASR attempt failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                    }
                }
            }
        }

        // Permanent failure degrades to an empty transcript; the dialog
        // re-prompts instead of erroring the call.
        if let Some(e) = last_error {
            warn!(error = %e, "ASR attempts exhausted, treating as empty transcript");
        }
        Ok(AsrOutcome::default())
    }
}
