//! Configuration types for the call engine.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Listener and logging settings.
    pub server: ServerConfig,
    /// State → language table for the opening greeting.
    pub language: LanguageConfig,
    /// Speech-to-text adapter settings.
    pub asr: AsrConfig,
    /// Text-to-speech adapter settings.
    pub tts: TtsConfig,
    /// Intent LLM settings.
    pub intent: IntentConfig,
    /// Utterance buffer thresholds.
    pub buffer: BufferConfig,
    /// Reply wait windows.
    pub wait: WaitConfig,
    /// Re-prompt bounds.
    pub repeat: RepeatConfig,
    /// Per-call limits.
    pub call: CallConfig,
    /// Agent transfer settings.
    pub transfer: TransferConfig,
    /// Process-wide adapter rate limits.
    pub rate: RateConfig,
    /// Session store and customer directory endpoints.
    pub store: StoreConfig,
    /// Call record sink settings.
    pub records: RecordsConfig,
}

impl EngineConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("failed to read config {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| {
            EngineError::Config(format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation: bad endpoints and a malformed agent number
    /// should fail the process, not the first live call.
    pub fn validate(&self) -> Result<()> {
        validate_e164(&self.transfer.agent_number)?;
        for (label, endpoint) in [
            ("asr.endpoint", &self.asr.endpoint),
            ("tts.endpoint", &self.tts.endpoint),
            ("tts.fallback_endpoint", &self.tts.fallback_endpoint),
            ("intent.api_url", &self.intent.api_url),
            ("transfer.endpoint", &self.transfer.endpoint),
        ] {
            validate_url(label, endpoint)?;
        }
        if let Some(endpoint) = &self.store.kv_endpoint {
            validate_url("store.kv_endpoint", endpoint)?;
        }
        if let Some(endpoint) = &self.store.directory_endpoint {
            validate_url("store.directory_endpoint", endpoint)?;
        }
        if let Some(endpoint) = &self.records.endpoint {
            validate_url("records.endpoint", endpoint)?;
        }
        if self.buffer.min_utterance_ms > self.buffer.hard_cap_ms {
            return Err(EngineError::Config(
                "buffer.min_utterance_ms exceeds buffer.hard_cap_ms".to_owned(),
            ));
        }
        Ok(())
    }
}

fn validate_url(label: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(EngineError::Config(format!("{label} is empty")));
    }
    url::Url::parse(value)
        .map_err(|e| EngineError::Config(format!("{label} is not a valid URL: {e}")))?;
    Ok(())
}

fn validate_e164(number: &str) -> Result<()> {
    let digits = number.strip_prefix('+').unwrap_or("");
    let ok = !digits.is_empty()
        && digits.len() >= 8
        && digits.len() <= 15
        && digits.bytes().all(|b| b.is_ascii_digit())
        && digits.as_bytes()[0] != b'0';
    if ok {
        Ok(())
    } else {
        Err(EngineError::Config(format!(
            "transfer.agent_number is not E.164: {number:?}"
        )))
    }
}

/// Listener and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address for the media-stream listener.
    pub bind_addr: String,
    /// Optional directory for rotating file logs; stderr only when unset.
    pub log_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),
            log_dir: None,
        }
    }
}

/// State → language configuration for the opening greeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LanguageConfig {
    /// Full state names (case-insensitive) to language tags. States not
    /// listed here greet in English.
    pub default_state_map: HashMap<String, String>,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        let mut map = HashMap::new();
        for state in [
            "Uttar Pradesh",
            "Bihar",
            "Madhya Pradesh",
            "Rajasthan",
            "Haryana",
            "Delhi",
            "Jharkhand",
            "Chhattisgarh",
            "Uttarakhand",
            "Himachal Pradesh",
        ] {
            map.insert(state.to_owned(), "hi".to_owned());
        }
        map.insert("Tamil Nadu".to_owned(), "ta".to_owned());
        map.insert("Telangana".to_owned(), "te".to_owned());
        map.insert("Andhra Pradesh".to_owned(), "te".to_owned());
        map.insert("Karnataka".to_owned(), "kn".to_owned());
        map.insert("Kerala".to_owned(), "ml".to_owned());
        map.insert("Gujarat".to_owned(), "gu".to_owned());
        map.insert("Maharashtra".to_owned(), "mr".to_owned());
        map.insert("West Bengal".to_owned(), "bn".to_owned());
        map.insert("Punjab".to_owned(), "pa".to_owned());
        map.insert("Odisha".to_owned(), "or".to_owned());
        Self {
            default_state_map: map,
        }
    }
}

/// Speech-to-text adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AsrConfig {
    /// Transcription endpoint (expects a multipart WAV upload).
    pub endpoint: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Total attempts per utterance.
    pub max_retries: u32,
    /// Delay between attempts.
    pub retry_delay_ms: u64,
    /// Utterances shorter than this skip the network entirely.
    pub min_audio_ms: u64,
    /// And shorter than this in bytes, after decoding.
    pub min_audio_bytes: usize,
    /// Per-request timeout.
    pub timeout_ms: u64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9100/v1/transcribe".to_owned(),
            api_key: None,
            max_retries: 2,
            retry_delay_ms: 600,
            min_audio_ms: 1_000,
            min_audio_bytes: 500,
            timeout_ms: 8_000,
        }
    }
}

/// Text-to-speech adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TtsConfig {
    /// Streaming synthesis endpoint.
    pub endpoint: String,
    /// Fallback endpoint tried when streaming errors.
    pub fallback_endpoint: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Outbound chunk cadence. The provider expects 20 ms frames.
    pub chunk_ms: u64,
    /// Floor of the processing tail added after playback before ASR
    /// re-enables. Actual tail is max(this, audio_ms / 2).
    pub processing_tail_ms: u64,
    /// Voice id per language tag. Languages not listed speak with the
    /// English voice (and the English template string).
    pub voices: HashMap<String, String>,
    /// Per-request timeout.
    pub timeout_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        let voices = ["en", "hi", "ta", "te", "kn", "ml", "gu", "mr", "bn", "pa", "or"]
            .into_iter()
            .map(|tag| (tag.to_owned(), format!("meera-{tag}")))
            .collect();
        Self {
            endpoint: "http://127.0.0.1:9200/v1/synthesize".to_owned(),
            fallback_endpoint: "http://127.0.0.1:9200/v1/synthesize_batch".to_owned(),
            api_key: None,
            chunk_ms: 20,
            processing_tail_ms: 500,
            voices,
            timeout_ms: 10_000,
        }
    }
}

/// Intent LLM configuration (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntentConfig {
    /// Base URL of the chat completions server.
    pub api_url: String,
    /// Model name to request.
    pub api_model: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout_ms: u64,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:9300".to_owned(),
            api_model: "intent-small".to_owned(),
            api_key: None,
            timeout_ms: 4_000,
        }
    }
}

/// Utterance buffer thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    /// Minimum buffered audio before a flush is considered.
    pub min_utterance_ms: u64,
    /// Inter-arrival gap that ends an utterance.
    pub quiet_window_ms: u64,
    /// Unconditional flush point; bounds buffer growth.
    pub hard_cap_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            min_utterance_ms: 1_000,
            quiet_window_ms: 600,
            hard_cap_ms: 12_000,
        }
    }
}

/// How long the dialog waits for a reply in each listening stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaitConfig {
    /// Reply window after the greeting.
    pub confirmation_s: u64,
    /// Reply window after the agent-connect question.
    pub agent_response_s: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            confirmation_s: 7,
            agent_response_s: 7,
        }
    }
}

/// Re-prompt bounds for the listening stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepeatConfig {
    /// Maximum consecutive re-prompts per listening stage.
    pub max: u8,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self { max: 2 }
    }
}

/// Per-call limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CallConfig {
    /// Hard cap on call duration; reaching it ends the call with
    /// outcome `timeout` through the orderly exit path.
    pub max_duration_s: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self { max_duration_s: 600 }
    }
}

/// What to do when the agent question has exhausted its re-prompts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnclearPolicy {
    /// Bridge to a human anyway; a caller still on the line after three
    /// prompts is better served by an agent.
    #[default]
    Transfer,
    /// Play the decline goodbye and end.
    Goodbye,
}

/// Agent transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Provider bridge endpoint.
    pub endpoint: String,
    /// Optional signing token for the bridge request.
    pub api_key: Option<String>,
    /// Agent phone number in E.164 form; validated at startup.
    pub agent_number: String,
    /// Bridge request timeout.
    pub timeout_ms: u64,
    /// Policy when the agent question stays unclear.
    pub on_repeated_unclear: UnclearPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9400/v1/calls/transfer".to_owned(),
            api_key: None,
            agent_number: "+911140001234".to_owned(),
            timeout_ms: 5_000,
            on_repeated_unclear: UnclearPolicy::Transfer,
        }
    }
}

/// Process-wide adapter rate limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateConfig {
    /// ASR calls per minute across all live calls.
    pub asr_per_min: u32,
    /// Minimum spacing between ASR calls.
    pub asr_min_gap_ms: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            asr_per_min: 20,
            asr_min_gap_ms: 3_000,
        }
    }
}

/// Session store and customer directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Key-value session store service; in-process store when unset.
    pub kv_endpoint: Option<String>,
    /// Snapshot TTL written by the dial-out path.
    pub ttl_s: u64,
    /// How long to tolerate a missing snapshot after `start`.
    pub resolve_grace_ms: u64,
    /// Lookup cadence within the grace period.
    pub resolve_poll_ms: u64,
    /// Relational fallback lookup endpoint.
    pub directory_endpoint: Option<String>,
    /// Whether the phone-number fallback lookup is allowed at all.
    pub directory_fallback: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kv_endpoint: None,
            ttl_s: 7_200,
            resolve_grace_ms: 10_000,
            resolve_poll_ms: 500,
            directory_endpoint: None,
            directory_fallback: true,
        }
    }
}

/// Call record sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordsConfig {
    /// Append-only record endpoint; records are dropped with a warning
    /// when unset.
    pub endpoint: Option<String>,
    /// Per-request timeout.
    pub timeout_ms: u64,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 5_000,
        }
    }
}
