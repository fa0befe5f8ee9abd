//! Intent classification for the agent-connect question.
//!
//! Primary path is a remote LLM asked to emit a single word from a
//! closed set; anything that errors or comes back unparseable falls
//! through to a token lexicon covering English and the major Indic
//! languages. The classifier itself never fails; worst case is
//! `Unclear`, which the dialog turns into a re-prompt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::IntentConfig;
use crate::error::{EngineError, Result};
use crate::language::Language;

/// What the caller meant by a short reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Affirmative,
    Negative,
    Unclear,
}

/// Remote intent model capability.
#[async_trait]
pub trait IntentModel: Send + Sync {
    async fn classify(&self, transcript: &str, language: Language) -> Result<Intent>;
}

/// OpenAI-compatible chat-completions client with a strictly
/// constrained single-word prompt.
pub struct ChatIntentModel {
    client: reqwest::Client,
    config: IntentConfig,
}

impl ChatIntentModel {
    pub fn new(config: IntentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EngineError::LlmTransient(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

const INTENT_SYSTEM_PROMPT: &str = "You classify a short phone reply to the question \
'would you like to talk to an agent?'. Reply with exactly one word: \
affirmative, negative, or unclear. No punctuation, no explanation.";

#[async_trait]
impl IntentModel for ChatIntentModel {
    async fn classify(&self, transcript: &str, language: Language) -> Result<Intent> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.api_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": self.config.api_model,
            "messages": [
                {"role": "system", "content": INTENT_SYSTEM_PROMPT},
                {"role": "user", "content": format!("Language: {}. Reply: {transcript}", language.tag())},
            ],
            "temperature": 0,
            "max_tokens": 4,
        });

        let mut request = self.client.post(url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::LlmTransient(format!("request: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::LlmTransient(format!(
                "service returned {}",
                response.status()
            )));
        }
        let parsed = response
            .json::<ChatResponse>()
            .await
            .map_err(|e| EngineError::LlmTransient(format!("response body: {e}")))?;

        let word = parsed
            .choices
            .first()
            .map(|c| c.message.content.trim().to_lowercase())
            .unwrap_or_default();
        match word.as_str() {
            "affirmative" => Ok(Intent::Affirmative),
            "negative" => Ok(Intent::Negative),
            "unclear" => Ok(Intent::Unclear),
            other => Err(EngineError::LlmTransient(format!(
                "unparseable intent reply: {other:?}"
            ))),
        }
    }
}

/// LLM-with-fallback wrapper the dialog actually calls.
pub struct IntentClassifier {
    model: Option<Arc<dyn IntentModel>>,
}

impl IntentClassifier {
    #[must_use]
    pub fn new(model: Arc<dyn IntentModel>) -> Self {
        Self { model: Some(model) }
    }

    /// Lexicon-only classifier, used in tests and when no LLM endpoint
    /// is configured.
    #[must_use]
    pub fn lexicon_only() -> Self {
        Self { model: None }
    }

    /// Classify a reply. Infallible: LLM errors fall back to the
    /// lexicon, and a lexicon miss is `Unclear`.
    pub async fn classify(&self, transcript: &str, language: Language) -> Intent {
        if let Some(model) = &self.model {
            match model.classify(transcript, language).await {
                Ok(intent) => {
                    debug!(?intent, "intent from LLM");
                    return intent;
                }
                Err(e) => {
                    warn!(error = %e, "intent LLM failed, using lexicon");
                }
            }
        }
        lexicon_intent(transcript)
    }
}

/// Deterministic token-lexicon classifier.
///
/// Phrase matches outrank token matches so that "ji nahi" reads as a
/// polite no even though "ji" alone is affirmative. A reply matching
/// both polarities at the same level (or neither) is `Unclear`.
#[must_use]
pub fn lexicon_intent(transcript: &str) -> Intent {
    let lower = transcript.to_lowercase();

    let affirmative_phrase = AFFIRMATIVE_PHRASES.iter().any(|p| lower.contains(p));
    let negative_phrase = NEGATIVE_PHRASES.iter().any(|p| lower.contains(p));
    match (affirmative_phrase, negative_phrase) {
        (true, false) => return Intent::Affirmative,
        (false, true) => return Intent::Negative,
        (true, true) => return Intent::Unclear,
        (false, false) => {}
    }

    // Whitespace split with edge-punctuation trim: splitting on
    // non-alphanumerics would cut Indic words at viramas and matras.
    let tokens: Vec<&str> = lower
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| c.is_ascii_punctuation()))
        .filter(|t| !t.is_empty())
        .collect();
    let affirmative = tokens.iter().any(|t| AFFIRMATIVE_TOKENS.contains(t));
    let negative = tokens.iter().any(|t| NEGATIVE_TOKENS.contains(t));
    match (affirmative, negative) {
        (true, false) => Intent::Affirmative,
        (false, true) => Intent::Negative,
        _ => Intent::Unclear,
    }
}

const AFFIRMATIVE_TOKENS: &[&str] = &[
    // English
    "yes", "yeah", "yep", "sure", "okay", "ok", "fine", "correct", "right", "connect",
    // Romanized Hindi
    "haan", "han", "haa", "haanji", "ji", "bilkul", "theek", "thik", "acha", "accha", "sahi",
    // Devanagari
    "हाँ", "हां", "जी", "ठीक", "बिल्कुल", "सही",
    // Other Indic scripts
    "ஆமாம்", "சரி", "అవును", "సరే", "ಹೌದು", "ಸರಿ", "അതെ", "ശരി", "હા", "ਹਾਂ", "হ্যাঁ", "ହଁ", "हो",
];

const AFFIRMATIVE_PHRASES: &[&str] = &["go ahead", "why not", "of course", "ji haan", "haan ji"];

const NEGATIVE_TOKENS: &[&str] = &[
    // English
    "no", "nope", "not", "never", "dont", "don't", "cant", "can't", "later", "busy",
    // Romanized Hindi
    "nahi", "nahin", "nako", "mat",
    // Devanagari
    "नहीं", "नही", "मत", "नको",
    // Other Indic scripts
    "இல்லை", "வேண்டாம்", "కాదు", "వద్దు", "ಇಲ್ಲ", "ಬೇಡ", "ഇല്ല", "വേണ്ട", "ના", "ਨਹੀਂ", "না", "ନାହିଁ",
];

const NEGATIVE_PHRASES: &[&str] = &["not now", "ji nahi", "nahi chahiye", "call later"];
