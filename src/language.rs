//! Language tags and deterministic language resolution.
//!
//! Two jobs: map a customer's home state to the language the greeting
//! opens in, and classify a transcript's language so the flow can switch
//! when the caller answers in something else. Classification is fully
//! deterministic: script detection first, then romanized-Hindi lexicons,
//! then an English token threshold.

use std::collections::HashMap;

/// Languages the engine can greet, prompt and transfer in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(rename = "en")]
    English,
    #[serde(rename = "hi")]
    Hindi,
    #[serde(rename = "ta")]
    Tamil,
    #[serde(rename = "te")]
    Telugu,
    #[serde(rename = "kn")]
    Kannada,
    #[serde(rename = "ml")]
    Malayalam,
    #[serde(rename = "gu")]
    Gujarati,
    #[serde(rename = "mr")]
    Marathi,
    #[serde(rename = "bn")]
    Bengali,
    #[serde(rename = "pa")]
    Punjabi,
    #[serde(rename = "or")]
    Odia,
}

impl Language {
    /// BCP-47-style primary subtag used on the wire and in config.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::English => "en",
            Self::Hindi => "hi",
            Self::Tamil => "ta",
            Self::Telugu => "te",
            Self::Kannada => "kn",
            Self::Malayalam => "ml",
            Self::Gujarati => "gu",
            Self::Marathi => "mr",
            Self::Bengali => "bn",
            Self::Punjabi => "pa",
            Self::Odia => "or",
        }
    }

    /// Parse a language tag. Accepts bare subtags and region-qualified
    /// forms like `hi-IN`.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        let primary = tag.trim().split(['-', '_']).next()?.to_ascii_lowercase();
        match primary.as_str() {
            "en" => Some(Self::English),
            "hi" => Some(Self::Hindi),
            "ta" => Some(Self::Tamil),
            "te" => Some(Self::Telugu),
            "kn" => Some(Self::Kannada),
            "ml" => Some(Self::Malayalam),
            "gu" => Some(Self::Gujarati),
            "mr" => Some(Self::Marathi),
            "bn" => Some(Self::Bengali),
            "pa" => Some(Self::Punjabi),
            "or" => Some(Self::Odia),
            _ => None,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Maps customer geography to an opening language and classifies
/// transcripts. Built once at startup from config and shared per call.
#[derive(Debug, Clone)]
pub struct LanguageResolver {
    state_map: HashMap<String, Language>,
}

impl LanguageResolver {
    /// Build a resolver from a state-name → language-tag table.
    ///
    /// Keys are normalized case-insensitively; unknown tags are ignored
    /// with a warning so one typo in config doesn't take the engine down.
    #[must_use]
    pub fn new(state_map: &HashMap<String, String>) -> Self {
        let mut map = HashMap::with_capacity(state_map.len());
        for (state, tag) in state_map {
            match Language::from_tag(tag) {
                Some(lang) => {
                    map.insert(normalize_state(state), lang);
                }
                None => {
                    tracing::warn!(state = %state, tag = %tag, "unknown language tag in state map, skipping");
                }
            }
        }
        Self { state_map: map }
    }

    /// Initial language for a customer's home state. Full state names
    /// only, case-insensitive; anything unrecognized gets English.
    #[must_use]
    pub fn for_state(&self, state: &str) -> Language {
        self.state_map
            .get(&normalize_state(state))
            .copied()
            .unwrap_or(Language::English)
    }

    /// Classify a transcript's language.
    ///
    /// Priority, first match wins:
    /// 1. Indic script detection (a mixed-script transcript resolves to
    ///    the first matching script).
    /// 2. Romanized Hindi phrase match.
    /// 3. Romanized Hindi token match.
    /// 4. English threshold: ≥ 70% of tokens of length ≥ 3 in the
    ///    English lexicon.
    /// 5. English.
    #[must_use]
    pub fn classify(&self, transcript: &str) -> Language {
        if let Some(lang) = detect_script(transcript) {
            tracing::trace!(language = %lang, "classified by script");
            return lang;
        }
        let lower = transcript.to_lowercase();
        if ROMANIZED_HINDI_PHRASES.iter().any(|p| lower.contains(p)) {
            tracing::trace!("classified by romanized phrase");
            return Language::Hindi;
        }
        let tokens: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.iter().any(|t| ROMANIZED_HINDI_TOKENS.contains(t)) {
            tracing::trace!("classified by romanized token");
            return Language::Hindi;
        }
        if english_ratio(&tokens) >= ENGLISH_THRESHOLD {
            tracing::trace!("classified by English token ratio");
        } else {
            tracing::trace!("no rule matched, defaulting to English");
        }
        Language::English
    }
}

fn normalize_state(state: &str) -> String {
    state.trim().to_lowercase()
}

/// Detect the first supported Indic script in the text.
///
/// Devanagari resolves to Hindi; Marathi shares the script and is only
/// reachable through the state map or an explicit ASR language code.
#[must_use]
pub fn detect_script(text: &str) -> Option<Language> {
    for c in text.chars() {
        let lang = match c as u32 {
            0x0900..=0x097F => Language::Hindi,     // Devanagari
            0x0980..=0x09FF => Language::Bengali,   // Bengali
            0x0A00..=0x0A7F => Language::Punjabi,   // Gurmukhi
            0x0A80..=0x0AFF => Language::Gujarati,  // Gujarati
            0x0B00..=0x0B7F => Language::Odia,      // Odia
            0x0B80..=0x0BFF => Language::Tamil,     // Tamil
            0x0C00..=0x0C7F => Language::Telugu,    // Telugu
            0x0C80..=0x0CFF => Language::Kannada,   // Kannada
            0x0D00..=0x0D7F => Language::Malayalam, // Malayalam
            _ => continue,
        };
        return Some(lang);
    }
    None
}

/// Share of length-≥3 tokens that must be English to call it English.
const ENGLISH_THRESHOLD: f32 = 0.7;

/// Romanized Hindi phrases checked before token-level matching so that
/// "ji haan" wins even inside an otherwise English sentence.
const ROMANIZED_HINDI_PHRASES: &[&str] = &[
    "ji haan",
    "haan ji",
    "ji nahi",
    "nahi ji",
    "theek hai",
    "thik hai",
    "bilkul nahi",
    "haan bhai",
    "acha theek",
    "samajh gaya",
    "samajh gayi",
    "bol raha",
    "bol rahi",
    "kya baat",
];

const ROMANIZED_HINDI_TOKENS: &[&str] = &[
    "ji", "haan", "han", "haa", "nahi", "nahin", "acha", "accha", "theek", "thik", "bilkul",
    "kyun", "kyon", "kya", "kaun", "karo", "karna", "chahiye", "paisa", "paise", "rupaye",
    "bhai", "bhaiya", "madam", "sahab", "abhi", "baad", "mein", "matlab", "samajh", "bataiye",
    "boliye", "suniye", "haanji", "nako",
];

fn english_ratio(tokens: &[&str]) -> f32 {
    let considered: Vec<&str> = tokens.iter().copied().filter(|t| t.len() >= 3).collect();
    if considered.is_empty() {
        return 0.0;
    }
    let hits = considered
        .iter()
        .filter(|t| ENGLISH_TOKENS.contains(t))
        .count();
    hits as f32 / considered.len() as f32
}

/// Common conversational English tokens. Deliberately small: the check
/// only needs to separate English replies from romanized Indic ones.
const ENGLISH_TOKENS: &[&str] = &[
    "yes", "yeah", "yep", "sure", "okay", "fine", "right", "correct", "speaking", "this",
    "that", "the", "and", "but", "not", "now", "later", "please", "thanks", "thank", "you",
    "hello", "who", "what", "why", "where", "when", "how", "can", "will", "want", "need",
    "call", "back", "busy", "time", "money", "loan", "pay", "paid", "payment", "done",
    "already", "today", "tomorrow", "sorry", "wait", "hold", "agent", "talk", "speak",
    "know", "tell", "listen", "good", "morning", "evening", "afternoon", "wrong", "number",
];

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn resolver() -> LanguageResolver {
        let mut map = HashMap::new();
        map.insert("Uttar Pradesh".to_owned(), "hi".to_owned());
        map.insert("Tamil Nadu".to_owned(), "ta".to_owned());
        map.insert("West Bengal".to_owned(), "bn".to_owned());
        LanguageResolver::new(&map)
    }

    #[test]
    fn tag_round_trip() {
        for lang in [
            Language::English,
            Language::Hindi,
            Language::Tamil,
            Language::Telugu,
            Language::Kannada,
            Language::Malayalam,
            Language::Gujarati,
            Language::Marathi,
            Language::Bengali,
            Language::Punjabi,
            Language::Odia,
        ] {
            assert_eq!(Language::from_tag(lang.tag()), Some(lang));
        }
    }

    #[test]
    fn from_tag_accepts_region_qualified() {
        assert_eq!(Language::from_tag("hi-IN"), Some(Language::Hindi));
        assert_eq!(Language::from_tag("TA_in"), Some(Language::Tamil));
        assert_eq!(Language::from_tag("fr"), None);
    }

    #[test]
    fn state_map_is_case_insensitive() {
        let r = resolver();
        assert_eq!(r.for_state("uttar pradesh"), Language::Hindi);
        assert_eq!(r.for_state("TAMIL NADU"), Language::Tamil);
        assert_eq!(r.for_state("  West Bengal "), Language::Bengali);
    }

    #[test]
    fn unknown_state_defaults_to_english() {
        assert_eq!(resolver().for_state("Atlantis"), Language::English);
        assert_eq!(resolver().for_state(""), Language::English);
    }

    #[test]
    fn script_detection_wins_over_everything() {
        let r = resolver();
        assert_eq!(r.classify("हाँ जी"), Language::Hindi);
        assert_eq!(r.classify("ஆமாம் சரி"), Language::Tamil);
        assert_eq!(r.classify("అవును"), Language::Telugu);
        assert_eq!(r.classify("ಹೌದು"), Language::Kannada);
        assert_eq!(r.classify("അതെ"), Language::Malayalam);
        assert_eq!(r.classify("হ্যাঁ"), Language::Bengali);
        assert_eq!(r.classify("હા"), Language::Gujarati);
        assert_eq!(r.classify("ਹਾਂ ਜੀ"), Language::Punjabi);
        assert_eq!(r.classify("ହଁ"), Language::Odia);
    }

    #[test]
    fn mixed_script_resolves_to_first_match() {
        // Tamil appears first, Devanagari later.
        assert_eq!(resolver().classify("ஆமாம் हाँ"), Language::Tamil);
    }

    #[test]
    fn romanized_phrase_beats_english_tokens() {
        assert_eq!(resolver().classify("ji haan speaking"), Language::Hindi);
        assert_eq!(resolver().classify("theek hai"), Language::Hindi);
    }

    #[test]
    fn romanized_token_match() {
        assert_eq!(resolver().classify("haan bolo"), Language::Hindi);
        assert_eq!(resolver().classify("nahi chahiye abhi"), Language::Hindi);
    }

    #[test]
    fn english_threshold_applies_after_hindi_checks() {
        assert_eq!(resolver().classify("yes this is correct"), Language::English);
        // Mostly unknown tokens still fall through to the English default.
        assert_eq!(resolver().classify("zzz qqq xxx"), Language::English);
    }

    #[test]
    fn empty_transcript_is_english() {
        assert_eq!(resolver().classify(""), Language::English);
    }
}
