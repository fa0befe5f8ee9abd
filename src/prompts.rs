//! Localized prompt catalog.
//!
//! Every line the engine speaks comes from here. Catalogs are keyed by
//! prompt and language; a missing locale falls back to the English
//! string so an incomplete catalog degrades to an understandable call
//! rather than a failed one. Placeholders are `{name}`-style and render
//! as empty strings when a value is missing.

use crate::language::Language;

/// The fixed set of things the engine ever says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptId {
    /// Opening greeting, confirms we reached the right person.
    Greeting,
    /// Loan details, first half: who, which loan, how much, by when.
    EmiPart1,
    /// Loan details, second half: consequence and ask.
    EmiPart2,
    /// "Would you like to talk to an agent?"
    AgentConnect,
    /// Polite close after a decline.
    GoodbyeDecline,
    /// "Please hold while I connect you."
    TransferNotice,
}

/// Named values interpolated into prompt templates.
#[derive(Debug, Clone, Default)]
pub struct PromptParams {
    pub name: String,
    pub loan_id: String,
    pub amount: String,
    pub due_date: String,
}

impl PromptParams {
    fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "name" => Some(&self.name),
            "loan_id" => Some(&self.loan_id),
            "amount" => Some(&self.amount),
            "due_date" => Some(&self.due_date),
            _ => None,
        }
    }
}

/// Render a prompt in the requested language, falling back to English
/// when the locale has no string for it.
#[must_use]
pub fn render(id: PromptId, language: Language, params: &PromptParams) -> String {
    let template = template(id, language)
        .or_else(|| template(id, Language::English))
        .unwrap_or_default();
    interpolate(template, params)
}

/// True when the catalog carries this prompt in this language without
/// falling back. The dialog uses this to decide whether a language can
/// be spoken natively.
#[must_use]
pub fn has_locale(id: PromptId, language: Language) -> bool {
    template(id, language).is_some()
}

fn template(id: PromptId, language: Language) -> Option<&'static str> {
    use Language::{English, Hindi};
    use PromptId::{AgentConnect, EmiPart1, EmiPart2, GoodbyeDecline, Greeting, TransferNotice};

    match (language, id) {
        (English, Greeting) => Some(
            "Hello, am I speaking with {name}? This is a call from your lender regarding your loan account.",
        ),
        (English, EmiPart1) => Some(
            "Your loan {loan_id} has an outstanding amount of {amount} rupees, due on {due_date}.",
        ),
        (English, EmiPart2) => Some(
            "Paying on time keeps your credit record clean and avoids late fees. We are here to help you close this.",
        ),
        (English, AgentConnect) => Some(
            "Would you like me to connect you to one of our agents to discuss payment options? Please say yes or no.",
        ),
        (English, GoodbyeDecline) => Some(
            "No problem. Please try to pay before the due date. Thank you for your time, goodbye.",
        ),
        (English, TransferNotice) => Some(
            "Please stay on the line while I connect you to an agent.",
        ),

        (Hindi, Greeting) => Some(
            "नमस्ते, क्या मेरी बात {name} से हो रही है? यह आपके लोन खाते के बारे में आपके ऋणदाता की ओर से कॉल है।",
        ),
        (Hindi, EmiPart1) => Some(
            "आपके लोन {loan_id} पर {amount} रुपये बकाया हैं, जिसकी अंतिम तिथि {due_date} है।",
        ),
        (Hindi, EmiPart2) => Some(
            "समय पर भुगतान करने से आपका क्रेडिट रिकॉर्ड अच्छा रहता है और लेट फीस नहीं लगती। हम इसमें आपकी मदद के लिए हैं।",
        ),
        (Hindi, AgentConnect) => Some(
            "क्या आप भुगतान के विकल्पों के बारे में हमारे एजेंट से बात करना चाहेंगे? कृपया हाँ या नहीं कहें।",
        ),
        (Hindi, GoodbyeDecline) => Some(
            "कोई बात नहीं। कृपया अंतिम तिथि से पहले भुगतान करने की कोशिश करें। आपके समय के लिए धन्यवाद, नमस्ते।",
        ),
        (Hindi, TransferNotice) => Some(
            "कृपया लाइन पर बने रहें, मैं आपको एजेंट से जोड़ रही हूँ।",
        ),

        _ => None,
    }
}

/// Replace `{key}` placeholders. Unknown keys and missing values render
/// as empty strings; a literal `{` without a closing brace passes
/// through unchanged.
fn interpolate(template: &str, params: &PromptParams) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                out.push_str(params.lookup(key).unwrap_or(""));
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}
