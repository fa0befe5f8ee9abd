//! Per-call session state and the decision core of the conversation
//! flow.
//!
//! Everything here is pure state and pure decisions: which stage the
//! call is in, which edges are legal, what a reply means for the next
//! stage. The dialog task owns a `CallSession` exclusively for the
//! call's lifetime and is the only writer; adapters only ever see
//! read-only data.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::error::{EngineError, Result};
use crate::intent::Intent;
use crate::language::Language;
use crate::store::CustomerSnapshot;

/// Stages of the call flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Connection accepted; waiting for the provider's `start`.
    AwaitStart,
    /// Looking up the customer snapshot, bounded by the grace period.
    ResolveContext,
    /// Playing the greeting in the initial language.
    SpeakingGreeting,
    /// Listening for the first reply; language switch happens here.
    WaitingConfirmation,
    /// Replaying the greeting in the newly detected language.
    SpeakingRegreeting,
    /// Loan details, part one.
    SpeakingEmi1,
    /// Loan details, part two.
    SpeakingEmi2,
    /// "Talk to an agent?" question.
    SpeakingAgentQuestion,
    /// Listening for the agent-connect answer.
    WaitingAgentResponse,
    /// Bridging to a human.
    Transferring,
    /// Polite close after a decline.
    SpeakingDeclineGoodbye,
    /// Terminal.
    End,
}

impl Stage {
    /// Wire name used in call records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitStart => "await_start",
            Self::ResolveContext => "resolve_context",
            Self::SpeakingGreeting => "speaking_greeting",
            Self::WaitingConfirmation => "waiting_confirmation",
            Self::SpeakingRegreeting => "speaking_regreeting",
            Self::SpeakingEmi1 => "speaking_emi_1",
            Self::SpeakingEmi2 => "speaking_emi_2",
            Self::SpeakingAgentQuestion => "speaking_agent_question",
            Self::WaitingAgentResponse => "waiting_agent_response",
            Self::Transferring => "transferring",
            Self::SpeakingDeclineGoodbye => "speaking_decline_goodbye",
            Self::End => "end",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::End)
    }

    /// True while a prompt is (or would be) playing; inbound audio is
    /// buffered but not decoded in these stages.
    #[must_use]
    pub fn is_speaking(self) -> bool {
        matches!(
            self,
            Self::SpeakingGreeting
                | Self::SpeakingRegreeting
                | Self::SpeakingEmi1
                | Self::SpeakingEmi2
                | Self::SpeakingAgentQuestion
                | Self::SpeakingDeclineGoodbye
        )
    }

    /// Permitted forward edges. `End` is reachable from anywhere and is
    /// handled separately.
    fn can_reach(self, to: Stage) -> bool {
        use Stage::{
            AwaitStart, ResolveContext, SpeakingAgentQuestion, SpeakingDeclineGoodbye,
            SpeakingEmi1, SpeakingEmi2, SpeakingGreeting, SpeakingRegreeting, Transferring,
            WaitingAgentResponse, WaitingConfirmation,
        };
        matches!(
            (self, to),
            (AwaitStart, ResolveContext)
                | (ResolveContext, SpeakingGreeting)
                | (SpeakingGreeting, WaitingConfirmation)
                | (WaitingConfirmation, SpeakingRegreeting)
                | (WaitingConfirmation, SpeakingGreeting)
                | (WaitingConfirmation, SpeakingEmi1)
                | (WaitingConfirmation, SpeakingDeclineGoodbye)
                | (SpeakingRegreeting, WaitingConfirmation)
                | (SpeakingEmi1, SpeakingEmi2)
                | (SpeakingEmi2, SpeakingAgentQuestion)
                | (SpeakingAgentQuestion, WaitingAgentResponse)
                | (WaitingAgentResponse, SpeakingAgentQuestion)
                | (WaitingAgentResponse, Transferring)
                | (WaitingAgentResponse, SpeakingDeclineGoodbye)
                | (Transferring, SpeakingDeclineGoodbye)
        )
    }
}

/// Who said a logged line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Bot,
    Caller,
}

/// One line of the conversation, kept for the final summary.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub speaker: Speaker,
    pub language: Language,
    pub text: String,
}

/// Per-call mutable state, exclusively owned by the dialog task.
#[derive(Debug)]
pub struct CallSession {
    pub call_id: String,
    pub stream_sid: String,
    pub customer: CustomerSnapshot,
    pub initial_language: Language,
    pub current_language: Language,
    stage: Stage,
    pub confirmation_attempts: u8,
    pub agent_repeat_attempts: u8,
    /// Latched once `SPEAKING_REGREETING` has run; a call switches
    /// language at most once.
    pub regreeted: bool,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
    pub last_inbound_at: Instant,
    log: Vec<LogEntry>,
}

impl CallSession {
    #[must_use]
    pub fn new(
        call_id: String,
        stream_sid: String,
        customer: CustomerSnapshot,
        initial_language: Language,
    ) -> Self {
        let now = Instant::now();
        Self {
            call_id,
            stream_sid,
            customer,
            initial_language,
            current_language: initial_language,
            stage: Stage::ResolveContext,
            confirmation_attempts: 0,
            agent_repeat_attempts: 0,
            regreeted: false,
            started_at: now,
            started_at_utc: Utc::now(),
            last_inbound_at: now,
            log: Vec::new(),
        }
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move to the next stage, enforcing the permitted edges. `End` is
    /// always reachable; everything else must follow the flow graph.
    pub fn transition(&mut self, to: Stage) -> Result<()> {
        if self.stage == Stage::End {
            return Err(EngineError::SessionProtocol(format!(
                "transition out of terminal stage to {}",
                to.as_str()
            )));
        }
        if to != Stage::End && !self.stage.can_reach(to) {
            return Err(EngineError::SessionProtocol(format!(
                "forbidden transition {} -> {}",
                self.stage.as_str(),
                to.as_str()
            )));
        }
        self.stage = to;
        Ok(())
    }

    /// Switch the conversation language at a sanctioned decision point.
    pub fn switch_language(&mut self, to: Language) {
        self.current_language = to;
        self.regreeted = true;
        self.confirmation_attempts = 0;
    }

    pub fn log_line(&mut self, speaker: Speaker, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.log.push(LogEntry {
            speaker,
            language: self.current_language,
            text: text.trim().to_owned(),
        });
    }

    /// Render the conversation summary for the final call record.
    #[must_use]
    pub fn summary(&self) -> String {
        const MAX_LEN: usize = 2_000;
        let mut out = String::new();
        for entry in &self.log {
            let who = match entry.speaker {
                Speaker::Bot => "bot",
                Speaker::Caller => "caller",
            };
            if !out.is_empty() {
                out.push_str(" | ");
            }
            out.push_str(&format!("{who}({}): {}", entry.language, entry.text));
            if out.len() >= MAX_LEN {
                let mut end = MAX_LEN;
                while !out.is_char_boundary(end) {
                    end -= 1;
                }
                out.truncate(end);
                break;
            }
        }
        out
    }
}

/// What the first reply (or its absence) means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// Caller answered in a different language: replay the greeting in
    /// it and listen again.
    Regreet(Language),
    /// Confirmed; move on to the loan details.
    Proceed,
    /// Declined; say goodbye.
    Decline,
    /// Nothing usable; replay the greeting.
    Reprompt,
    /// Re-prompts exhausted; say goodbye.
    GiveUp,
}

/// Decide the confirmation stage. `reply` is `None` for silence or an
/// empty transcript; `detected` is the resolved language of a non-empty
/// reply. `attempts` is the count of re-prompts already burned.
#[must_use]
pub fn decide_confirmation(
    current_language: Language,
    initial_language: Language,
    regreeted: bool,
    reply: Option<&str>,
    detected: Option<Language>,
    attempts: u8,
    repeat_max: u8,
) -> ConfirmationOutcome {
    let Some(reply) = reply.filter(|r| !r.trim().is_empty()) else {
        return if attempts < repeat_max {
            ConfirmationOutcome::Reprompt
        } else {
            ConfirmationOutcome::GiveUp
        };
    };

    // Language first: a caller answering in another language gets the
    // greeting again in it before any yes/no is read into the reply.
    if !regreeted
        && let Some(detected) = detected
        && detected != current_language
        && detected != initial_language
    {
        return ConfirmationOutcome::Regreet(detected);
    }

    match crate::intent::lexicon_intent(reply) {
        Intent::Affirmative => ConfirmationOutcome::Proceed,
        Intent::Negative => ConfirmationOutcome::Decline,
        Intent::Unclear => {
            if attempts < repeat_max {
                ConfirmationOutcome::Reprompt
            } else {
                ConfirmationOutcome::GiveUp
            }
        }
    }
}

/// What the agent-connect answer (or its absence) means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentResponseOutcome {
    /// Bridge to a human.
    Transfer,
    /// Say goodbye.
    Decline,
    /// Replay the question.
    Reprompt,
    /// Re-prompts exhausted; the configured unclear policy applies.
    Exhausted,
}

/// Decide the agent-response stage. `intent` is `None` for silence or an
/// empty transcript.
#[must_use]
pub fn decide_agent_response(
    intent: Option<Intent>,
    attempts: u8,
    repeat_max: u8,
) -> AgentResponseOutcome {
    match intent {
        Some(Intent::Affirmative) => AgentResponseOutcome::Transfer,
        Some(Intent::Negative) => AgentResponseOutcome::Decline,
        Some(Intent::Unclear) | None => {
            if attempts < repeat_max {
                AgentResponseOutcome::Reprompt
            } else {
                AgentResponseOutcome::Exhausted
            }
        }
    }
}
