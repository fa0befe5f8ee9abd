//! Dialog task: drives the call flow.
//!
//! Owns the `CallSession` and the utterance buffer, consumes control
//! events and frames from ingress, and feeds playbacks to egress. All
//! stage transitions happen here, strictly serially: one event at a
//! time, one outstanding playback at a time. Adapters are injected as
//! capability objects so tests can run the whole flow against in-memory
//! fakes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::asr::SpeechToText;
use crate::audio;
use crate::buffer::{Utterance, UtteranceBuffer};
use crate::config::{EngineConfig, UnclearPolicy};
use crate::intent::{Intent, IntentClassifier};
use crate::language::{Language, LanguageResolver};
use crate::pipeline::messages::{ControlEvent, InboundFrame, PlaybackJob};
use crate::prompts::{self, PromptId, PromptParams};
use crate::records::{CallOutcome, RecordSink, RecordUpdate};
use crate::session::{
    AgentResponseOutcome, CallSession, ConfirmationOutcome, Speaker, Stage, decide_agent_response,
    decide_confirmation,
};
use crate::store::{
    ContextStore, CustomerDirectory, CustomerSnapshot, snapshot_from_custom_parameters,
};
use crate::telephony::StartMeta;
use crate::transfer::CallBridge;
use crate::tts::TextToSpeech;

/// Capabilities injected into the dialog at construction. No implicit
/// singletons: rate limiters and stores arrive from the outside.
#[derive(Clone)]
pub struct DialogDeps {
    pub asr: Arc<dyn SpeechToText>,
    pub tts: Arc<dyn TextToSpeech>,
    pub intent: Arc<IntentClassifier>,
    pub bridge: Arc<dyn CallBridge>,
    pub store: Arc<dyn ContextStore>,
    pub directory: Option<Arc<dyn CustomerDirectory>>,
    pub records: Arc<dyn RecordSink>,
    pub resolver: Arc<LanguageResolver>,
}

/// Why the flow stopped before (or instead of) its own terminal
/// decision.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EndCause {
    /// Provider sent `stop`; in-flight playback was allowed to finish.
    StopHint,
    /// Socket or a task channel went away.
    Closed,
    /// Protocol violation reported by ingress or a forbidden transition.
    Protocol(String),
    /// The per-call duration cap fired.
    HardCap,
    /// External cancellation (process shutdown).
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpeakResult {
    Played,
    /// TTS failed everywhere; the prompt was skipped and the flow moves
    /// on as if it had played.
    Skipped,
}

/// Run the dialog for one call until the flow ends.
pub async fn run_dialog(
    config: Arc<EngineConfig>,
    deps: DialogDeps,
    control_rx: mpsc::Receiver<ControlEvent>,
    frame_rx: mpsc::Receiver<InboundFrame>,
    playback_tx: mpsc::Sender<PlaybackJob>,
    cancel: CancellationToken,
) {
    let buffer = UtteranceBuffer::new(&config.buffer);
    let mut dialog = Dialog {
        config,
        deps,
        control_rx,
        frame_rx,
        playback_tx,
        buffer,
        cancel,
        hard_deadline: Instant::now() + Duration::from_secs(24 * 3600),
        stop_latched: false,
        playback_seq: 0,
        last_inbound_at: Instant::now(),
    };
    dialog.run().await;
}

struct Dialog {
    config: Arc<EngineConfig>,
    deps: DialogDeps,
    control_rx: mpsc::Receiver<ControlEvent>,
    frame_rx: mpsc::Receiver<InboundFrame>,
    playback_tx: mpsc::Sender<PlaybackJob>,
    buffer: UtteranceBuffer,
    cancel: CancellationToken,
    /// Absolute per-call deadline, armed when `start` arrives.
    hard_deadline: Instant,
    /// `stop` arrived while a playback was in flight.
    stop_latched: bool,
    playback_seq: u32,
    last_inbound_at: Instant,
}

impl Dialog {
    async fn run(&mut self) {
        let Some(meta) = self.await_start().await else {
            return;
        };
        let started_utc = Utc::now();
        self.hard_deadline =
            Instant::now() + Duration::from_secs(self.config.call.max_duration_s);
        info!(call_id = %meta.call_id, stream_sid = %meta.stream_sid, "call started");
        self.append_stage(&meta.call_id, Stage::AwaitStart, Language::English)
            .await;
        self.append_stage(&meta.call_id, Stage::ResolveContext, Language::English)
            .await;

        let mut session = match self.resolve_context(&meta).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                info!(call_id = %meta.call_id, "no customer context, ending call");
                self.finish_without_session(&meta, started_utc, CallOutcome::MissingContext)
                    .await;
                return;
            }
            Err(cause) => {
                let outcome = match cause {
                    EndCause::HardCap => CallOutcome::Timeout,
                    _ => CallOutcome::Failed,
                };
                self.finish_without_session(&meta, started_utc, outcome).await;
                return;
            }
        };
        session.started_at_utc = started_utc;

        let outcome = match self.converse(&mut session).await {
            Ok(outcome) => outcome,
            Err(cause) => outcome_for_early_end(&cause, session.stage()),
        };
        self.finalize(&mut session, outcome).await;
    }

    /// The scripted flow: greeting → confirmation → loan details →
    /// agent question → transfer or goodbye.
    async fn converse(&mut self, session: &mut CallSession) -> Result<CallOutcome, EndCause> {
        self.enter(session, Stage::SpeakingGreeting).await?;
        self.speak(session, PromptId::Greeting).await?;

        loop {
            self.enter(session, Stage::WaitingConfirmation).await?;
            let window = self.config.wait.confirmation_s;
            let reply = self.listen(window).await?;
            let (transcript, detected) = self.transcribe(session, reply).await;

            let decision = decide_confirmation(
                session.current_language,
                session.initial_language,
                session.regreeted,
                transcript.as_deref(),
                detected,
                session.confirmation_attempts,
                self.config.repeat.max,
            );
            debug!(call_id = %session.call_id, ?decision, "confirmation decision");
            match decision {
                ConfirmationOutcome::Regreet(language) => {
                    self.enter(session, Stage::SpeakingRegreeting).await?;
                    session.switch_language(language);
                    info!(call_id = %session.call_id, language = %language, "switching language");
                    self.speak(session, PromptId::Greeting).await?;
                }
                ConfirmationOutcome::Reprompt => {
                    session.confirmation_attempts += 1;
                    self.enter(session, Stage::SpeakingGreeting).await?;
                    self.speak(session, PromptId::Greeting).await?;
                }
                ConfirmationOutcome::Proceed => break,
                ConfirmationOutcome::Decline | ConfirmationOutcome::GiveUp => {
                    return self.goodbye(session).await;
                }
            }
        }

        self.enter(session, Stage::SpeakingEmi1).await?;
        self.speak(session, PromptId::EmiPart1).await?;
        self.enter(session, Stage::SpeakingEmi2).await?;
        self.speak(session, PromptId::EmiPart2).await?;

        loop {
            self.enter(session, Stage::SpeakingAgentQuestion).await?;
            let spoken = self.speak(session, PromptId::AgentConnect).await?;
            self.enter(session, Stage::WaitingAgentResponse).await?;

            let intent = if spoken == SpeakResult::Skipped {
                // The caller never heard the question.
                Some(Intent::Unclear)
            } else {
                let window = self.config.wait.agent_response_s;
                let reply = self.listen(window).await?;
                let (transcript, _) = self.transcribe(session, reply).await;
                match transcript {
                    Some(text) => Some(
                        self.deps
                            .intent
                            .classify(&text, session.current_language)
                            .await,
                    ),
                    None => None,
                }
            };

            let decision = decide_agent_response(
                intent,
                session.agent_repeat_attempts,
                self.config.repeat.max,
            );
            debug!(call_id = %session.call_id, ?decision, "agent response decision");
            match decision {
                AgentResponseOutcome::Transfer => break,
                AgentResponseOutcome::Decline => return self.goodbye(session).await,
                AgentResponseOutcome::Reprompt => {
                    session.agent_repeat_attempts += 1;
                }
                AgentResponseOutcome::Exhausted => {
                    match self.config.transfer.on_repeated_unclear {
                        UnclearPolicy::Transfer => break,
                        UnclearPolicy::Goodbye => return self.goodbye(session).await,
                    }
                }
            }
        }

        self.enter(session, Stage::Transferring).await?;
        let bridged = self
            .deps
            .bridge
            .transfer(&session.call_id, &self.config.transfer.agent_number)
            .await;
        match bridged {
            Ok(outcome) if outcome.is_success() => {
                info!(call_id = %session.call_id, "bridged to agent");
                // The bridge is up; even an interrupted notice leaves the
                // call transferred.
                let _ = self.speak(session, PromptId::TransferNotice).await;
                Ok(CallOutcome::Transferred)
            }
            Ok(outcome) => {
                warn!(call_id = %session.call_id, ?outcome, "transfer refused");
                self.transfer_failed(session).await
            }
            Err(e) => {
                warn!(call_id = %session.call_id, error = %e, "transfer failed");
                self.transfer_failed(session).await
            }
        }
    }

    async fn transfer_failed(
        &mut self,
        session: &mut CallSession,
    ) -> Result<CallOutcome, EndCause> {
        self.enter(session, Stage::SpeakingDeclineGoodbye).await?;
        let _ = self.speak(session, PromptId::GoodbyeDecline).await;
        Ok(CallOutcome::Failed)
    }

    async fn goodbye(&mut self, session: &mut CallSession) -> Result<CallOutcome, EndCause> {
        self.enter(session, Stage::SpeakingDeclineGoodbye).await?;
        let _ = self.speak(session, PromptId::GoodbyeDecline).await;
        Ok(CallOutcome::Declined)
    }

    /// Wait for the provider's `start`. Nothing is recorded before a
    /// call id exists.
    async fn await_start(&mut self) -> Option<StartMeta> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return None,
                event = self.control_rx.recv() => match event {
                    Some(ControlEvent::Start(meta)) => {
                        if meta.call_id.is_empty() {
                            warn!("start envelope without call id, ignoring");
                            continue;
                        }
                        return Some(meta);
                    }
                    Some(ControlEvent::Protocol(msg)) => {
                        warn!(%msg, "protocol violation before start");
                        return None;
                    }
                    Some(ControlEvent::Stop) | Some(ControlEvent::Closed) | None => return None,
                },
                frame = self.frame_rx.recv() => {
                    if frame.is_none() {
                        return None;
                    }
                }
            }
        }
    }

    /// Look up the customer snapshot: session store first, then the
    /// `start` custom parameters, then (within the grace period) the
    /// store again on a poll cadence, finally the relational directory.
    async fn resolve_context(
        &mut self,
        meta: &StartMeta,
    ) -> Result<Option<CallSession>, EndCause> {
        let grace_deadline =
            Instant::now() + Duration::from_millis(self.config.store.resolve_grace_ms);
        let poll = Duration::from_millis(self.config.store.resolve_poll_ms.max(50));
        let fallback = snapshot_from_custom_parameters(&meta.custom_parameters);

        let snapshot = loop {
            match self.deps.store.get(&meta.call_id).await {
                Ok(Some(snapshot)) => break Some(snapshot),
                Ok(None) => {}
                Err(e) => warn!(call_id = %meta.call_id, error = %e, "session store lookup failed"),
            }
            if let Some(snapshot) = &fallback {
                debug!(call_id = %meta.call_id, "using custom-parameters snapshot");
                break Some(snapshot.clone());
            }
            if Instant::now() + poll > grace_deadline {
                break None;
            }
            self.sleep_through(Instant::now() + poll).await?;
        };

        let snapshot = match snapshot {
            Some(snapshot) => Some(snapshot),
            None => self.directory_lookup(meta).await,
        };

        let Some(snapshot) = snapshot else {
            return Ok(None);
        };

        let initial_language = snapshot
            .preferred_language
            .unwrap_or_else(|| self.deps.resolver.for_state(&snapshot.state));
        Ok(Some(CallSession::new(
            meta.call_id.clone(),
            meta.stream_sid.clone(),
            snapshot,
            initial_language,
        )))
    }

    async fn directory_lookup(&self, meta: &StartMeta) -> Option<CustomerSnapshot> {
        if !self.config.store.directory_fallback {
            return None;
        }
        let directory = self.deps.directory.as_ref()?;
        // The only phone we can key on is the one the dial-out path put
        // in the custom parameters; without it there is nothing to ask.
        let phone = meta
            .custom_parameters
            .get("customer")
            .and_then(|raw| {
                raw.split('|')
                    .find_map(|pair| pair.strip_prefix("phone="))
                    .map(str::to_owned)
            })
            .or_else(|| meta.custom_parameters.get("phone").cloned())?;
        match directory.find_by_phone(&phone).await {
            Ok(found) => found,
            Err(e) => {
                warn!(call_id = %meta.call_id, error = %e, "directory lookup failed");
                None
            }
        }
    }

    /// Render, synthesize and play one prompt, then hold through the
    /// playback and processing tail. Inbound audio keeps accumulating
    /// but is not examined until the next listening stage.
    async fn speak(
        &mut self,
        session: &mut CallSession,
        id: PromptId,
    ) -> Result<SpeakResult, EndCause> {
        if self.stop_latched {
            return Err(EndCause::StopHint);
        }
        let native = prompts::has_locale(id, session.current_language);
        let language = if native {
            session.current_language
        } else {
            Language::English
        };
        let params = prompt_params(&session.customer);
        let mut text = prompts::render(id, language, &params);

        let pcm = match self.deps.tts.synthesize(&text, language).await {
            Ok(pcm) => pcm,
            Err(first) => {
                warn!(call_id = %session.call_id, error = %first, "TTS failed");
                if language == Language::English {
                    return Ok(SpeakResult::Skipped);
                }
                // One more try in English before the prompt is skipped.
                text = prompts::render(id, Language::English, &params);
                match self.deps.tts.synthesize(&text, Language::English).await {
                    Ok(pcm) => pcm,
                    Err(second) => {
                        warn!(call_id = %session.call_id, error = %second, "English TTS fallback failed, skipping prompt");
                        return Ok(SpeakResult::Skipped);
                    }
                }
            }
        };
        if pcm.is_empty() {
            return Ok(SpeakResult::Skipped);
        }

        session.log_line(Speaker::Bot, &text);
        self.playback_seq += 1;
        let mark = format!("{}-{}", session.stage().as_str(), self.playback_seq);
        let audio_ms = audio::duration_ms(&pcm);
        let job = PlaybackJob {
            pcm,
            mark,
            stream_sid: session.stream_sid.clone(),
        };
        if self.playback_tx.send(job).await.is_err() {
            return Err(EndCause::Closed);
        }

        // Real-time playback plus the tail that keeps the bot from
        // hearing its own voice as a reply.
        let tail_ms = self.config.tts.processing_tail_ms.max(audio_ms / 2);
        let done = Instant::now() + Duration::from_millis(audio_ms + tail_ms);
        self.sleep_through(done).await?;
        session.last_inbound_at = self.last_inbound_at;

        if self.stop_latched {
            // `stop` is a hint: the playback above was allowed to
            // finish, now the call ends.
            return Err(EndCause::StopHint);
        }
        Ok(SpeakResult::Played)
    }

    /// Wait up to `window_s` for a complete utterance. Returns `None`
    /// for silence; a caller mid-sentence at the deadline is given until
    /// the buffer's own quiet-window or hard-cap flush.
    async fn listen(&mut self, window_s: u64) -> Result<Option<Utterance>, EndCause> {
        if self.stop_latched {
            return Err(EndCause::StopHint);
        }
        let deadline = Instant::now() + Duration::from_secs(window_s);
        let mut deadline_passed = false;
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if let Some((utterance, reason)) = self.buffer.poll_flush(Instant::now()) {
                debug!(
                    duration_ms = utterance.duration_ms,
                    ?reason,
                    "utterance flushed"
                );
                return Ok(Some(utterance));
            }

            tokio::select! {
                () = self.cancel.cancelled() => return Err(EndCause::Shutdown),
                () = sleep_until(self.hard_deadline) => return Err(EndCause::HardCap),
                () = sleep_until(deadline), if !deadline_passed => {
                    if self.buffer.buffered_ms() < self.config.buffer.min_utterance_ms {
                        // Nothing worth transcribing arrived in the window.
                        self.buffer.clear();
                        return Ok(None);
                    }
                    // Caller is mid-utterance; let the buffer finish it.
                    deadline_passed = true;
                }
                event = self.control_rx.recv() => match event {
                    Some(ControlEvent::Stop) => return Err(EndCause::StopHint),
                    Some(ControlEvent::Closed) | None => return Err(EndCause::Closed),
                    Some(ControlEvent::Protocol(msg)) => return Err(EndCause::Protocol(msg)),
                    Some(ControlEvent::Start(_)) => {}
                },
                frame = self.frame_rx.recv() => match frame {
                    Some(frame) => {
                        self.last_inbound_at = frame.arrived_at;
                        self.buffer.push(&frame.pcm, frame.arrived_at);
                    }
                    None => return Err(EndCause::Closed),
                },
                _ = tick.tick() => {}
            }
        }
    }

    /// Transcribe a flushed utterance and resolve its language. Returns
    /// `(None, None)` when there was no reply or nothing usable in it.
    async fn transcribe(
        &mut self,
        session: &mut CallSession,
        reply: Option<Utterance>,
    ) -> (Option<String>, Option<Language>) {
        let Some(utterance) = reply else {
            return (None, None);
        };
        let outcome = match self
            .deps
            .asr
            .transcribe(&utterance, Some(session.current_language))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(call_id = %session.call_id, error = %e, "ASR failed");
                return (None, None);
            }
        };
        if outcome.is_empty() {
            return (None, None);
        }
        let language = outcome
            .language
            .unwrap_or_else(|| self.deps.resolver.classify(&outcome.transcript));
        session.log_line(Speaker::Caller, &outcome.transcript);
        debug!(call_id = %session.call_id, transcript = %outcome.transcript, language = %language, "caller said");
        (Some(outcome.transcript), Some(language))
    }

    /// Sleep until `deadline` while keeping the frame and control
    /// channels drained. A `stop` is latched, not acted on, so in-flight
    /// playback can finish.
    async fn sleep_through(&mut self, deadline: Instant) -> Result<(), EndCause> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Err(EndCause::Shutdown),
                () = sleep_until(self.hard_deadline) => return Err(EndCause::HardCap),
                () = sleep_until(deadline) => return Ok(()),
                event = self.control_rx.recv() => match event {
                    Some(ControlEvent::Stop) => {
                        self.stop_latched = true;
                    }
                    Some(ControlEvent::Closed) | None => return Err(EndCause::Closed),
                    Some(ControlEvent::Protocol(msg)) => return Err(EndCause::Protocol(msg)),
                    Some(ControlEvent::Start(_)) => {}
                },
                frame = self.frame_rx.recv() => match frame {
                    Some(frame) => {
                        self.last_inbound_at = frame.arrived_at;
                        self.buffer.push(&frame.pcm, frame.arrived_at);
                    }
                    None => return Err(EndCause::Closed),
                },
            }
        }
    }

    async fn enter(&mut self, session: &mut CallSession, stage: Stage) -> Result<(), EndCause> {
        session
            .transition(stage)
            .map_err(|e| EndCause::Protocol(e.to_string()))?;
        session.last_inbound_at = self.last_inbound_at;
        info!(call_id = %session.call_id, stage = stage.as_str(), "stage");
        self.append_stage(&session.call_id, stage, session.current_language)
            .await;
        Ok(())
    }

    async fn append_stage(&self, call_id: &str, stage: Stage, language: Language) {
        let row = RecordUpdate::Stage {
            call_id: call_id.to_owned(),
            stage: stage.as_str().to_owned(),
            current_language: language,
            at: Utc::now(),
        };
        if let Err(e) = self.deps.records.append(row).await {
            warn!(call_id, error = %e, "stage record append failed");
        }
    }

    /// Final record, store cleanup, terminal transition. Runs on every
    /// exit path that has a session.
    async fn finalize(&mut self, session: &mut CallSession, outcome: CallOutcome) {
        if !session.stage().is_terminal() {
            let _ = session.transition(Stage::End);
        }
        if let Err(e) = self.deps.store.delete(&session.call_id).await {
            warn!(call_id = %session.call_id, error = %e, "session store delete failed");
        }
        let row = RecordUpdate::Final {
            call_id: session.call_id.clone(),
            stage: Stage::End.as_str().to_owned(),
            initial_language: session.initial_language,
            current_language: session.current_language,
            started_at: session.started_at_utc,
            ended_at: Utc::now(),
            outcome,
            summary: session.summary(),
        };
        if let Err(e) = self.deps.records.append(row).await {
            warn!(call_id = %session.call_id, error = %e, "final record append failed");
        }
        info!(call_id = %session.call_id, outcome = %outcome, "call ended");
    }

    /// Final record for calls that died before a session existed.
    async fn finish_without_session(
        &mut self,
        meta: &StartMeta,
        started_at: DateTime<Utc>,
        outcome: CallOutcome,
    ) {
        let _ = self.deps.store.delete(&meta.call_id).await;
        let row = RecordUpdate::Final {
            call_id: meta.call_id.clone(),
            stage: Stage::End.as_str().to_owned(),
            initial_language: Language::English,
            current_language: Language::English,
            started_at,
            ended_at: Utc::now(),
            outcome,
            summary: String::new(),
        };
        if let Err(e) = self.deps.records.append(row).await {
            warn!(call_id = %meta.call_id, error = %e, "final record append failed");
        }
        info!(call_id = %meta.call_id, outcome = %outcome, "call ended");
    }
}

/// Outcome when the call ends from outside the flow's own decisions.
/// A caller who already heard the loan details counts as a completed
/// contact; earlier than that the call failed.
fn outcome_for_early_end(cause: &EndCause, stage: Stage) -> CallOutcome {
    match cause {
        EndCause::HardCap => CallOutcome::Timeout,
        EndCause::Protocol(_) | EndCause::Shutdown => CallOutcome::Failed,
        EndCause::StopHint | EndCause::Closed => match stage {
            Stage::SpeakingEmi1
            | Stage::SpeakingEmi2
            | Stage::SpeakingAgentQuestion
            | Stage::WaitingAgentResponse
            | Stage::Transferring
            | Stage::SpeakingDeclineGoodbye => CallOutcome::Completed,
            _ => CallOutcome::Failed,
        },
    }
}

fn prompt_params(customer: &CustomerSnapshot) -> PromptParams {
    PromptParams {
        name: customer.name.clone(),
        loan_id: customer.loan_id.clone(),
        amount: format_amount(customer.outstanding_amount),
        due_date: customer.due_date.clone(),
    }
}

/// Whole rupees render without a decimal point; paise keep two digits.
fn format_amount(amount: f64) -> String {
    if amount.fract().abs() < f64::EPSILON {
        format!("{amount:.0}")
    } else {
        format!("{amount:.2}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_formatting() {
        assert_eq!(format_amount(45_000.0), "45000");
        assert_eq!(format_amount(1_250.5), "1250.50");
    }

    #[test]
    fn early_end_outcomes() {
        assert_eq!(
            outcome_for_early_end(&EndCause::HardCap, Stage::WaitingAgentResponse),
            CallOutcome::Timeout
        );
        assert_eq!(
            outcome_for_early_end(&EndCause::StopHint, Stage::WaitingConfirmation),
            CallOutcome::Failed
        );
        assert_eq!(
            outcome_for_early_end(&EndCause::StopHint, Stage::WaitingAgentResponse),
            CallOutcome::Completed
        );
        assert_eq!(
            outcome_for_early_end(&EndCause::Protocol("dup".to_owned()), Stage::SpeakingEmi2),
            CallOutcome::Failed
        );
    }
}
