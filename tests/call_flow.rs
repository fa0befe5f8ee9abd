//! End-to-end call flow tests.
//!
//! Each test runs the full per-call pipeline (ingress, dialog, egress)
//! over channels, with deterministic in-memory adapters standing in for
//! the ASR/TTS/intent/transfer/store services. Time is paused, so wait
//! windows and the hard cap elapse instantly and deterministically.
//!
//! The driver plays the provider: it sends `start`, watches outbound
//! `mark` envelopes to know when a prompt finished, and answers with
//! scripted caller audio per stage.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vaani::asr::{AsrOutcome, SpeechToText};
use vaani::buffer::Utterance;
use vaani::config::{EngineConfig, UnclearPolicy};
use vaani::error::Result;
use vaani::intent::IntentClassifier;
use vaani::language::{Language, LanguageResolver};
use vaani::pipeline::{DialogDeps, run_call};
use vaani::records::{CallOutcome, RecordSink, RecordUpdate};
use vaani::store::{ContextStore, CustomerSnapshot, MemoryContextStore};
use vaani::telephony::{Envelope, MediaFrame, StartMeta, parse_envelope};
use vaani::transfer::{CallBridge, TransferOutcome};
use vaani::tts::TextToSpeech;

const FRAME_BYTES: usize = 320;
/// FakeTts produces half a second of audio per prompt.
const PROMPT_AUDIO_BYTES: usize = 8_000;

// ── Fakes ─────────────────────────────────────────────────────

/// Pops one scripted transcript per transcription request.
struct FakeAsr {
    replies: Mutex<VecDeque<(String, Option<Language>)>>,
}

impl FakeAsr {
    fn scripted<I: IntoIterator<Item = (&'static str, Option<Language>)>>(replies: I) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|(t, l)| (t.to_owned(), l))
                    .collect(),
            ),
        })
    }
}

#[async_trait]
impl SpeechToText for FakeAsr {
    async fn transcribe(
        &self,
        _utterance: &Utterance,
        _hint: Option<Language>,
    ) -> Result<AsrOutcome> {
        let next = self.replies.lock().unwrap().pop_front();
        Ok(match next {
            Some((transcript, language)) => AsrOutcome {
                transcript,
                language,
            },
            None => AsrOutcome::default(),
        })
    }
}

struct FakeTts;

#[async_trait]
impl TextToSpeech for FakeTts {
    async fn synthesize(&self, _text: &str, _language: Language) -> Result<Vec<u8>> {
        Ok(vec![0u8; PROMPT_AUDIO_BYTES])
    }
}

struct FakeBridge {
    succeed: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeBridge {
    fn new(succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            succeed,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CallBridge for FakeBridge {
    async fn transfer(&self, call_id: &str, _agent_number: &str) -> Result<TransferOutcome> {
        self.calls.lock().unwrap().push(call_id.to_owned());
        Ok(if self.succeed {
            TransferOutcome::Success {
                provider_ref: Some("REF1".to_owned()),
            }
        } else {
            TransferOutcome::Failure {
                reason: "refused".to_owned(),
            }
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    rows: Mutex<Vec<RecordUpdate>>,
}

impl RecordingSink {
    fn stages(&self) -> Vec<String> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter_map(|row| match row {
                RecordUpdate::Stage { stage, .. } => Some(stage.clone()),
                RecordUpdate::Final { .. } => None,
            })
            .collect()
    }

    fn final_row(&self) -> Option<(CallOutcome, Language, Language, String)> {
        self.rows.lock().unwrap().iter().find_map(|row| match row {
            RecordUpdate::Final {
                outcome,
                initial_language,
                current_language,
                summary,
                ..
            } => Some((*outcome, *initial_language, *current_language, summary.clone())),
            RecordUpdate::Stage { .. } => None,
        })
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn append(&self, update: RecordUpdate) -> Result<()> {
        self.rows.lock().unwrap().push(update);
        Ok(())
    }
}

// ── Harness ───────────────────────────────────────────────────

fn customer() -> CustomerSnapshot {
    CustomerSnapshot {
        name: "Rajesh".to_owned(),
        phone: "+919900112233".to_owned(),
        state: "Uttar Pradesh".to_owned(),
        loan_id: "LOAN123".to_owned(),
        outstanding_amount: 45_000.0,
        due_date: "2025-11-20".to_owned(),
        preferred_language: None,
    }
}

fn start_envelope(call_id: &str) -> Envelope {
    Envelope::Start {
        stream_sid: "MZ1".to_owned(),
        start: StartMeta {
            call_id: call_id.to_owned(),
            stream_sid: "MZ1".to_owned(),
            custom_parameters: HashMap::new(),
        },
    }
}

fn media_envelope() -> Envelope {
    Envelope::Media {
        stream_sid: "MZ1".to_owned(),
        media: MediaFrame {
            payload: BASE64.encode(vec![3u8; FRAME_BYTES]),
            ..Default::default()
        },
    }
}

/// 1.5 s of caller audio as provider envelopes.
fn caller_reply() -> Vec<Envelope> {
    (0..75).map(|_| media_envelope()).collect()
}

struct Services {
    asr: Arc<FakeAsr>,
    bridge: Arc<FakeBridge>,
    records: Arc<RecordingSink>,
    store: Arc<MemoryContextStore>,
}

fn build_deps(config: &EngineConfig, services: &Services) -> DialogDeps {
    DialogDeps {
        asr: services.asr.clone(),
        tts: Arc::new(FakeTts),
        intent: Arc::new(IntentClassifier::lexicon_only()),
        bridge: services.bridge.clone(),
        store: services.store.clone(),
        directory: None,
        records: services.records.clone(),
        resolver: Arc::new(LanguageResolver::new(&config.language.default_state_map)),
    }
}

/// Run a full call. `replies` maps a speaking-stage name to queued
/// caller responses played after that prompt's `mark`; stages without a
/// queued reply stay silent. Returns every outbound envelope.
async fn run_scripted_call(
    config: EngineConfig,
    services: &Services,
    opening: Vec<Envelope>,
    replies: HashMap<&'static str, VecDeque<Vec<Envelope>>>,
) -> Vec<Envelope> {
    let config = Arc::new(config);
    let deps = build_deps(&config, services);

    let (env_tx, env_rx) = mpsc::channel(1024);
    let (out_tx, mut out_rx) = mpsc::channel(4096);
    let cancel = CancellationToken::new();

    let call = tokio::spawn(run_call(config, deps, env_rx, out_tx, cancel));

    for envelope in opening {
        env_tx.send(envelope).await.unwrap();
    }

    // Provider side: watch marks, answer with scripted audio.
    let driver = tokio::spawn(async move {
        let mut replies = replies;
        let mut outbound = Vec::new();
        while let Some(text) = out_rx.recv().await {
            let envelope = parse_envelope(&text).unwrap();
            if let Envelope::Mark { mark, .. } = &envelope {
                let stage = mark
                    .name
                    .rsplit_once('-')
                    .map_or(mark.name.clone(), |(s, _)| s.to_owned());
                if let Some(queue) = replies.get_mut(stage.as_str())
                    && let Some(reply) = queue.pop_front()
                {
                    // Let the processing tail pass so the dialog is
                    // listening again before the caller speaks.
                    tokio::time::sleep(Duration::from_millis(800)).await;
                    for envelope in reply {
                        if env_tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                }
            }
            outbound.push(envelope);
        }
        outbound
    });

    call.await.unwrap();
    driver.await.unwrap()
}

fn replies(
    entries: Vec<(&'static str, Vec<Vec<Envelope>>)>,
) -> HashMap<&'static str, VecDeque<Vec<Envelope>>> {
    entries
        .into_iter()
        .map(|(stage, queue)| (stage, queue.into_iter().collect()))
        .collect()
}

async fn seeded_services(asr: Arc<FakeAsr>, bridge_succeeds: bool) -> Services {
    let store = Arc::new(MemoryContextStore::new());
    store
        .put("CA1", &customer(), Duration::from_secs(3600))
        .await
        .unwrap();
    Services {
        asr,
        bridge: FakeBridge::new(bridge_succeeds),
        records: Arc::new(RecordingSink::default()),
        store,
    }
}

// ── Scenarios ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn happy_path_matched_language_transfers() {
    let asr = FakeAsr::scripted([
        ("हाँ जी", Some(Language::Hindi)),
        ("जी हाँ", Some(Language::Hindi)),
    ]);
    let services = seeded_services(asr, true).await;

    let outbound = run_scripted_call(
        EngineConfig::default(),
        &services,
        vec![start_envelope("CA1")],
        replies(vec![
            ("speaking_greeting", vec![caller_reply()]),
            ("speaking_agent_question", vec![caller_reply()]),
        ]),
    )
    .await;

    assert_eq!(
        services.records.stages(),
        vec![
            "await_start",
            "resolve_context",
            "speaking_greeting",
            "waiting_confirmation",
            "speaking_emi_1",
            "speaking_emi_2",
            "speaking_agent_question",
            "waiting_agent_response",
            "transferring",
        ]
    );
    let (outcome, initial, current, summary) = services.records.final_row().unwrap();
    assert_eq!(outcome, CallOutcome::Transferred);
    assert_eq!(initial, Language::Hindi);
    assert_eq!(current, Language::Hindi);
    assert!(summary.contains("caller(hi): हाँ जी"));
    assert_eq!(services.bridge.calls.lock().unwrap().as_slice(), ["CA1"]);

    // Outbound media chunks are provider-sized.
    for envelope in &outbound {
        if let Envelope::Media { media, .. } = envelope {
            let pcm = BASE64.decode(&media.payload).unwrap();
            assert!(pcm.len() <= FRAME_BYTES);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn language_switch_regreets_once() {
    let asr = FakeAsr::scripted([("Yes", None), ("Yes", None), ("Yes", None)]);
    let services = seeded_services(asr, true).await;

    run_scripted_call(
        EngineConfig::default(),
        &services,
        vec![start_envelope("CA1")],
        replies(vec![
            ("speaking_greeting", vec![caller_reply()]),
            ("speaking_regreeting", vec![caller_reply()]),
            ("speaking_agent_question", vec![caller_reply()]),
        ]),
    )
    .await;

    let stages = services.records.stages();
    assert_eq!(
        stages,
        vec![
            "await_start",
            "resolve_context",
            "speaking_greeting",
            "waiting_confirmation",
            "speaking_regreeting",
            "waiting_confirmation",
            "speaking_emi_1",
            "speaking_emi_2",
            "speaking_agent_question",
            "waiting_agent_response",
            "transferring",
        ]
    );
    let (outcome, initial, current, _) = services.records.final_row().unwrap();
    assert_eq!(outcome, CallOutcome::Transferred);
    assert_eq!(initial, Language::Hindi);
    assert_eq!(current, Language::English);
    assert_eq!(
        stages.iter().filter(|s| *s == "speaking_regreeting").count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn repeated_unclear_agent_response_auto_transfers() {
    let asr = FakeAsr::scripted([
        ("हाँ जी", Some(Language::Hindi)),
        ("Umm well you know", Some(Language::English)),
    ]);
    let services = seeded_services(asr, true).await;

    run_scripted_call(
        EngineConfig::default(),
        &services,
        vec![start_envelope("CA1")],
        replies(vec![
            ("speaking_greeting", vec![caller_reply()]),
            // One mumbled answer, then silence for both re-prompts.
            ("speaking_agent_question", vec![caller_reply()]),
        ]),
    )
    .await;

    let stages = services.records.stages();
    assert_eq!(
        stages
            .iter()
            .filter(|s| *s == "speaking_agent_question")
            .count(),
        3,
        "one question plus two re-prompts"
    );
    let (outcome, ..) = services.records.final_row().unwrap();
    assert_eq!(outcome, CallOutcome::Transferred);
    assert_eq!(services.bridge.calls.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_unclear_with_goodbye_policy_declines() {
    let asr = FakeAsr::scripted([("हाँ जी", Some(Language::Hindi))]);
    let services = seeded_services(asr, true).await;
    let mut config = EngineConfig::default();
    config.transfer.on_repeated_unclear = UnclearPolicy::Goodbye;

    run_scripted_call(
        config,
        &services,
        vec![start_envelope("CA1")],
        replies(vec![("speaking_greeting", vec![caller_reply()])]),
    )
    .await;

    let (outcome, ..) = services.records.final_row().unwrap();
    assert_eq!(outcome, CallOutcome::Declined);
    assert!(services.bridge.calls.lock().unwrap().is_empty());
    assert!(
        services
            .records
            .stages()
            .contains(&"speaking_decline_goodbye".to_owned())
    );
}

#[tokio::test(start_paused = true)]
async fn decline_after_loan_details_says_goodbye() {
    let asr = FakeAsr::scripted([
        ("हाँ जी", Some(Language::Hindi)),
        ("No, not now", Some(Language::English)),
    ]);
    let services = seeded_services(asr, true).await;

    run_scripted_call(
        EngineConfig::default(),
        &services,
        vec![start_envelope("CA1")],
        replies(vec![
            ("speaking_greeting", vec![caller_reply()]),
            ("speaking_agent_question", vec![caller_reply()]),
        ]),
    )
    .await;

    let stages = services.records.stages();
    assert!(stages.contains(&"speaking_emi_1".to_owned()));
    assert_eq!(stages.last().unwrap(), "speaking_decline_goodbye");
    let (outcome, ..) = services.records.final_row().unwrap();
    assert_eq!(outcome, CallOutcome::Declined);
    assert!(services.bridge.calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_context_ends_without_speaking() {
    let services = Services {
        asr: FakeAsr::scripted([]),
        bridge: FakeBridge::new(true),
        records: Arc::new(RecordingSink::default()),
        store: Arc::new(MemoryContextStore::new()),
    };

    let outbound = run_scripted_call(
        EngineConfig::default(),
        &services,
        vec![start_envelope("CA404")],
        HashMap::new(),
    )
    .await;

    assert_eq!(services.records.stages(), vec!["await_start", "resolve_context"]);
    let (outcome, ..) = services.records.final_row().unwrap();
    assert_eq!(outcome, CallOutcome::MissingContext);
    assert!(
        !outbound
            .iter()
            .any(|e| matches!(e, Envelope::Media { .. })),
        "no TTS plays without customer context"
    );
}

#[tokio::test(start_paused = true)]
async fn hard_cap_times_out_in_agent_wait() {
    let asr = FakeAsr::scripted([("हाँ जी", Some(Language::Hindi))]);
    let services = seeded_services(asr, true).await;
    let mut config = EngineConfig::default();
    // Cap fires while the agent-response window is still open.
    config.call.max_duration_s = 10;

    run_scripted_call(
        config,
        &services,
        vec![start_envelope("CA1")],
        replies(vec![("speaking_greeting", vec![caller_reply()])]),
    )
    .await;

    let stages = services.records.stages();
    assert_eq!(stages.last().unwrap(), "waiting_agent_response");
    let (outcome, ..) = services.records.final_row().unwrap();
    assert_eq!(outcome, CallOutcome::Timeout);
}

// ── Edge behaviors beyond the seed scenarios ──────────────────

#[tokio::test(start_paused = true)]
async fn silent_confirmation_reprompts_then_declines() {
    let asr = FakeAsr::scripted([]);
    let services = seeded_services(asr, true).await;

    run_scripted_call(
        EngineConfig::default(),
        &services,
        vec![start_envelope("CA1")],
        HashMap::new(),
    )
    .await;

    let stages = services.records.stages();
    assert_eq!(
        stages
            .iter()
            .filter(|s| *s == "speaking_greeting")
            .count(),
        3,
        "greeting plus two re-prompts"
    );
    assert_eq!(stages.last().unwrap(), "speaking_decline_goodbye");
    let (outcome, ..) = services.records.final_row().unwrap();
    assert_eq!(outcome, CallOutcome::Declined);
}

#[tokio::test(start_paused = true)]
async fn transfer_failure_detours_through_goodbye() {
    let asr = FakeAsr::scripted([
        ("हाँ जी", Some(Language::Hindi)),
        ("जी हाँ", Some(Language::Hindi)),
    ]);
    let services = seeded_services(asr, false).await;

    run_scripted_call(
        EngineConfig::default(),
        &services,
        vec![start_envelope("CA1")],
        replies(vec![
            ("speaking_greeting", vec![caller_reply()]),
            ("speaking_agent_question", vec![caller_reply()]),
        ]),
    )
    .await;

    let stages = services.records.stages();
    assert!(stages.contains(&"transferring".to_owned()));
    assert_eq!(stages.last().unwrap(), "speaking_decline_goodbye");
    let (outcome, ..) = services.records.final_row().unwrap();
    assert_eq!(outcome, CallOutcome::Failed);
}

#[tokio::test(start_paused = true)]
async fn stop_during_greeting_finishes_playback_then_ends() {
    let asr = FakeAsr::scripted([]);
    let services = seeded_services(asr, true).await;

    let mut opening = vec![start_envelope("CA1")];
    opening.push(Envelope::Stop {
        stream_sid: "MZ1".to_owned(),
    });

    let outbound = run_scripted_call(
        EngineConfig::default(),
        &services,
        opening,
        HashMap::new(),
    )
    .await;

    // The greeting playback completed: its mark went out.
    assert!(
        outbound
            .iter()
            .any(|e| matches!(e, Envelope::Mark { mark, .. } if mark.name.starts_with("speaking_greeting"))),
        "in-flight playback finishes after stop"
    );
    let stages = services.records.stages();
    assert_eq!(stages.last().unwrap(), "speaking_greeting");
    let (outcome, ..) = services.records.final_row().unwrap();
    assert_eq!(outcome, CallOutcome::Failed);
}

#[tokio::test(start_paused = true)]
async fn custom_parameters_fallback_resolves_context() {
    let services = Services {
        asr: FakeAsr::scripted([]),
        bridge: FakeBridge::new(true),
        records: Arc::new(RecordingSink::default()),
        // Store has nothing; the start envelope carries the snapshot.
        store: Arc::new(MemoryContextStore::new()),
    };

    let mut params = HashMap::new();
    params.insert(
        "customer".to_owned(),
        "name=Rajesh|phone=+919900112233|loan_id=LOAN123|amount=45000|due_date=2025-11-20|state=Tamil Nadu"
            .to_owned(),
    );
    let start = Envelope::Start {
        stream_sid: "MZ1".to_owned(),
        start: StartMeta {
            call_id: "CA2".to_owned(),
            stream_sid: "MZ1".to_owned(),
            custom_parameters: params,
        },
    };

    run_scripted_call(EngineConfig::default(), &services, vec![start], HashMap::new()).await;

    let stages = services.records.stages();
    assert!(stages.contains(&"speaking_greeting".to_owned()));
    let (_, initial, ..) = services.records.final_row().unwrap();
    assert_eq!(initial, Language::Tamil);
}

#[tokio::test(start_paused = true)]
async fn duplicate_start_fails_the_call() {
    let asr = FakeAsr::scripted([]);
    let services = seeded_services(asr, true).await;

    run_scripted_call(
        EngineConfig::default(),
        &services,
        vec![start_envelope("CA1"), start_envelope("CA1")],
        HashMap::new(),
    )
    .await;

    let (outcome, ..) = services.records.final_row().unwrap();
    assert_eq!(outcome, CallOutcome::Failed);
}
