//! Ingress task: provider envelopes in, frames and control events out.
//!
//! Reads the already-parsed envelope stream, decodes media frames, and
//! signals `start`/`stop`/close to the dialog. Malformed frames are
//! dropped with a warning; protocol violations are reported to the
//! dialog, which decides terminality.

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pipeline::messages::{ControlEvent, InboundFrame};
use crate::telephony::{self, Envelope};

pub async fn run_ingress(
    mut envelope_rx: mpsc::Receiver<Envelope>,
    frame_tx: mpsc::Sender<InboundFrame>,
    control_tx: mpsc::Sender<ControlEvent>,
    cancel: CancellationToken,
) {
    let mut started = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            envelope = envelope_rx.recv() => {
                let Some(envelope) = envelope else {
                    let _ = control_tx.send(ControlEvent::Closed).await;
                    break;
                };
                match envelope {
                    Envelope::Connected => {
                        debug!("provider handshake received");
                    }
                    Envelope::Start { start, stream_sid } => {
                        if started {
                            let _ = control_tx
                                .send(ControlEvent::Protocol("duplicate start".to_owned()))
                                .await;
                            continue;
                        }
                        started = true;
                        let mut meta = start;
                        if meta.stream_sid.is_empty() {
                            meta.stream_sid = stream_sid;
                        }
                        if control_tx.send(ControlEvent::Start(meta)).await.is_err() {
                            break;
                        }
                    }
                    Envelope::Media { media, .. } => {
                        if !started {
                            let _ = control_tx
                                .send(ControlEvent::Protocol("media before start".to_owned()))
                                .await;
                            continue;
                        }
                        match telephony::decode_media(&media) {
                            Ok(pcm) => {
                                let frame = InboundFrame {
                                    pcm,
                                    arrived_at: Instant::now(),
                                };
                                // Never block the socket reader on a slow
                                // consumer; a dropped frame degrades one
                                // utterance, a blocked reader stalls the call.
                                if frame_tx.try_send(frame).is_err() {
                                    warn!("inbound frame queue full, dropping frame");
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "dropping malformed media frame");
                            }
                        }
                    }
                    Envelope::Stop { .. } => {
                        if control_tx.send(ControlEvent::Stop).await.is_err() {
                            break;
                        }
                    }
                    Envelope::Mark { mark, .. } => {
                        debug!(name = %mark.name, "provider acknowledged mark");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::audio::FRAME_BYTES;
    use crate::telephony::{MediaFrame, StartMeta};
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;

    fn media(len: usize) -> Envelope {
        Envelope::Media {
            stream_sid: "MZ1".to_owned(),
            media: MediaFrame {
                payload: BASE64.encode(vec![1u8; len]),
                ..Default::default()
            },
        }
    }

    fn start() -> Envelope {
        Envelope::Start {
            stream_sid: "MZ1".to_owned(),
            start: StartMeta {
                call_id: "CA1".to_owned(),
                stream_sid: String::new(),
                custom_parameters: Default::default(),
            },
        }
    }

    async fn run(envelopes: Vec<Envelope>) -> (Vec<ControlEvent>, usize) {
        let (env_tx, env_rx) = mpsc::channel(16);
        let (frame_tx, mut frame_rx) = mpsc::channel(16);
        let (control_tx, mut control_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        for envelope in envelopes {
            env_tx.send(envelope).await.unwrap();
        }
        drop(env_tx);
        run_ingress(env_rx, frame_tx, control_tx, cancel).await;

        let mut events = Vec::new();
        while let Ok(event) = control_rx.try_recv() {
            events.push(event);
        }
        let mut frames = 0;
        while frame_rx.try_recv().is_ok() {
            frames += 1;
        }
        (events, frames)
    }

    #[tokio::test]
    async fn start_then_media_then_stop() {
        let (events, frames) = run(vec![
            Envelope::Connected,
            start(),
            media(FRAME_BYTES),
            media(FRAME_BYTES),
            Envelope::Stop {
                stream_sid: "MZ1".to_owned(),
            },
        ])
        .await;

        assert!(matches!(events[0], ControlEvent::Start(ref m) if m.call_id == "CA1"));
        assert!(matches!(events[1], ControlEvent::Stop));
        assert!(matches!(events[2], ControlEvent::Closed));
        assert_eq!(frames, 2);
    }

    #[tokio::test]
    async fn start_envelope_stream_sid_fallback() {
        let (events, _) = run(vec![start()]).await;
        assert!(matches!(events[0], ControlEvent::Start(ref m) if m.stream_sid == "MZ1"));
    }

    #[tokio::test]
    async fn duplicate_start_is_a_protocol_event() {
        let (events, _) = run(vec![start(), start()]).await;
        assert!(matches!(events[1], ControlEvent::Protocol(_)));
    }

    #[tokio::test]
    async fn media_before_start_is_a_protocol_event() {
        let (events, frames) = run(vec![media(FRAME_BYTES)]).await;
        assert!(matches!(events[0], ControlEvent::Protocol(_)));
        assert_eq!(frames, 0);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_quietly() {
        let (events, frames) = run(vec![start(), media(100), media(FRAME_BYTES)]).await;
        assert!(matches!(events[0], ControlEvent::Start(_)));
        assert!(matches!(events[1], ControlEvent::Closed));
        assert_eq!(frames, 1);
    }
}
