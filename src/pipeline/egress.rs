//! Egress task: paced outbound audio.
//!
//! Takes whole playbacks from the dialog and feeds the provider one
//! 20 ms chunk per 20 ms, so the far end hears real-time speech and the
//! provider's jitter buffer stays shallow. After the last chunk of a
//! playback a `mark` envelope names it for the provider's bookkeeping.
//! On cancellation the current chunk still goes out; the rest of the
//! playback is abandoned.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pipeline::messages::PlaybackJob;
use crate::telephony::OutboundEncoder;

pub async fn run_egress(
    mut job_rx: mpsc::Receiver<PlaybackJob>,
    outbound_tx: mpsc::Sender<String>,
    chunk_ms: u64,
    cancel: CancellationToken,
) {
    let mut encoder: Option<OutboundEncoder> = None;
    let chunk_interval = Duration::from_millis(chunk_ms);

    loop {
        let job = tokio::select! {
            () = cancel.cancelled() => break,
            job = job_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let encoder =
            encoder.get_or_insert_with(|| OutboundEncoder::new(job.stream_sid.clone()));
        let envelopes = encoder.encode_stream(&job.pcm);
        let chunks = envelopes.len();
        debug!(mark = %job.mark, chunks, "starting playback");

        let mut interrupted = false;
        for envelope in envelopes {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to serialize media envelope");
                    continue;
                }
            };
            if outbound_tx.send(text).await.is_err() {
                return;
            }
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            tokio::time::sleep(chunk_interval).await;
        }

        if interrupted {
            debug!(mark = %job.mark, "playback interrupted by shutdown");
            break;
        }

        if let Ok(text) = serde_json::to_string(&encoder.mark(&job.mark)) {
            if outbound_tx.send(text).await.is_err() {
                return;
            }
        }
    }
}
