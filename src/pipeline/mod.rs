//! Per-call task composition.
//!
//! Each call runs three cooperating tasks joined by bounded channels:
//! ingress (envelopes → frames/control), dialog (the state machine) and
//! egress (paced outbound chunks). The dialog runs on the caller's
//! future; ingress and egress are spawned and joined on the way out.
//! Tasks never hold references into each other; all coordination is
//! messages and one cancellation token.

pub mod dialog;
pub mod egress;
pub mod ingress;
pub mod messages;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::telephony::Envelope;

pub use dialog::DialogDeps;

/// Channel buffer sizes.
///
/// Frames arrive at 50/s; a 256-slot queue absorbs about five seconds
/// of ASR backlog before ingress starts shedding.
const FRAME_CHANNEL_SIZE: usize = 256;
const CONTROL_CHANNEL_SIZE: usize = 8;
const PLAYBACK_CHANNEL_SIZE: usize = 2;

/// Run one call to completion.
///
/// `envelope_rx` carries parsed provider envelopes from the socket
/// reader; `outbound_tx` takes serialized envelopes for the socket
/// writer. Returns when the dialog reaches a terminal stage or the
/// token is cancelled; IO tasks are joined before returning so the
/// final record is always written before the caller closes the socket.
pub async fn run_call(
    config: Arc<EngineConfig>,
    deps: DialogDeps,
    envelope_rx: mpsc::Receiver<Envelope>,
    outbound_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
    let (playback_tx, playback_rx) = mpsc::channel(PLAYBACK_CHANNEL_SIZE);

    let ingress_handle = tokio::spawn(ingress::run_ingress(
        envelope_rx,
        frame_tx,
        control_tx,
        cancel.clone(),
    ));
    let egress_handle = tokio::spawn(egress::run_egress(
        playback_rx,
        outbound_tx,
        config.tts.chunk_ms,
        cancel.clone(),
    ));

    dialog::run_dialog(config, deps, control_rx, frame_rx, playback_tx, cancel.clone()).await;

    // The dialog dropped its playback sender, so egress drains and
    // exits on its own; cancelling stops ingress from reading a socket
    // nobody is listening to anymore.
    cancel.cancel();
    let _ = tokio::join!(ingress_handle, egress_handle);
}
