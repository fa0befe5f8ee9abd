//! Message types passed between the per-call tasks.

use tokio::time::Instant;

use crate::telephony::StartMeta;

/// Control events the ingress task raises for the dialog.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// First `start` envelope: the call exists now.
    Start(StartMeta),
    /// Provider says the caller leg ended. Treated as a hint: any
    /// in-flight playback finishes before the call ends.
    Stop,
    /// The WebSocket is gone.
    Closed,
    /// Protocol violation (duplicate `start`, media before `start`).
    Protocol(String),
}

/// One decoded 20 ms frame of caller audio.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub pcm: Vec<u8>,
    pub arrived_at: Instant,
}

/// One finished TTS playback for the egress task to pace out.
#[derive(Debug, Clone)]
pub struct PlaybackJob {
    /// Telephony-rate PCM for the whole prompt.
    pub pcm: Vec<u8>,
    /// Name echoed in the `mark` envelope after the last chunk.
    pub mark: String,
    pub stream_sid: String,
}
