//! Error types for the call engine.

/// Top-level error type for the live call session engine.
///
/// Adapters surface these; only the dialog task decides which ones are
/// terminal for a call. Every terminal path still writes a final call
/// record before the socket closes.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed provider traffic: bad base64, wrong frame size, unknown
    /// envelope type. Recoverable: drop the frame and continue.
    #[error("provider transport error: {0}")]
    ProviderTransport(String),

    /// ASR timeout or upstream 5xx. Retried, then treated as an empty
    /// transcript.
    #[error("ASR transient error: {0}")]
    AsrTransient(String),

    /// Utterance below the ASR minimum; discarded without a network call.
    #[error("ASR input too short: {0}")]
    AsrInputTooShort(String),

    /// Intent LLM failure; the lexicon classifier takes over.
    #[error("LLM transient error: {0}")]
    LlmTransient(String),

    /// TTS unavailable after both the streaming and fallback endpoints.
    #[error("TTS failure: {0}")]
    TtsFailure(String),

    /// Provider refused or timed out the bridge request.
    #[error("transfer failure: {0}")]
    TransferFailure(String),

    /// No customer snapshot after the resolve grace period. Terminal.
    #[error("missing customer context: {0}")]
    MissingContext(String),

    /// Call exceeded the hard duration cap. Terminal.
    #[error("call duration cap reached: {0}")]
    TimeoutGlobal(String),

    /// Forbidden state transition, duplicate `start`, media before
    /// `start`. Terminal with outcome `failed`.
    #[error("session protocol violation: {0}")]
    SessionProtocol(String),

    /// Session/record store error (KV service, directory, record sink).
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error between call tasks.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, EngineError>;
