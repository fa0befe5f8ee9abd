//! Provider media-stream envelopes and the frame codec.
//!
//! The telephony provider speaks JSON over the media WebSocket: a
//! `connected` handshake, one `start` carrying the call id and stream
//! id, a stream of `media` envelopes holding base64 PCM frames, and a
//! `stop` when the caller leg ends. Outbound audio goes back as `media`
//! envelopes with a monotonic chunk index and timestamp, terminated by a
//! `mark` naming the finished playback.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::audio::{FRAME_BYTES, FRAME_MS};
use crate::error::{EngineError, Result};

/// A provider media-stream envelope, inbound or outbound.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Envelope {
    /// Transport-level handshake; carries nothing the engine needs.
    Connected,
    /// Stream opened: call id, stream id, and free-form parameters the
    /// dial-out path may have attached.
    Start {
        #[serde(default)]
        stream_sid: String,
        start: StartMeta,
    },
    /// One 20 ms frame of caller audio (inbound) or bot audio (outbound).
    Media {
        #[serde(default)]
        stream_sid: String,
        media: MediaFrame,
    },
    /// Caller leg ended.
    Stop {
        #[serde(default)]
        stream_sid: String,
    },
    /// Playback delimiter echoed around a completed utterance.
    Mark {
        #[serde(default)]
        stream_sid: String,
        mark: MarkInfo,
    },
}

/// Payload of the `start` envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartMeta {
    /// Provider-assigned call identifier; the session key everywhere.
    pub call_id: String,
    #[serde(default)]
    pub stream_sid: String,
    /// Free-form key/value parameters from the dial-out request. May
    /// carry a pipe-separated customer snapshot as a store fallback.
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

/// Payload of a `media` envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaFrame {
    /// Base64-encoded 8 kHz 16-bit mono PCM, 320 bytes per frame.
    pub payload: String,
    /// Outbound only: which direction this frame belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    /// Outbound only: monotonic chunk index within the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<u64>,
    /// Outbound only: cumulative milliseconds of audio emitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
}

/// Payload of a `mark` envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkInfo {
    pub name: String,
}

/// Parse one WebSocket text message into an envelope.
pub fn parse_envelope(text: &str) -> Result<Envelope> {
    serde_json::from_str(text)
        .map_err(|e| EngineError::ProviderTransport(format!("bad envelope: {e}")))
}

/// Decode the PCM bytes of an inbound `media` frame.
///
/// Frames must decode to exactly [`FRAME_BYTES`] bytes; anything else is
/// a transport error the caller logs and drops.
pub fn decode_media(frame: &MediaFrame) -> Result<Vec<u8>> {
    let pcm = BASE64
        .decode(&frame.payload)
        .map_err(|e| EngineError::ProviderTransport(format!("bad media base64: {e}")))?;
    if pcm.len() != FRAME_BYTES {
        return Err(EngineError::ProviderTransport(format!(
            "unexpected frame size: {} bytes",
            pcm.len()
        )));
    }
    Ok(pcm)
}

/// Formats outbound PCM as `media` envelopes with a per-call monotonic
/// chunk index and running timestamp. Pacing is the egress task's job;
/// the encoder only formats.
#[derive(Debug)]
pub struct OutboundEncoder {
    stream_sid: String,
    chunk: u64,
    timestamp_ms: u64,
}

impl OutboundEncoder {
    #[must_use]
    pub fn new(stream_sid: impl Into<String>) -> Self {
        Self {
            stream_sid: stream_sid.into(),
            chunk: 0,
            timestamp_ms: 0,
        }
    }

    /// Split PCM into ≤ 320-byte chunks, each wrapped as an outbound
    /// `media` envelope.
    #[must_use]
    pub fn encode_stream(&mut self, pcm: &[u8]) -> Vec<Envelope> {
        crate::audio::frames(pcm)
            .into_iter()
            .map(|frame| self.encode_frame(frame))
            .collect()
    }

    fn encode_frame(&mut self, frame: &[u8]) -> Envelope {
        let envelope = Envelope::Media {
            stream_sid: self.stream_sid.clone(),
            media: MediaFrame {
                payload: BASE64.encode(frame),
                track: Some("outbound".to_owned()),
                chunk: Some(self.chunk),
                timestamp_ms: Some(self.timestamp_ms),
            },
        };
        self.chunk += 1;
        // Partial final chunks still advance by a whole frame interval:
        // the provider pads them to 20 ms on playout.
        self.timestamp_ms += FRAME_MS;
        envelope
    }

    /// A `mark` envelope delineating a completed playback.
    #[must_use]
    pub fn mark(&self, name: impl Into<String>) -> Envelope {
        Envelope::Mark {
            stream_sid: self.stream_sid.clone(),
            mark: MarkInfo { name: name.into() },
        }
    }
}
