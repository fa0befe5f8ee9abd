//! Utterance accumulation.
//!
//! Inbound frames pile up here until the caller has plausibly finished a
//! thought. There is no voice-activity detection on the samples: typical
//! telephony trunks stop sending `media` envelopes between utterances,
//! so silence is approximated by inter-arrival gaps. ASR providers
//! charge per call and do badly on fragments; batching buys both
//! quality and cost.

use tokio::time::Instant;

use crate::audio;
use crate::config::BufferConfig;

/// A complete span of caller audio, ready for ASR.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Raw 8 kHz 16-bit mono PCM.
    pub pcm: Vec<u8>,
    /// Audio duration derived from the byte length.
    pub duration_ms: u64,
    /// Arrival time of the first frame.
    pub started_at: Instant,
}

/// Why the buffer flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Minimum duration met and the quiet window elapsed.
    QuietWindow,
    /// Buffered duration hit the hard cap; flushed mid-speech.
    HardCap,
}

/// Accumulates inbound PCM frames for one call.
#[derive(Debug)]
pub struct UtteranceBuffer {
    min_utterance_ms: u64,
    quiet_window_ms: u64,
    hard_cap_ms: u64,
    pcm: Vec<u8>,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
}

impl UtteranceBuffer {
    #[must_use]
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            min_utterance_ms: config.min_utterance_ms,
            quiet_window_ms: config.quiet_window_ms,
            hard_cap_ms: config.hard_cap_ms,
            pcm: Vec::new(),
            first_at: None,
            last_at: None,
        }
    }

    /// Append one frame tagged with its arrival time.
    pub fn push(&mut self, frame: &[u8], now: Instant) {
        if self.pcm.is_empty() {
            self.first_at = Some(now);
        }
        self.pcm.extend_from_slice(frame);
        self.last_at = Some(now);
    }

    /// Buffered audio duration in milliseconds.
    #[must_use]
    pub fn buffered_ms(&self) -> u64 {
        audio::duration_ms(&self.pcm)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }

    /// Check flush conditions and take the utterance if one is ready.
    ///
    /// Flushes when the buffer holds at least the minimum duration and
    /// no frame has arrived for a full quiet window, or unconditionally
    /// once the hard cap is reached.
    pub fn poll_flush(&mut self, now: Instant) -> Option<(Utterance, FlushReason)> {
        let last_at = self.last_at?;
        let buffered = self.buffered_ms();

        if buffered >= self.hard_cap_ms {
            return Some((self.take(), FlushReason::HardCap));
        }
        let quiet_ms = now.saturating_duration_since(last_at).as_millis() as u64;
        if buffered >= self.min_utterance_ms && quiet_ms >= self.quiet_window_ms {
            return Some((self.take(), FlushReason::QuietWindow));
        }
        None
    }

    /// Drop everything buffered so far.
    pub fn clear(&mut self) {
        self.pcm.clear();
        self.first_at = None;
        self.last_at = None;
    }

    fn take(&mut self) -> Utterance {
        let utterance = Utterance {
            duration_ms: self.buffered_ms(),
            pcm: std::mem::take(&mut self.pcm),
            started_at: self.first_at.unwrap_or_else(Instant::now),
        };
        self.first_at = None;
        self.last_at = None;
        utterance
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::audio::FRAME_BYTES;
    use std::time::Duration;

    fn config() -> BufferConfig {
        BufferConfig::default()
    }

    fn push_audio(buffer: &mut UtteranceBuffer, ms: u64, start: Instant) -> Instant {
        let mut at = start;
        for _ in 0..ms / 20 {
            buffer.push(&[0u8; FRAME_BYTES], at);
            at += Duration::from_millis(20);
        }
        at
    }

    #[tokio::test]
    async fn no_flush_below_minimum_duration() {
        let mut buffer = UtteranceBuffer::new(&config());
        let start = Instant::now();
        // One 20 ms frame, then a long gap: still too short to submit.
        buffer.push(&[0u8; FRAME_BYTES], start);
        assert!(buffer.poll_flush(start + Duration::from_secs(5)).is_none());
    }

    #[tokio::test]
    async fn flushes_after_quiet_window() {
        let mut buffer = UtteranceBuffer::new(&config());
        let start = Instant::now();
        let last = push_audio(&mut buffer, 1_000, start);

        // Quiet window not yet elapsed.
        assert!(buffer.poll_flush(last + Duration::from_millis(400)).is_none());

        let (utterance, reason) = buffer.poll_flush(last + Duration::from_millis(600)).unwrap();
        assert_eq!(reason, FlushReason::QuietWindow);
        assert_eq!(utterance.duration_ms, 1_000);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn exactly_minimum_duration_passes() {
        let cfg = config();
        let mut buffer = UtteranceBuffer::new(&cfg);
        let start = Instant::now();
        let last = push_audio(&mut buffer, cfg.min_utterance_ms, start);
        let flushed = buffer.poll_flush(last + Duration::from_millis(cfg.quiet_window_ms));
        assert!(flushed.is_some());
    }

    #[tokio::test]
    async fn hard_cap_flushes_mid_speech() {
        let cfg = config();
        let mut buffer = UtteranceBuffer::new(&cfg);
        let start = Instant::now();
        let last = push_audio(&mut buffer, cfg.hard_cap_ms, start);

        // No quiet gap at all, flushed anyway.
        let (utterance, reason) = buffer.poll_flush(last).unwrap();
        assert_eq!(reason, FlushReason::HardCap);
        assert_eq!(utterance.duration_ms, cfg.hard_cap_ms);
    }

    #[tokio::test]
    async fn clear_discards_audio() {
        let mut buffer = UtteranceBuffer::new(&config());
        let start = Instant::now();
        push_audio(&mut buffer, 2_000, start);
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.poll_flush(start + Duration::from_secs(10)).is_none());
    }

    #[tokio::test]
    async fn second_utterance_starts_fresh() {
        let mut buffer = UtteranceBuffer::new(&config());
        let start = Instant::now();
        let last = push_audio(&mut buffer, 1_000, start);
        let _ = buffer.poll_flush(last + Duration::from_secs(1)).unwrap();

        let start2 = last + Duration::from_secs(2);
        let last2 = push_audio(&mut buffer, 1_200, start2);
        let (utterance, _) = buffer.poll_flush(last2 + Duration::from_secs(1)).unwrap();
        assert_eq!(utterance.duration_ms, 1_200);
        assert_eq!(utterance.started_at, start2);
    }
}
