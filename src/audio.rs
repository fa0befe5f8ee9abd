//! PCM helpers for the provider's telephony format.
//!
//! Everything on the wire is 8 kHz 16-bit little-endian mono PCM in
//! 20 ms frames of 320 bytes. This module owns the arithmetic and the
//! WAV container wrapping; envelope encode/decode lives in
//! [`crate::telephony`].

use std::io::Cursor;

use crate::error::{EngineError, Result};

/// Telephony sample rate.
pub const SAMPLE_RATE_HZ: u32 = 8_000;
/// Bytes per sample (16-bit).
pub const BYTES_PER_SAMPLE: usize = 2;
/// One provider frame: 20 ms of audio.
pub const FRAME_MS: u64 = 20;
/// One provider frame in bytes (8 kHz × 16-bit × 20 ms).
pub const FRAME_BYTES: usize = 320;
/// PCM bytes per millisecond at the telephony rate.
pub const BYTES_PER_MS: usize = (SAMPLE_RATE_HZ as usize * BYTES_PER_SAMPLE) / 1_000;

/// Duration of a PCM buffer in milliseconds.
#[must_use]
pub fn duration_ms(pcm: &[u8]) -> u64 {
    (pcm.len() / BYTES_PER_MS) as u64
}

/// Split PCM into provider-sized chunks. Every chunk is exactly
/// [`FRAME_BYTES`] except possibly the last.
#[must_use]
pub fn frames(pcm: &[u8]) -> Vec<&[u8]> {
    pcm.chunks(FRAME_BYTES).collect()
}

/// Wrap raw PCM as a single-channel 8 kHz 16-bit WAV for adapters that
/// require a file container.
pub fn to_wav(pcm: &[u8]) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE_HZ,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| EngineError::ProviderTransport(format!("wav writer: {e}")))?;
        for sample in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
                .map_err(|e| EngineError::ProviderTransport(format!("wav write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| EngineError::ProviderTransport(format!("wav finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}

/// True when the buffer starts with a RIFF/WAVE header.
#[must_use]
pub fn looks_like_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Extract raw 16-bit mono PCM from a WAV container.
///
/// TTS providers sometimes return a container even when asked for raw
/// PCM; the sample data passes through untouched when the container is
/// already 16-bit.
pub fn pcm_from_wav(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| EngineError::TtsFailure(format!("wav parse: {e}")))?;
    let spec = reader.spec();
    if spec.channels != 1 {
        return Err(EngineError::TtsFailure(format!(
            "expected mono audio, got {} channels",
            spec.channels
        )));
    }
    let mut pcm = Vec::with_capacity(reader.len() as usize * BYTES_PER_SAMPLE);
    match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => {
            for sample in reader.samples::<i16>() {
                let s = sample.map_err(|e| EngineError::TtsFailure(format!("wav sample: {e}")))?;
                pcm.extend_from_slice(&s.to_le_bytes());
            }
        }
        (hound::SampleFormat::Float, 32) => {
            for sample in reader.samples::<f32>() {
                let s = sample.map_err(|e| EngineError::TtsFailure(format!("wav sample: {e}")))?;
                let s = (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
                pcm.extend_from_slice(&s.to_le_bytes());
            }
        }
        (format, bits) => {
            return Err(EngineError::TtsFailure(format!(
                "unsupported wav sample format: {format:?}/{bits}"
            )));
        }
    }
    Ok(pcm)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn duration_math() {
        assert_eq!(duration_ms(&[0; FRAME_BYTES]), FRAME_MS);
        assert_eq!(duration_ms(&[0; 16_000]), 1_000);
        assert_eq!(duration_ms(&[]), 0);
    }

    #[test]
    fn frames_are_320_bytes_except_last() {
        let pcm = vec![0u8; FRAME_BYTES * 3 + 100];
        let chunks = frames(&pcm);
        assert_eq!(chunks.len(), 4);
        assert!(chunks[..3].iter().all(|c| c.len() == FRAME_BYTES));
        assert_eq!(chunks[3].len(), 100);
    }

    #[test]
    fn wav_round_trip_preserves_pcm() {
        let pcm: Vec<u8> = (0..640u32).map(|i| (i % 251) as u8).collect();
        let wav = to_wav(&pcm).unwrap();
        assert!(looks_like_wav(&wav));
        let back = pcm_from_wav(&wav).unwrap();
        assert_eq!(back, pcm);
    }

    #[test]
    fn wav_header_sniffing() {
        assert!(!looks_like_wav(b"RIFF"));
        assert!(!looks_like_wav(&[0u8; 64]));
    }

    #[test]
    fn stereo_wav_is_rejected() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE_HZ,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();
        assert!(pcm_from_wav(&cursor.into_inner()).is_err());
    }
}
