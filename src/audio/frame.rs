//! # Audio Frames and Wire Encoding
//!
//! Data types that travel through the voice core, and the codec between them:
//!
//! ```text
//! capture ──AudioFrame──▶ encode ──EncodedChunk──▶ session
//! session ──InboundAudioPayload──▶ decode ──PcmBuffer──▶ scheduler
//! ```
//!
//! ## Wire Format (both directions):
//! - **Samples**: 16-bit signed PCM, little-endian, interleaved
//! - **Transport**: standard base64 text inside JSON messages
//! - **Tag**: `audio/pcm;rate=<hz>`
//!
//! Capture produces 16 kHz mono frames; the remote side answers with 24 kHz mono.

use crate::error::{VoiceError, VoiceResult};
use base64::Engine as _;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// One fixed-size slice of captured microphone audio.
///
/// Fields are private so a frame cannot change after it is produced;
/// `EncodedChunk::encode` consumes it, so it is encoded exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

/// One captured frame in the wire encoding the remote session expects.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    /// Declared content type, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
    /// Base64 of little-endian PCM16 samples
    pub data: String,
}

impl EncodedChunk {
    /// Encode a frame for upload.
    ///
    /// ## Conversion:
    /// Float samples in [-1.0, 1.0] are scaled to the i16 range and clamped,
    /// so out-of-range input saturates instead of wrapping around.
    pub fn encode(frame: AudioFrame) -> Self {
        let pcm = float_to_pcm16_le(&frame.samples);
        Self {
            mime_type: pcm_mime_type(frame.sample_rate),
            data: base64::engine::general_purpose::STANDARD.encode(pcm),
        }
    }
}

/// An encoded audio payload received from the remote session.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundAudioPayload {
    pub mime_type: String,
    pub data: String,
}

/// Decoded PCM audio ready to be placed on the output timeline.
///
/// Samples are interleaved floats in [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self { samples, sample_rate, channels }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Re-encode as little-endian PCM16 (used when relaying to a browser page).
    pub fn to_pcm16_le(&self) -> Vec<u8> {
        float_to_pcm16_le(&self.samples)
    }
}

/// Build the content tag for raw PCM at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter from a content tag, if it carries one.
fn declared_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Decode an inbound payload into a PCM buffer at the fixed output format.
///
/// ## Failure cases (each becomes `DecodePayloadFailure`):
/// - content tag is not audio
/// - declared rate differs from the expected output rate
/// - data is not valid base64
/// - no samples, or a byte count that does not split into whole sample frames
pub fn decode_payload(
    payload: &InboundAudioPayload,
    sample_rate: u32,
    channels: u16,
) -> VoiceResult<PcmBuffer> {
    if !payload.mime_type.starts_with("audio/") {
        return Err(VoiceError::DecodePayloadFailure(format!(
            "not an audio payload: {}",
            payload.mime_type
        )));
    }

    if let Some(rate) = declared_rate(&payload.mime_type) {
        if rate != sample_rate {
            return Err(VoiceError::DecodePayloadFailure(format!(
                "sample rate mismatch: expected {}, got {}",
                sample_rate, rate
            )));
        }
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.data.trim())
        .map_err(|e| VoiceError::DecodePayloadFailure(format!("invalid base64: {}", e)))?;

    if bytes.is_empty() {
        return Err(VoiceError::DecodePayloadFailure("payload is empty".to_string()));
    }

    let frame_bytes = 2 * channels.max(1) as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(VoiceError::DecodePayloadFailure(format!(
            "{} bytes do not divide into {}-byte sample frames",
            bytes.len(),
            frame_bytes
        )));
    }

    Ok(PcmBuffer::new(pcm16_le_to_float(&bytes), sample_rate, channels))
}

/// Convert float samples to little-endian PCM16 bytes.
pub fn float_to_pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
        // Writing into a Vec cannot fail
        let _ = out.write_i16::<LittleEndian>(scaled);
    }
    out
}

/// Convert little-endian PCM16 bytes to float samples in [-1.0, 1.0).
/// A trailing odd byte is ignored.
pub fn pcm16_le_to_float(bytes: &[u8]) -> Vec<f32> {
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_from_samples(samples: &[i16], rate: u32) -> InboundAudioPayload {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        InboundAudioPayload {
            mime_type: pcm_mime_type(rate),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    #[test]
    fn test_encode_frame() {
        let frame = AudioFrame::new(vec![0.0, 0.5, -0.5, 1.0, -1.0], 16_000);
        let chunk = EncodedChunk::encode(frame);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");

        let bytes = base64::engine::general_purpose::STANDARD.decode(&chunk.data).unwrap();
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        // 1.0 saturates at i16::MAX rather than wrapping to i16::MIN
        assert_eq!(samples, vec![0, 16384, -16384, 32767, -32768]);
    }

    #[test]
    fn test_encode_clamps_out_of_range() {
        let pcm = float_to_pcm16_le(&[2.0, -3.0]);
        assert_eq!(pcm, [32767i16.to_le_bytes(), (-32768i16).to_le_bytes()].concat());
    }

    #[test]
    fn test_decode_payload() {
        let payload = payload_from_samples(&[0, 16384, -16384, -32768], 24_000);
        let buffer = decode_payload(&payload, 24_000, 1).unwrap();
        assert_eq!(buffer.samples(), &[0.0, 0.5, -0.5, -1.0]);
        assert_eq!(buffer.frames(), 4);
        assert!((buffer.duration() - 4.0 / 24_000.0).abs() < 1e-12);
    }

    #[test]
    fn test_decode_duration_one_second() {
        let payload = payload_from_samples(&vec![0i16; 24_000], 24_000);
        let buffer = decode_payload(&payload, 24_000, 1).unwrap();
        assert!((buffer.duration() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        let not_base64 = InboundAudioPayload {
            mime_type: pcm_mime_type(24_000),
            data: "%%%".to_string(),
        };
        assert!(matches!(
            decode_payload(&not_base64, 24_000, 1),
            Err(VoiceError::DecodePayloadFailure(_))
        ));

        let odd = InboundAudioPayload {
            mime_type: pcm_mime_type(24_000),
            data: base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]),
        };
        assert!(decode_payload(&odd, 24_000, 1).is_err());

        let empty = InboundAudioPayload {
            mime_type: pcm_mime_type(24_000),
            data: String::new(),
        };
        assert!(decode_payload(&empty, 24_000, 1).is_err());

        let wrong_rate = payload_from_samples(&[1, 2], 16_000);
        assert!(decode_payload(&wrong_rate, 24_000, 1).is_err());

        let text = InboundAudioPayload {
            mime_type: "text/plain".to_string(),
            data: base64::engine::general_purpose::STANDARD.encode([0u8, 0]),
        };
        assert!(decode_payload(&text, 24_000, 1).is_err());
    }

    #[test]
    fn test_decode_accepts_untagged_rate() {
        let mut payload = payload_from_samples(&[100, -100], 24_000);
        payload.mime_type = "audio/pcm".to_string();
        assert!(decode_payload(&payload, 24_000, 1).is_ok());
    }

    #[test]
    fn test_pcm_conversion_accuracy() {
        let original = vec![0.0f32, 0.25, -0.75, 0.999];
        let converted = pcm16_le_to_float(&float_to_pcm16_le(&original));
        for (a, b) in original.iter().zip(converted.iter()) {
            assert!((a - b).abs() <= 1.0 / 32768.0, "{} vs {}", a, b);
        }
    }
}
