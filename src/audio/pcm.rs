//! PCM16 codec
//!
//! Converts between floating-point samples and 16-bit signed little-endian PCM,
//! the only sample format spoken on the wire in both directions.
//!
//! Encoding scales by 32768 and truncates toward zero. Out-of-range input is not
//! clamped: the value wraps modulo 2^16 the same way a typed-array store does, so
//! `1.0` encodes as `-32768`.

/// Scale factor between float samples and i16 samples
const PCM16_SCALE: f32 = 32768.0;

/// Errors from decoding raw PCM payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Payload length is not a whole number of 16-bit frames
    MalformedFrame { len: usize, channels: u16 },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::MalformedFrame { len, channels } => write!(
                f,
                "Malformed PCM16 frame: {} bytes is not a whole number of {}-channel samples",
                len, channels
            ),
        }
    }
}

impl std::error::Error for CodecError {}

/// Decoded audio, one sample vector per channel
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl DecodedAudio {
    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Playback duration in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Take the first channel, dropping the rest
    pub fn into_mono(self) -> Vec<f32> {
        self.channels.into_iter().next().unwrap_or_default()
    }
}

/// Quantize float samples to i16 (truncating, wrapping on overflow)
pub fn quantize(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| quantize_sample(s)).collect()
}

fn quantize_sample(sample: f32) -> i16 {
    // `as i32` truncates toward zero; the i16 narrowing then wraps instead of saturating.
    (sample * PCM16_SCALE) as i32 as i16
}

/// Serialize i16 samples as little-endian bytes
pub fn to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Encode float samples as little-endian PCM16 bytes
pub fn encode(samples: &[f32]) -> Vec<u8> {
    to_le_bytes(&quantize(samples))
}

/// Decode little-endian PCM16 bytes into per-channel float samples
///
/// Interleaved multi-channel payloads are split into one vector per channel.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<DecodedAudio, CodecError> {
    let frame_bytes = 2 * channels as usize;
    if channels == 0 || bytes.len() % frame_bytes != 0 {
        return Err(CodecError::MalformedFrame {
            len: bytes.len(),
            channels,
        });
    }

    let frames = bytes.len() / frame_bytes;
    let mut out = vec![Vec::with_capacity(frames); channels as usize];

    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        out[i % channels as usize].push(sample as f32 / PCM16_SCALE);
    }

    Ok(DecodedAudio {
        sample_rate,
        channels: out,
    })
}
