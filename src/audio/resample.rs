//! Channel downmixing and sample-rate conversion
//!
//! Capture devices rarely open at exactly 16kHz mono and output devices rarely at
//! 24kHz mono, so both directions pass through these helpers.
//!
//! Resampling is linear interpolation, done per buffer. That is adequate for speech;
//! for music-grade conversion consider the `rubato` crate.

/// Average interleaved multi-channel samples down to mono
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample mono audio from source rate to target rate using linear interpolation
///
/// # Returns
/// Resampled audio, or the original if rates match or either rate is zero
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    // Guard against division by zero
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = output_len(samples.len(), source_rate, target_rate);
    interpolate(samples, out_len, source_rate as f64 / target_rate as f64)
}

/// Stretch mono audio to exactly `out_len` samples using linear interpolation
pub fn resample_to_len(samples: &[f32], out_len: usize) -> Vec<f32> {
    if samples.is_empty() || out_len == 0 {
        return vec![0.0; out_len];
    }
    if samples.len() == out_len {
        return samples.to_vec();
    }
    interpolate(samples, out_len, samples.len() as f64 / out_len as f64)
}

fn interpolate(samples: &[f32], out_len: usize, step: f64) -> Vec<f32> {
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let next = samples[(idx + 1).min(last)];
            samples[idx] + (next - samples[idx]) * frac
        })
        .collect()
}

/// Number of output samples produced for `len` input samples
pub fn output_len(len: usize, source_rate: u32, target_rate: u32) -> usize {
    if source_rate == 0 || target_rate == 0 {
        return len;
    }
    ((len as u64 * target_rate as u64) / source_rate as u64) as usize
}
