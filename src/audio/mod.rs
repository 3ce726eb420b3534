//! Audio Resampler (C1).
//!
//! Converts 16-bit signed little-endian mono PCM between the telephony rate
//! (8 kHz), the LLM input rate (16 kHz) and the LLM output rate (24 kHz, by
//! default — see [`crate::config::AudioConfig`]).
//!
//! Each direction of a call owns its own [`ResamplerState`] value — the
//! state is never shared across pumps (§9: "Per-stream resampler state").

use tracing::warn;

/// Carried state of a linear-interpolation rate converter across frames.
///
/// `last_sample` is the final input sample of the previous call, used so the
/// interpolation for the first output sample of the next call doesn't click
/// against silence. `residual_pos` is the fractional position (in input
/// sample units) left over after the previous call's last output sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResamplerState {
    last_sample: Option<i16>,
    residual_pos: f64,
}

impl ResamplerState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Resample little-endian 16-bit mono PCM from `src_rate` to `dst_rate`.
///
/// No-op pass-through when `src_rate == dst_rate` (byte-identical output,
/// per §8's quantified invariant). Invalid rates (`<= 0`) leave the data
/// untouched and emit a warning, per §4.2's rate-conversion contract.
pub fn resample(
    bytes: &[u8],
    src_rate: i64,
    dst_rate: i64,
    state: ResamplerState,
) -> (Vec<u8>, ResamplerState) {
    if src_rate == dst_rate {
        return (bytes.to_vec(), state);
    }
    if src_rate <= 0 || dst_rate <= 0 {
        warn!(src_rate, dst_rate, "invalid sample rate for resample; passing data through unchanged");
        return (bytes.to_vec(), state);
    }

    let samples = bytes_to_samples(bytes);
    let (resampled, new_state) = resample_samples(&samples, src_rate as f64, dst_rate as f64, state);
    (samples_to_bytes(&resampled), new_state)
}

fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Linear-interpolation resampling of a sample sequence, splicing across
/// frame boundaries via `state.last_sample` / `state.residual_pos`.
fn resample_samples(
    samples: &[i16],
    src_rate: f64,
    dst_rate: f64,
    state: ResamplerState,
) -> (Vec<i16>, ResamplerState) {
    if samples.is_empty() {
        return (Vec::new(), state);
    }

    // Build a lookback-extended sequence: the previous call's last sample
    // (if any) prepended, so interpolation across the join is continuous.
    let mut extended = Vec::with_capacity(samples.len() + 1);
    let has_lookback = state.last_sample.is_some();
    if let Some(prev) = state.last_sample {
        extended.push(prev);
    }
    extended.extend_from_slice(samples);

    let ratio = dst_rate / src_rate;
    // Position (in `extended` index units) of the first new sample we owe,
    // carried over from the previous call's fractional remainder.
    let start_pos = if has_lookback { state.residual_pos } else { 0.0 };

    let last_idx = extended.len() - 1;
    let mut out = Vec::new();
    let mut pos = start_pos;
    loop {
        let idx_floor = pos.floor();
        if idx_floor as usize >= last_idx {
            break;
        }
        let idx_floor_usize = idx_floor as usize;
        let frac = pos - idx_floor;
        let a = extended[idx_floor_usize] as f64;
        let b = extended[idx_floor_usize + 1] as f64;
        let value = a + (b - a) * frac;
        out.push(value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
        pos += 1.0 / ratio;
    }

    // residual_pos is relative to the *new* last sample (samples.last()),
    // which becomes the lookback for the next call.
    let new_residual = pos - last_idx as f64;
    let new_state = ResamplerState {
        last_sample: Some(*samples.last().unwrap()),
        residual_pos: new_residual.max(0.0),
    };
    (out, new_state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples_to_bytes(samples)
    }

    #[test]
    fn same_rate_is_byte_identical_passthrough() {
        let input = pcm(&[1, -2, 300, -400, 0]);
        let (out, _) = resample(&input, 16000, 16000, ResamplerState::new());
        assert_eq!(out, input);
    }

    #[test]
    fn invalid_rate_passes_through_unchanged() {
        let input = pcm(&[5, 10, 15]);
        let (out, _) = resample(&input, 0, 16000, ResamplerState::new());
        assert_eq!(out, input);
        let (out2, _) = resample(&input, 16000, -1, ResamplerState::new());
        assert_eq!(out2, input);
    }

    #[test]
    fn all_zero_roundtrips_8k_to_16k_to_8k() {
        let zeros = vec![0i16; 160]; // 20 ms at 8kHz
        let input = pcm(&zeros);

        let (up, up_state) = resample(&input, 8000, 16000, ResamplerState::new());
        let up_samples = bytes_to_samples(&up);
        assert!(up_samples.iter().all(|&s| s == 0));

        let (down, _) = resample(&up, 16000, 8000, ResamplerState::new());
        let down_samples = bytes_to_samples(&down);
        assert!(down_samples.iter().all(|&s| s == 0));
        assert_eq!(down_samples.len(), zeros.len());
        let _ = up_state;
    }

    #[test]
    fn upsample_doubles_sample_count() {
        let samples: Vec<i16> = (0..160).map(|i| (i * 10) as i16).collect();
        let input = pcm(&samples);
        let (out, _) = resample(&input, 8000, 16000, ResamplerState::new());
        let out_samples = bytes_to_samples(&out);
        assert!((out_samples.len() as i64 - 320).abs() <= 2);
    }

    #[test]
    fn state_carries_across_frame_boundary_without_discontinuity() {
        let frame1 = pcm(&[0, 1000, 2000, 3000]);
        let frame2 = pcm(&[4000, 5000, 6000, 7000]);

        let mut state = ResamplerState::new();
        let (out1, s1) = resample(&frame1, 8000, 16000, state);
        state = s1;
        let (out2, _) = resample(&frame2, 8000, 16000, state);

        let samples1 = bytes_to_samples(&out1);
        let samples2 = bytes_to_samples(&out2);
        // The first interpolated sample of frame2's output should be close
        // to the last real input sample of frame1 (3000), not jump to 0.
        assert!(!samples1.is_empty());
        assert!(!samples2.is_empty());
        assert!((samples2[0] as i32 - 3000).abs() < 1500);
    }
}
