//! Sample conversion and resampling shared by capture and playback.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Frames fed to the resampler per call.
pub const RESAMPLER_CHUNK: usize = 480;

/// Creates a mono resampler between two sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Averages interleaved frames down to one channel.
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resamples an unbounded stream of arbitrarily sized blocks.
///
/// `FastFixedIn` wants exactly `input_frames_next()` samples per call, so
/// leftovers are carried over to the next block instead of being dropped.
/// Equal rates pass through untouched.
pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> anyhow::Result<Self> {
        let inner = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(
                in_rate as f64,
                out_rate as f64,
                RESAMPLER_CHUNK,
            )?)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    /// Feeds one block and returns whatever output is complete.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return input.to_vec();
        };
        self.pending.extend_from_slice(input);
        let mut output = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(mut frames) => output.append(&mut frames[0]),
                Err(e) => {
                    tracing::error!(error = %e, "Resampling failed; dropping block.");
                    break;
                }
            }
        }
        output
    }

    /// Discards buffered input.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.inner.as_mut() {
            resampler.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(48000.0, 16000.0, 1024).is_ok());
        assert!(create_resampler(16000.0, 44100.0, 512).is_ok());
    }

    #[test]
    fn test_convert_f32_to_i16_clamps() {
        let result = convert_f32_to_i16(&[1.0, -1.0, 0.0, 2.0, -2.0]);
        assert_eq!(result, vec![i16::MAX, -32767, 0, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_convert_i16_to_f32() {
        let result = convert_i16_to_f32(&[i16::MIN, 0, 16384]);
        assert_abs_diff_eq!(result[0], -1.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[1], 0.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[2], 0.5, epsilon = 0.0001);
    }

    #[test]
    fn test_downmix_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(downmix_to_mono(&[0.25, 0.75], 1), vec![0.25, 0.75]);
    }

    #[test]
    fn test_equal_rates_pass_through() {
        let mut resampler = StreamResampler::new(16_000, 16_000).unwrap();
        assert_eq!(resampler.process(&[0.1, 0.2, 0.3]), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_small_blocks_are_buffered_not_dropped() {
        let mut resampler = StreamResampler::new(48_000, 16_000).unwrap();
        let block = vec![0.0f32; 100];
        let mut produced = 0;
        for _ in 0..48 {
            produced += resampler.process(&block).len();
        }
        // 4800 input samples at a 3:1 ratio yield about 1600 output samples,
        // minus at most one chunk still waiting in the buffer.
        assert!((1400..=1610).contains(&produced), "produced {produced}");
    }
}
