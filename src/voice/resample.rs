//! Streaming sample-rate conversion for devices that cannot run at the
//! session's contract rates

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Input block size fed to the FFT resampler
const CHUNK_SIZE: usize = 1024;

/// Mono resampler that accepts arbitrarily sized input
///
/// Input is buffered until a full block is available, so output lags input
/// by at most one block.
pub struct StreamResampler {
    inner: FftFixedIn<f32>,
    pending: Vec<f32>,
    from_rate: u32,
    to_rate: u32,
}

impl StreamResampler {
    /// Create a resampler between two rates
    ///
    /// # Errors
    ///
    /// Returns error if the resampler cannot be constructed
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let inner = FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_SIZE, 2, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

        tracing::debug!(from_rate, to_rate, "resampler initialized");

        Ok(Self {
            inner,
            pending: Vec::with_capacity(CHUNK_SIZE * 2),
            from_rate,
            to_rate,
        })
    }

    #[must_use]
    pub const fn from_rate(&self) -> u32 {
        self.from_rate
    }

    #[must_use]
    pub const fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Push input samples and return whatever output is ready
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(input);

        let mut output = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }

            let block: Vec<f32> = self.pending.drain(..needed).collect();
            let result = self
                .inner
                .process(&[block], None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            if let Some(channel) = result.into_iter().next() {
                output.extend(channel);
            }
        }

        Ok(output)
    }

    /// Resample a complete buffer
    ///
    /// The filter delay is trimmed from the front and the tail is flushed
    /// with silence, so the output starts with the first input sample and
    /// spans the same duration as the input. The resampler is reset
    /// afterwards and can take the next buffer.
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn process_all(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let expected = (input.len() as f64 * f64::from(self.to_rate)
            / f64::from(self.from_rate))
        .round() as usize;
        let delay = self.inner.output_delay();

        let mut output = self.process(input)?;
        while output.len() < delay + expected {
            let needed = self.inner.input_frames_next();
            let padding = vec![0.0; needed.saturating_sub(self.pending.len())];
            let flushed = self.process(&padding)?;
            if flushed.is_empty() {
                break;
            }
            output.extend(flushed);
        }

        self.inner.reset();
        self.pending.clear();

        output.drain(..delay.min(output.len()));
        output.truncate(expected);
        Ok(output)
    }
}

impl std::fmt::Debug for StreamResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResampler")
            .field("from_rate", &self.from_rate)
            .field("to_rate", &self.to_rate)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_ratio() {
        let mut resampler = StreamResampler::new(48000, 16000).unwrap();

        let input = vec![0.1_f32; 48000];
        let mut produced = 0;
        for block in input.chunks(480) {
            produced += resampler.process(block).unwrap().len();
        }

        // one second in, roughly one second out (minus the buffered tail)
        assert!(produced > 15000, "produced {produced}");
        assert!(produced <= 16000, "produced {produced}");
    }

    #[test]
    fn test_small_input_is_buffered() {
        let mut resampler = StreamResampler::new(44100, 16000).unwrap();
        let out = resampler.process(&[0.0; 10]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_process_all_flushes_tail() {
        let mut resampler = StreamResampler::new(16000, 24000).unwrap();
        let out = resampler.process_all(&[0.0; 1600]).unwrap();
        // 100ms in, 100ms out
        assert_eq!(out.len(), 2400);
    }

    #[allow(clippy::cast_precision_loss)]
    fn mean(samples: &[f32]) -> f32 {
        samples.iter().sum::<f32>() / samples.len() as f32
    }

    #[test]
    fn test_process_all_has_no_leading_silence() {
        let mut resampler = StreamResampler::new(24000, 48000).unwrap();
        let out = resampler.process_all(&[0.5; 2400]).unwrap();

        assert_eq!(out.len(), 4800);
        let head = mean(&out[..64]);
        let tail = mean(&out[out.len() - 64..]);
        assert!(head > 0.4, "head mean {head}");
        assert!(tail > 0.4, "tail mean {tail}");
        assert!((out[2400] - 0.5).abs() < 0.01, "middle {}", out[2400]);
    }

    #[test]
    fn test_process_all_is_repeatable() {
        let mut resampler = StreamResampler::new(24000, 44100).unwrap();
        let first = resampler.process_all(&[0.3; 1000]).unwrap();
        let second = resampler.process_all(&[0.3; 1000]).unwrap();

        assert_eq!(first.len(), 1838);
        assert_eq!(first, second);
    }
}
