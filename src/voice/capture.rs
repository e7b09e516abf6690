//! Audio capture from microphone
//!
//! The cpal input stream lives on a dedicated thread. Device callbacks hand
//! raw float buffers to that thread, which converts them to PCM16 and cuts
//! them into fixed-size frames for the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;

use super::codec::{AudioFrame, pcm16_from_f32};
use super::resample::StreamResampler;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per emitted frame
pub const FRAME_SAMPLES: usize = 4096;

/// Frames buffered between the capture thread and the consumer
const FRAME_QUEUE: usize = 16;

/// How long `start` waits for the device to open
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Capture thread wake-up interval for stop checks
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lazy, cancelable sequence of captured frames
pub type FrameStream = ReceiverStream<AudioFrame>;

/// Capture rate and framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub frame_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_samples: FRAME_SAMPLES,
        }
    }
}

/// A source of microphone frames the session can start and stop
pub trait CaptureSource: Send {
    /// Acquire the input device and begin producing frames
    ///
    /// # Errors
    ///
    /// Returns `CaptureUnavailable` if the device cannot be opened
    fn start(&mut self) -> Result<FrameStream>;

    /// Release the device and end the frame stream; idempotent
    fn stop(&mut self);

    /// Check if currently capturing
    fn is_capturing(&self) -> bool;
}

/// Cuts a continuous float signal into fixed-length PCM16 frames
#[derive(Debug)]
pub struct FrameAssembler {
    sample_rate: u32,
    frame_samples: usize,
    pending: Vec<i16>,
}

impl FrameAssembler {
    #[must_use]
    pub fn new(sample_rate: u32, frame_samples: usize) -> Self {
        Self {
            sample_rate,
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples),
        }
    }

    /// Append samples and return every frame that is now complete
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending
            .extend(samples.iter().copied().map(pcm16_from_f32));

        let complete = self.pending.len() / self.frame_samples;
        let mut frames = Vec::with_capacity(complete);
        for _ in 0..complete {
            let rest = self.pending.split_off(self.frame_samples);
            let samples = std::mem::replace(&mut self.pending, rest);
            // mono with a non-zero rate cannot fail
            if let Ok(frame) = AudioFrame::mono(samples, self.sample_rate) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Samples held back waiting for a full frame
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Down-mix interleaved samples to mono
#[must_use]
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    #[allow(clippy::cast_precision_loss)]
    let scale = 1.0 / channels as f32;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

/// Captures audio from the default input device
pub struct CapturePipeline {
    config: CaptureConfig,
    worker: Option<CaptureWorker>,
}

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl CapturePipeline {
    /// Create a capture pipeline; the device is not touched until `start`
    #[must_use]
    pub const fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            worker: None,
        }
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}

impl Default for CapturePipeline {
    fn default() -> Self {
        Self::new(CaptureConfig::default())
    }
}

impl CaptureSource for CapturePipeline {
    fn start(&mut self) -> Result<FrameStream> {
        if self.worker.is_some() {
            return Err(Error::CaptureUnavailable(
                "capture already running".to_string(),
            ));
        }

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let stop = Arc::new(AtomicBool::new(false));

        let config = self.config;
        let stop_thread = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("prep-voice-capture".to_string())
            .spawn(move || run_capture(config, &frame_tx, &ready_tx, &stop_thread))
            .map_err(|e| Error::CaptureUnavailable(e.to_string()))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { stop, thread });
                tracing::debug!("audio capture started");
                Ok(ReceiverStream::new(frame_rx))
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                stop.store(true, Ordering::Release);
                Err(Error::CaptureUnavailable(
                    "timed out opening input device".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            if worker.thread.join().is_err() {
                tracing::error!("audio capture thread panicked");
            }
            tracing::debug!("audio capture stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the default input device, preferring a native mono config at the
/// capture rate and falling back to the device default
fn open_input(config: CaptureConfig, raw_tx: std::sync::mpsc::Sender<Vec<f32>>) -> Result<(Stream, StreamConfig)> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::CaptureUnavailable("no input device available".to_string()))?;

    let native = device
        .supported_input_configs()
        .map_err(|e| Error::CaptureUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(config.sample_rate)
                && c.max_sample_rate() >= SampleRate(config.sample_rate)
        });

    let stream_config = match native {
        Some(supported) => supported
            .with_sample_rate(SampleRate(config.sample_rate))
            .config(),
        None => {
            let fallback = device
                .default_input_config()
                .map_err(|e| Error::CaptureUnavailable(e.to_string()))?;
            tracing::debug!(
                sample_rate = fallback.sample_rate().0,
                channels = fallback.channels(),
                "no native capture config, resampling device default"
            );
            fallback.config()
        }
    };

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = stream_config.sample_rate.0,
        channels = stream_config.channels,
        "audio capture initialized"
    );

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = raw_tx.send(data.to_vec());
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::CaptureUnavailable(e.to_string()))?;

    Ok((stream, stream_config))
}

/// Body of the capture thread
fn run_capture(
    config: CaptureConfig,
    frame_tx: &mpsc::Sender<AudioFrame>,
    ready_tx: &SyncSender<Result<()>>,
    stop: &AtomicBool,
) {
    let (raw_tx, raw_rx) = std::sync::mpsc::channel::<Vec<f32>>();

    let (stream, stream_config) = match open_input(config, raw_tx) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let device_rate = stream_config.sample_rate.0;
    let channels = usize::from(stream_config.channels);

    let mut resampler = if device_rate == config.sample_rate {
        None
    } else {
        match StreamResampler::new(device_rate, config.sample_rate) {
            Ok(r) => Some(r),
            Err(e) => {
                let _ = ready_tx.send(Err(Error::CaptureUnavailable(e.to_string())));
                return;
            }
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(Error::CaptureUnavailable(e.to_string())));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    let mut assembler = FrameAssembler::new(config.sample_rate, config.frame_samples);
    let mut dropped: u64 = 0;

    'capture: while !stop.load(Ordering::Acquire) {
        let raw = match raw_rx.recv_timeout(POLL_INTERVAL) {
            Ok(raw) => raw,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mono = downmix(&raw, channels);
        let samples = match resampler.as_mut() {
            Some(r) => match r.process(&mono) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping capture buffer");
                    continue;
                }
            },
            None => mono,
        };

        for frame in assembler.push(&samples) {
            match frame_tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    tracing::warn!(dropped, "capture consumer behind, dropping frame");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("capture consumer gone");
                    break 'capture;
                }
            }
        }
    }

    drop(stream);
}
