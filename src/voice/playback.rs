//! Audio playback to speakers
//!
//! Buffers are placed on a timeline measured in output samples. The cpal
//! callback renders that timeline, so the device clock is simply the number
//! of frames handed to the hardware so far.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use tokio::sync::mpsc::UnboundedSender;

use super::codec::AudioFrame;
use super::resample::StreamResampler;
use crate::{Error, Result};

/// Sample rate for playback (matches the agent's synthesized audio)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// How long `open` waits for the device to start
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies one scheduled buffer on the output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackHandle(pub u64);

impl std::fmt::Display for PlaybackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle report for a scheduled buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackNotice {
    /// The buffer played to its end
    Finished(PlaybackHandle),
    /// The device gave up on this buffer
    Failed {
        handle: PlaybackHandle,
        detail: String,
    },
}

/// A decoded buffer ready to be placed on the device timeline
#[derive(Debug)]
pub struct ScheduledBuffer {
    pub handle: PlaybackHandle,
    pub frame: AudioFrame,
    /// Start time in the device clock
    pub start_at: Duration,
    /// Where completion and failure notices go
    pub notify: UnboundedSender<PlaybackNotice>,
}

/// An output device with a monotonic clock that can start buffers at an
/// exact time and cancel them individually
pub trait OutputDevice: Send + Sync {
    /// Current device time
    fn now(&self) -> Duration;

    /// Place a buffer on the timeline
    ///
    /// # Errors
    ///
    /// Returns `PlaybackDevice` if the buffer cannot be accepted
    fn play(&self, buffer: ScheduledBuffer) -> Result<()>;

    /// Stop a buffer immediately; unknown handles are ignored
    fn stop(&self, handle: PlaybackHandle);
}

struct Voice {
    handle: PlaybackHandle,
    start_frame: u64,
    samples: Vec<f32>,
    position: usize,
    notify: UnboundedSender<PlaybackNotice>,
}

/// Sample-accurate timeline of mono voices rendered to interleaved output
pub struct Mixer {
    sample_rate: u32,
    channels: usize,
    frames_played: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    #[must_use]
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            frames_played: 0,
            voices: Vec::new(),
        }
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Device time: frames rendered so far
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn now(&self) -> Duration {
        let nanos = u128::from(self.frames_played) * 1_000_000_000 / u128::from(self.sample_rate);
        Duration::from_nanos(nanos as u64)
    }

    /// Add a mono voice (already at the mixer rate) starting at `start_at`
    ///
    /// A start time in the past begins at the next rendered frame.
    #[allow(clippy::cast_possible_truncation)]
    pub fn add(
        &mut self,
        handle: PlaybackHandle,
        samples: Vec<f32>,
        start_at: Duration,
        notify: UnboundedSender<PlaybackNotice>,
    ) {
        // nearest frame: durations are truncated to whole nanoseconds
        let start_frame = ((start_at.as_nanos() * u128::from(self.sample_rate) + 500_000_000)
            / 1_000_000_000) as u64;

        if samples.is_empty() {
            let _ = notify.send(PlaybackNotice::Finished(handle));
            return;
        }

        self.voices.push(Voice {
            handle,
            start_frame,
            samples,
            position: 0,
            notify,
        });
    }

    /// Remove a voice without notifying; returns whether it was present
    pub fn remove(&mut self, handle: PlaybackHandle) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.handle != handle);
        before != self.voices.len()
    }

    /// Number of voices pending or playing
    #[must_use]
    pub fn active(&self) -> usize {
        self.voices.len()
    }

    /// Render the next block of interleaved output and advance the clock
    #[allow(clippy::cast_possible_truncation)]
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let frames = out.len() / self.channels;
        let block_end = self.frames_played + frames as u64;

        for voice in &mut self.voices {
            if voice.start_frame >= block_end {
                continue;
            }

            let begin = voice.start_frame.saturating_sub(self.frames_played) as usize;
            for frame in out.chunks_exact_mut(self.channels).skip(begin) {
                let Some(&sample) = voice.samples.get(voice.position) else {
                    break;
                };
                for slot in frame.iter_mut() {
                    *slot += sample;
                }
                voice.position += 1;
            }
        }

        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }

        self.frames_played = block_end;

        self.voices.retain(|voice| {
            if voice.position < voice.samples.len() {
                return true;
            }
            let _ = voice.notify.send(PlaybackNotice::Finished(voice.handle));
            false
        });
    }
}

impl std::fmt::Debug for Mixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mixer")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("frames_played", &self.frames_played)
            .field("voices", &self.voices.len())
            .finish()
    }
}

/// Plays audio to the default output device
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    sample_rate: u32,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device
    ///
    /// Prefers a mono config at `sample_rate`, then stereo, then the device
    /// default (with resampling on the way in).
    ///
    /// # Errors
    ///
    /// Returns `PlaybackDevice` if the device cannot be opened
    pub fn open(sample_rate: u32) -> Result<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<Arc<Mutex<Mixer>>>>(1);
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("prep-voice-playback".to_string())
            .spawn(move || {
                let (stream, mixer) = match build_output_stream(sample_rate) {
                    Ok(built) => built,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(Error::PlaybackDevice(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(mixer));

                // park until the owner goes away
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("audio playback closed");
            })
            .map_err(|e| Error::PlaybackDevice(e.to_string()))?;

        let mixer = match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(mixer)) => mixer,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                return Err(Error::PlaybackDevice(
                    "timed out opening output device".to_string(),
                ));
            }
        };

        let device_rate = mixer.lock().map(|m| m.sample_rate()).unwrap_or(sample_rate);

        Ok(Self {
            mixer,
            sample_rate: device_rate,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Rate the device actually runs at
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl OutputDevice for CpalOutput {
    fn now(&self) -> Duration {
        self.mixer.lock().map(|m| m.now()).unwrap_or_default()
    }

    fn play(&self, buffer: ScheduledBuffer) -> Result<()> {
        let mut samples = buffer.frame.to_mono_f32();
        if buffer.frame.sample_rate() != self.sample_rate {
            samples = StreamResampler::new(buffer.frame.sample_rate(), self.sample_rate)
                .and_then(|mut r| r.process_all(&samples))
                .map_err(|e| Error::PlaybackDevice(e.to_string()))?;
        }

        let mut mixer = self
            .mixer
            .lock()
            .map_err(|_| Error::PlaybackDevice("mixer lock poisoned".to_string()))?;
        mixer.add(buffer.handle, samples, buffer.start_at, buffer.notify);
        Ok(())
    }

    fn stop(&self, handle: PlaybackHandle) {
        if let Ok(mut mixer) = self.mixer.lock() {
            if mixer.remove(handle) {
                tracing::trace!(%handle, "playback stopped");
            }
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for CpalOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalOutput")
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

/// Build the output stream and the mixer it renders
fn build_output_stream(sample_rate: u32) -> Result<(cpal::Stream, Arc<Mutex<Mixer>>)> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::PlaybackDevice("no output device available".to_string()))?;

    let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels
            && c.sample_format() == SampleFormat::F32
            && c.min_sample_rate() <= SampleRate(sample_rate)
            && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    let preferred = device
        .supported_output_configs()
        .map_err(|e| Error::PlaybackDevice(e.to_string()))?
        .find(|c| supports(c, 1))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, 2))
        });

    let config: StreamConfig = match preferred {
        Some(supported) => supported.with_sample_rate(SampleRate(sample_rate)).config(),
        None => device
            .default_output_config()
            .map_err(|e| Error::PlaybackDevice(e.to_string()))?
            .config(),
    };

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        "audio playback initialized"
    );

    let mixer = Arc::new(Mutex::new(Mixer::new(
        config.sample_rate.0,
        usize::from(config.channels),
    )));
    let render_mixer = Arc::clone(&mixer);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| match render_mixer.lock() {
                Ok(mut mixer) => mixer.render(data),
                Err(_) => data.fill(0.0),
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::PlaybackDevice(e.to_string()))?;

    Ok((stream, mixer))
}
