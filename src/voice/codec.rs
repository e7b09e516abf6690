//! PCM16 frames and their base64 wire encoding

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::{Error, Result};

/// MIME base type for little-endian signed 16-bit PCM
pub const PCM_MIME: &str = "audio/pcm";

/// Sample encoding declared by a wire descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// Signed 16-bit little-endian
    Pcm16,
}

/// Parsed form of a MIME descriptor such as `audio/pcm;rate=24000`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

impl AudioFormat {
    /// Mono PCM16 at the given rate
    #[must_use]
    pub const fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            encoding: SampleEncoding::Pcm16,
        }
    }

    /// Render the MIME descriptor; `channels` is omitted for mono
    #[must_use]
    pub fn to_mime(&self) -> String {
        if self.channels == 1 {
            format!("{PCM_MIME};rate={}", self.sample_rate)
        } else {
            format!(
                "{PCM_MIME};rate={};channels={}",
                self.sample_rate, self.channels
            )
        }
    }

    /// Parse a MIME descriptor
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` for a non-PCM type, a missing or zero
    /// rate, or an unparseable parameter
    pub fn parse_mime(mime: &str) -> Result<Self> {
        let mut parts = mime.split(';').map(str::trim);

        let base = parts.next().unwrap_or_default();
        if !base.eq_ignore_ascii_case(PCM_MIME) {
            return Err(Error::MalformedPayload(format!(
                "unsupported audio type: {base}"
            )));
        }

        let mut sample_rate = None;
        let mut channels = 1_u16;

        for param in parts.filter(|p| !p.is_empty()) {
            let (key, value) = param.split_once('=').ok_or_else(|| {
                Error::MalformedPayload(format!("bad descriptor parameter: {param}"))
            })?;

            match key.trim().to_ascii_lowercase().as_str() {
                "rate" => {
                    sample_rate = Some(value.trim().parse::<u32>().map_err(|_| {
                        Error::MalformedPayload(format!("bad sample rate: {value}"))
                    })?);
                }
                "channels" => {
                    channels = value.trim().parse::<u16>().map_err(|_| {
                        Error::MalformedPayload(format!("bad channel count: {value}"))
                    })?;
                }
                other => {
                    tracing::trace!(parameter = other, "ignoring descriptor parameter");
                }
            }
        }

        let sample_rate = sample_rate
            .filter(|r| *r > 0)
            .ok_or_else(|| Error::MalformedPayload(format!("missing sample rate: {mime}")))?;

        if channels == 0 {
            return Err(Error::MalformedPayload("zero channels".to_string()));
        }

        Ok(Self {
            sample_rate,
            channels,
            encoding: SampleEncoding::Pcm16,
        })
    }
}

/// An immutable buffer of interleaved PCM16 samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    /// Create a frame
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the sample count is not a multiple of
    /// the channel count or either tag is zero
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Result<Self> {
        if channels == 0 || sample_rate == 0 {
            return Err(Error::MalformedPayload(format!(
                "invalid frame format: {sample_rate} Hz, {channels} channels"
            )));
        }
        if samples.len() % usize::from(channels) != 0 {
            return Err(Error::MalformedPayload(format!(
                "{} samples do not divide into {channels} channels",
                samples.len()
            )));
        }

        Ok(Self {
            samples: samples.into(),
            sample_rate,
            channels,
        })
    }

    /// Create a mono frame (always valid for a non-zero rate)
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if `sample_rate` is zero
    pub fn mono(samples: Vec<i16>, sample_rate: u32) -> Result<Self> {
        Self::new(samples, sample_rate, 1)
    }

    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames (samples per channel)
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration, exact to the nanosecond
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn duration(&self) -> Duration {
        let nanos =
            self.frame_count() as u128 * 1_000_000_000 / u128::from(self.sample_rate);
        Duration::from_nanos(nanos as u64)
    }

    /// Format descriptor of this frame
    #[must_use]
    pub const fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            encoding: SampleEncoding::Pcm16,
        }
    }

    /// Samples down-mixed to mono and normalized to [-1.0, 1.0)
    #[must_use]
    pub fn to_mono_f32(&self) -> Vec<f32> {
        let channels = usize::from(self.channels);
        if channels == 1 {
            return self.samples.iter().copied().map(pcm16_to_f32).collect();
        }

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / channels as f32;
        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().copied().map(pcm16_to_f32).sum::<f32>() * scale)
            .collect()
    }
}

/// Transport-safe encoding of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChunk {
    /// MIME descriptor, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
    /// Base64 (standard alphabet, padded) of the little-endian bytes
    pub data: String,
}

impl WireChunk {
    #[must_use]
    pub const fn new(mime_type: String, data: String) -> Self {
        Self { mime_type, data }
    }

    /// Parse the declared descriptor
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the descriptor is not PCM16
    pub fn format(&self) -> Result<AudioFormat> {
        AudioFormat::parse_mime(&self.mime_type)
    }
}

/// Encode a frame for the wire
#[must_use]
pub fn encode(frame: &AudioFrame) -> WireChunk {
    let bytes: Vec<u8> = frame
        .samples()
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect();

    WireChunk {
        mime_type: frame.format().to_mime(),
        data: BASE64.encode(bytes),
    }
}

/// Decode a wire chunk back into a frame
///
/// # Errors
///
/// Returns `MalformedPayload` if the text is not valid base64, the byte
/// length is odd, the descriptor is unsupported, or the samples do not
/// divide into the declared channels
pub fn decode(chunk: &WireChunk) -> Result<AudioFrame> {
    let format = chunk.format()?;

    let bytes = BASE64
        .decode(chunk.data.as_bytes())
        .map_err(|e| Error::MalformedPayload(format!("invalid base64: {e}")))?;

    if bytes.len() % 2 != 0 {
        return Err(Error::MalformedPayload(format!(
            "odd byte length {} for 16-bit samples",
            bytes.len()
        )));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();

    AudioFrame::new(samples, format.sample_rate, format.channels)
}

/// Convert a normalized float sample to PCM16
///
/// Scales by 32768 and rounds, then clamps to the i16 range so that
/// full-scale positive input saturates instead of wrapping.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn pcm16_from_f32(sample: f32) -> i16 {
    // NaN casts to 0
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

/// Convert a PCM16 sample to a normalized float
#[must_use]
pub fn pcm16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Render frames as a WAV file (for saving captured audio)
///
/// # Errors
///
/// Returns error if the frames disagree on format or WAV encoding fails
pub fn frames_to_wav(frames: &[AudioFrame]) -> Result<Vec<u8>> {
    let Some(first) = frames.first() else {
        return Err(Error::Audio("no frames to write".to_string()));
    };

    let spec = hound::WavSpec {
        channels: first.channels(),
        sample_rate: first.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for frame in frames {
            if frame.format() != first.format() {
                return Err(Error::Audio(format!(
                    "frame format changed mid-recording: {} vs {}",
                    frame.format().to_mime(),
                    first.format().to_mime()
                )));
            }
            for &sample in frame.samples() {
                writer
                    .write_sample(sample)
                    .map_err(|e| Error::Audio(e.to_string()))?;
            }
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
