//! Voice processing module
//!
//! Handles microphone capture, the PCM wire codec, and gapless playback of
//! the agent's synthesized speech.

pub mod codec;
mod capture;
mod playback;
mod resample;
mod scheduler;

pub use capture::{
    CaptureConfig, CapturePipeline, CaptureSource, FRAME_SAMPLES, FrameAssembler, FrameStream,
    SAMPLE_RATE, downmix,
};
pub use codec::{AudioFormat, AudioFrame, SampleEncoding, WireChunk};
pub use playback::{
    CpalOutput, Mixer, OutputDevice, PLAYBACK_SAMPLE_RATE, PlaybackHandle, PlaybackNotice,
    ScheduledBuffer,
};
pub use resample::StreamResampler;
pub use scheduler::PlaybackScheduler;
