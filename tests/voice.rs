//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use prep_voice::Error;
use prep_voice::transport::protocol::parse_server_message;
use prep_voice::voice::codec::{decode, encode, frames_to_wav};
use prep_voice::voice::{AudioFrame, FrameAssembler, PlaybackScheduler, SAMPLE_RATE, WireChunk, downmix};
use prep_voice::{Speaker, StreamEvent};

mod common;

use common::{ManualOutput, speech_chunk};

/// Generate sine wave audio samples
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

#[test]
fn test_captured_frames_survive_the_wire() {
    let mut assembler = FrameAssembler::new(SAMPLE_RATE, 4096);
    let frames = assembler.push(&generate_sine_samples(440.0, 0.6, 0.5));

    // 9600 samples make two full frames with the rest held back
    assert_eq!(frames.len(), 2);
    assert_eq!(assembler.pending(), 9600 - 2 * 4096);

    for frame in &frames {
        let chunk = encode(frame);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        assert_eq!(&decode(&chunk).unwrap(), frame);
    }
}

#[test]
fn test_full_scale_input_clamps() {
    let mut assembler = FrameAssembler::new(SAMPLE_RATE, 4);
    let frames = assembler.push(&[1.0, -1.0, 1.5, -1.5]);

    assert_eq!(frames[0].samples(), &[i16::MAX, i16::MIN, i16::MAX, i16::MIN]);
}

#[test]
fn test_stereo_capture_downmixes() {
    let interleaved = [0.5, 0.1, -0.2, -0.4, 1.0, 1.0];
    let mono = downmix(&interleaved, 2);

    assert_eq!(mono.len(), 3);
    assert!((mono[0] - 0.3).abs() < 1e-6);
    assert!((mono[1] + 0.3).abs() < 1e-6);
    assert!((mono[2] - 1.0).abs() < 1e-6);
}

#[test]
fn test_decode_rejects_bad_payloads() {
    let odd = WireChunk::new("audio/pcm;rate=24000".to_string(), "AAEC".to_string());
    assert!(matches!(decode(&odd), Err(Error::MalformedPayload(_))));

    let wrong_type = WireChunk::new("audio/mp3".to_string(), "AAE=".to_string());
    assert!(matches!(decode(&wrong_type), Err(Error::MalformedPayload(_))));

    let bad_channels = WireChunk::new("audio/pcm;rate=24000;channels=2".to_string(), "AAE=".to_string());
    assert!(matches!(decode(&bad_channels), Err(Error::MalformedPayload(_))));
}

#[test]
fn test_wav_export() {
    let frames = vec![
        AudioFrame::mono(vec![0, 1000, -1000, 32767], SAMPLE_RATE).unwrap(),
        AudioFrame::mono(vec![-32768, 5], SAMPLE_RATE).unwrap(),
    ];
    let wav_data = frames_to_wav(&frames).unwrap();

    // Check WAV header magic
    assert_eq!(&wav_data[0..4], b"RIFF");
    assert_eq!(&wav_data[8..12], b"WAVE");

    let mut reader = hound::WavReader::new(Cursor::new(wav_data)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);

    let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(samples, vec![0, 1000, -1000, 32767, -32768, 5]);
}

#[test]
fn test_server_audio_reaches_the_scheduler() {
    let message = br#"{
        "serverContent": {
            "modelTurn": { "parts": [
                { "inlineData": { "mimeType": "audio/pcm", "data": "AAABAAIAAwA=" } }
            ] },
            "outputTranscription": { "text": "What are we prepping for?" }
        }
    }"#;

    let events = parse_server_message(message).unwrap().into_events(24000);
    assert_eq!(
        events[0],
        StreamEvent::TextDelta {
            speaker: Speaker::Agent,
            text: "What are we prepping for?".to_string()
        }
    );

    let StreamEvent::AudioChunk { payload } = &events[1] else {
        panic!("expected audio, got {:?}", events[1]);
    };
    let frame = decode(payload).unwrap();
    assert_eq!(frame.sample_rate(), 24000);
    assert_eq!(frame.samples(), &[0, 1, 2, 3]);

    let output = Arc::new(ManualOutput::default());
    let mut scheduler = PlaybackScheduler::new(output.clone());
    assert!(scheduler.enqueue(payload).is_some());
    assert_eq!(output.played().len(), 1);
}

#[test]
fn test_scheduler_follows_device_clock() {
    let output = Arc::new(ManualOutput::default());
    let mut scheduler = PlaybackScheduler::new(output.clone());

    scheduler.enqueue(&speech_chunk(200)).unwrap();
    scheduler.enqueue(&speech_chunk(150)).unwrap();
    assert_eq!(scheduler.cursor(), Duration::from_millis(350));

    // device idle past the cursor: the next chunk starts now
    output.set_now(Duration::from_millis(900));
    scheduler.enqueue(&speech_chunk(100)).unwrap();

    let starts: Vec<_> = output.played().iter().map(|p| p.1).collect();
    assert_eq!(
        starts,
        vec![Duration::ZERO, Duration::from_millis(200), Duration::from_millis(900)]
    );
    assert_eq!(scheduler.cursor(), Duration::from_millis(1000));
}

#[tokio::test]
async fn test_finished_buffers_leave_the_active_set() {
    let output = Arc::new(ManualOutput::default());
    let mut scheduler = PlaybackScheduler::new(output.clone());

    let first = scheduler.enqueue(&speech_chunk(20)).unwrap();
    let second = scheduler.enqueue(&speech_chunk(20)).unwrap();

    output.finish(first);
    let notice = scheduler.next_notice().await.unwrap();
    scheduler.handle_notice(&notice);

    assert!(!scheduler.is_active(first));
    assert!(scheduler.is_active(second));

    scheduler.interrupt();
    assert_eq!(output.stopped(), vec![second]);
}
