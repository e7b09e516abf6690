//! Live API wire messages
//!
//! The session speaks JSON over a WebSocket. The client sends one `setup`
//! message followed by `realtimeInput` audio; the server answers with
//! `setupComplete` and then a stream of `serverContent` messages mixing
//! transcription, audio, and turn signals.

use serde::{Deserialize, Serialize};

use super::{SessionSetup, Speaker, StreamEvent};
use crate::voice::codec::{AudioFormat, PCM_MIME};
use crate::voice::WireChunk;

/// Messages sent by the client
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    /// Presence requests transcripts of the user's audio
    pub input_audio_transcription: TranscriptionConfig,
    /// Presence requests transcripts of the agent's audio
    pub output_audio_transcription: TranscriptionConfig,
}

/// Empty object; the field's presence is the request
#[derive(Debug, Default, Serialize)]
pub struct TranscriptionConfig {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Inline binary payload (base64 text plus MIME type)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Messages sent by the server; unknown fields are ignored
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    #[serde(default)]
    pub tool_call: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Build the session-open message
#[must_use]
pub fn setup_message(setup: &SessionSetup) -> ClientMessage {
    let system_instruction = (!setup.instructions.trim().is_empty()).then(|| Content {
        parts: vec![Part {
            text: Some(setup.instructions.clone()),
            inline_data: None,
        }],
    });

    let speech_config = setup.voice.as_ref().map(|name| SpeechConfig {
        voice_config: VoiceConfig {
            prebuilt_voice_config: PrebuiltVoiceConfig {
                voice_name: name.clone(),
            },
        },
    });

    ClientMessage::Setup(Setup {
        model: setup.model.clone(),
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config,
        },
        system_instruction,
        input_audio_transcription: TranscriptionConfig::default(),
        output_audio_transcription: TranscriptionConfig::default(),
    })
}

/// Wrap one outbound audio chunk
#[must_use]
pub fn audio_message(chunk: WireChunk) -> ClientMessage {
    ClientMessage::RealtimeInput(RealtimeInput {
        media_chunks: vec![Blob {
            mime_type: chunk.mime_type,
            data: chunk.data,
        }],
    })
}

/// Parse one server frame
///
/// # Errors
///
/// Returns error if the frame is not a JSON server message
pub fn parse_server_message(bytes: &[u8]) -> crate::Result<ServerMessage> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Give an audio MIME type an explicit rate when the server left it out
fn normalize_audio_mime(mime: &str, default_rate: u32) -> String {
    let has_rate = mime
        .split(';')
        .skip(1)
        .any(|p| p.trim().to_ascii_lowercase().starts_with("rate="));
    if has_rate {
        mime.to_string()
    } else if mime.trim().eq_ignore_ascii_case(PCM_MIME) {
        AudioFormat::mono(default_rate).to_mime()
    } else {
        format!("{mime};rate={default_rate}")
    }
}

impl ServerMessage {
    /// Flatten into stream events
    ///
    /// Order within one message: opened, agent text, user text, turn
    /// complete, audio, interrupted.
    #[must_use]
    pub fn into_events(self, inbound_rate: u32) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(StreamEvent::Opened);
        }

        if let Some(go_away) = &self.go_away {
            tracing::warn!(time_left = ?go_away.time_left, "server will close the session soon");
        }

        if self.tool_call.is_some() {
            tracing::debug!("ignoring tool call");
        }

        let Some(content) = self.server_content else {
            return events;
        };

        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(StreamEvent::TextDelta {
                speaker: Speaker::Agent,
                text: t.text,
            });
        }
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(StreamEvent::TextDelta {
                speaker: Speaker::User,
                text: t.text,
            });
        }

        if content.turn_complete {
            events.push(StreamEvent::TurnComplete);
        }

        if let Some(turn) = content.model_turn {
            for blob in turn.parts.into_iter().filter_map(|p| p.inline_data) {
                if !blob.mime_type.to_ascii_lowercase().starts_with("audio/") {
                    tracing::debug!(mime = %blob.mime_type, "ignoring non-audio inline data");
                    continue;
                }
                events.push(StreamEvent::AudioChunk {
                    payload: WireChunk::new(
                        normalize_audio_mime(&blob.mime_type, inbound_rate),
                        blob.data,
                    ),
                });
            }
        }

        if content.interrupted {
            events.push(StreamEvent::Interrupted);
        }

        events
    }
}
