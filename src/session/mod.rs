//! Voice session lifecycle
//!
//! A session ties the microphone, the remote agent connection, the playback
//! scheduler, and the transcript together. One controller task owns all of
//! them; callers drive it through a [`SessionHandle`].

mod controller;
mod transcript;

pub use controller::{SessionController, SessionHandle};
pub use transcript::{TranscriptAssembler, Turn, TurnBuffer};

/// Lifecycle of one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Idle,
    /// Capture acquired, waiting for the remote side to accept
    Opening,
    /// Audio and transcript flowing both ways
    Active,
    /// Releasing devices and the connection
    Closing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Opening => "opening",
            Self::Active => "active",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Why a session ended without being asked to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    /// The microphone could not be opened
    CaptureUnavailable,
    /// The connection could not be established
    ConnectFailed,
    /// The remote side closed the connection
    RemoteClosed,
    /// The connection failed mid-session
    TransportError,
}

/// Non-fatal report of an involuntary session end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNotice {
    pub kind: NoticeKind,
    pub message: String,
}

impl SessionNotice {
    #[must_use]
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SessionNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Transcript snapshot for observers: committed turns plus the live buffers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveTranscript {
    pub turns: Vec<Turn>,
    /// Uncommitted user text
    pub user: String,
    /// Uncommitted agent text
    pub agent: String,
}

impl LiveTranscript {
    fn from_assembler(assembler: &TranscriptAssembler) -> Self {
        Self {
            turns: assembler.history().to_vec(),
            user: assembler.pending().user.clone(),
            agent: assembler.pending().agent.clone(),
        }
    }
}
