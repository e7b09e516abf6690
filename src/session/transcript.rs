//! Turn-by-turn transcript assembly
//!
//! Transcription arrives as small deltas for both speakers. Deltas are
//! concatenated into the in-progress turn; a turn-complete signal moves the
//! pair into the history.

use chrono::{DateTime, Utc};

use crate::transport::Speaker;

/// One committed exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub user: String,
    pub agent: String,
    pub committed_at: DateTime<Utc>,
}

/// Accumulators for the turn in progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnBuffer {
    pub user: String,
    pub agent: String,
}

impl TurnBuffer {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.agent.is_empty()
    }
}

/// Builds the session history from transcript deltas
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    buffer: TurnBuffer,
    history: Vec<Turn>,
}

impl TranscriptAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta to the speaker's buffer
    pub fn push(&mut self, speaker: Speaker, text: &str) {
        match speaker {
            Speaker::User => self.buffer.user.push_str(text),
            Speaker::Agent => self.buffer.agent.push_str(text),
        }
    }

    /// Move the buffered pair into the history and clear both buffers
    ///
    /// Empty buffers still produce a turn.
    pub fn commit(&mut self) -> &Turn {
        let TurnBuffer { user, agent } = std::mem::take(&mut self.buffer);
        self.history.push(Turn {
            user,
            agent,
            committed_at: Utc::now(),
        });
        tracing::debug!(turns = self.history.len(), "turn committed");
        &self.history[self.history.len() - 1]
    }

    /// Drop any uncommitted text
    pub fn discard_pending(&mut self) {
        if !self.buffer.is_empty() {
            tracing::debug!(
                user_chars = self.buffer.user.len(),
                agent_chars = self.buffer.agent.len(),
                "discarding uncommitted turn"
            );
        }
        self.buffer = TurnBuffer::default();
    }

    #[must_use]
    pub const fn pending(&self) -> &TurnBuffer {
        &self.buffer
    }

    #[must_use]
    pub fn history(&self) -> &[Turn] {
        &self.history
    }
}
