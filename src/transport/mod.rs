//! Duplex connection to the remote agent
//!
//! A `Connector` opens one long-lived channel per session. The resulting
//! `Connection` splits into a send side (`SessionTransport`) and an ordered
//! stream of inbound `StreamEvent`s.

mod live;
pub mod protocol;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use live::{LiveConnector, LiveTransport};

use crate::Result;
use crate::voice::WireChunk;

/// Who a transcript delta belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Speaker {
    /// The local user (transcribed microphone audio)
    User,
    /// The remote agent (transcribed synthesized speech)
    Agent,
}

/// One inbound event, in transport order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental transcript text
    TextDelta { speaker: Speaker, text: String },
    /// A piece of synthesized speech
    AudioChunk { payload: WireChunk },
    /// The current turn is finished
    TurnComplete,
    /// The user talked over the agent; playback must stop
    Interrupted,
    /// The remote side accepted the session
    Opened,
    /// The connection ended
    Closed { reason: String },
    /// The connection failed
    TransportError { detail: String },
}

impl StreamEvent {
    /// Whether this event ends the event stream
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::TransportError { .. })
    }
}

/// Static session-open configuration sent once to the remote agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    /// Remote model identifier
    pub model: String,
    /// Behavioral instructions; opaque to this crate
    pub instructions: String,
    /// Prebuilt voice name, if any
    pub voice: Option<String>,
    /// Outbound audio rate
    pub input_sample_rate: u32,
    /// Expected inbound audio rate
    pub output_sample_rate: u32,
}

/// Send side of an open session
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Queue an audio frame for the remote agent
    ///
    /// Never blocks. Frames sent before the session is accepted are held;
    /// frames sent after close are dropped with a warning.
    fn send(&self, chunk: WireChunk);

    /// Request a graceful shutdown; safe to call repeatedly
    async fn close(&self);

    /// Whether the channel has been closed from either side
    fn is_closed(&self) -> bool;
}

/// An opened channel: the send side and the inbound event stream
pub struct Connection {
    pub transport: Arc<dyn SessionTransport>,
    /// Ends after `Closed` or `TransportError`
    pub events: mpsc::Receiver<StreamEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.transport.is_closed())
            .finish_non_exhaustive()
    }
}

/// Opens sessions with the remote agent
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a new connection and send the setup payload
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the connection cannot be established
    async fn open(&self, setup: &SessionSetup) -> Result<Connection>;
}
