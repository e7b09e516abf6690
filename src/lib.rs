//! prep-voice - duplex voice sessions with a kitchen prep agent
//!
//! This library provides the real-time core of a spoken prep-planning
//! conversation:
//! - Microphone capture framed as 16 kHz PCM16
//! - A Live API WebSocket session carrying audio and transcripts both ways
//! - Gapless, interruptible playback of the agent's speech
//! - Turn-by-turn transcript assembly
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  frames   ┌──────────────┐   JSON/WS   ┌──────────────┐
//! │   Capture    ├──────────►│              ├────────────►│              │
//! └──────────────┘           │   Session    │             │  Live agent  │
//! ┌──────────────┐  chunks   │  controller  │   events    │              │
//! │  Scheduler   │◄──────────┤              │◄────────────┤              │
//! └──────────────┘           └──────┬───────┘             └──────────────┘
//!                                   │ deltas
//!                            ┌──────▼───────┐
//!                            │  Transcript  │
//!                            └──────────────┘
//! ```

pub mod config;
pub mod error;
pub mod instructions;
pub mod session;
pub mod transport;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use instructions::{MenuMix, PrepContext, build_instructions};
pub use session::{
    LiveTranscript, NoticeKind, SessionController, SessionHandle, SessionNotice, SessionState,
    Turn,
};
pub use transport::{
    Connection, Connector, LiveConnector, SessionSetup, SessionTransport, Speaker, StreamEvent,
};
