//! Session controller task
//!
//! All session state lives inside one task. Commands, connect results,
//! transport events and playback notices are handled one at a time, so an
//! interruption has fully silenced playback before the next chunk is read.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::{LiveTranscript, NoticeKind, SessionNotice, SessionState, TranscriptAssembler};
use crate::transport::{Connection, Connector, SessionSetup, SessionTransport, StreamEvent};
use crate::voice::codec;
use crate::voice::{CaptureSource, FrameStream, OutputDevice, PlaybackScheduler};
use crate::{Error, Result};

const COMMAND_QUEUE: usize = 16;
const NOTICE_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Shutdown,
}

type ConnectResult = (u64, Result<Connection>);

/// Owns the devices and the connection for successive sessions
pub struct SessionController {
    capture: Option<Box<dyn CaptureSource>>,
    connector: Arc<dyn Connector>,
    setup: SessionSetup,
    scheduler: PlaybackScheduler,
    assembler: TranscriptAssembler,

    state_tx: watch::Sender<SessionState>,
    transcript_tx: watch::Sender<LiveTranscript>,
    notices: broadcast::Sender<SessionNotice>,

    /// Bumped on every start; connect results from older attempts are stale
    generation: u64,
    session_id: Option<Uuid>,
    connecting: Option<JoinHandle<()>>,
    connected_tx: mpsc::UnboundedSender<ConnectResult>,
    connected_rx: mpsc::UnboundedReceiver<ConnectResult>,

    /// Captured frames held until the session is accepted
    frames: Option<FrameStream>,
    transport: Option<Arc<dyn SessionTransport>>,
    events: Option<mpsc::Receiver<StreamEvent>>,
    pump: Option<JoinHandle<()>>,
}

impl SessionController {
    #[must_use]
    pub fn new(
        capture: Box<dyn CaptureSource>,
        connector: Arc<dyn Connector>,
        output: Arc<dyn OutputDevice>,
        setup: SessionSetup,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (transcript_tx, _) = watch::channel(LiveTranscript::default());
        let (notices, _) = broadcast::channel(NOTICE_QUEUE);
        let (connected_tx, connected_rx) = mpsc::unbounded_channel();

        Self {
            capture: Some(capture),
            connector,
            setup,
            scheduler: PlaybackScheduler::new(output),
            assembler: TranscriptAssembler::new(),
            state_tx,
            transcript_tx,
            notices,
            generation: 0,
            session_id: None,
            connecting: None,
            connected_tx,
            connected_rx,
            frames: None,
            transport: None,
            events: None,
            pump: None,
        }
    }

    /// Run the controller on the current runtime
    #[must_use]
    pub fn spawn(self) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let state = self.state_tx.subscribe();
        let transcript = self.transcript_tx.subscribe();
        let notices = self.notices.clone();

        let task = tokio::spawn(self.run(commands_rx));

        SessionHandle {
            commands: commands_tx,
            state,
            transcript,
            notices,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::debug!("session controller started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start) => self.on_start().await,
                    Some(Command::Stop) => self.on_stop().await,
                    Some(Command::Shutdown) | None => break,
                },
                Some((generation, result)) = self.connected_rx.recv() => {
                    self.on_connected(generation, result).await;
                }
                event = next_event(self.events.as_mut()) => {
                    let event = event.unwrap_or_else(|| StreamEvent::Closed {
                        reason: "event stream ended".to_string(),
                    });
                    self.on_event(event).await;
                }
                Some(notice) = self.scheduler.next_notice() => {
                    self.scheduler.handle_notice(&notice);
                }
            }
        }

        self.teardown(None).await;
        tracing::debug!("session controller stopped");
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            tracing::info!(from = %previous, to = %next, "session state changed");
        }
    }

    fn publish_transcript(&self) {
        self.transcript_tx
            .send_replace(LiveTranscript::from_assembler(&self.assembler));
    }

    fn notify(&self, notice: SessionNotice) {
        tracing::warn!(kind = ?notice.kind, message = %notice.message, "session ended");
        // no subscribers is fine
        let _ = self.notices.send(notice);
    }

    async fn on_start(&mut self) {
        if self.state() != SessionState::Idle {
            tracing::debug!(state = %self.state(), "start while running, stopping instead");
            self.on_stop().await;
            return;
        }

        self.generation += 1;
        let session_id = Uuid::new_v4();
        self.session_id = Some(session_id);
        tracing::info!(%session_id, "starting session");
        self.assembler = TranscriptAssembler::new();
        self.publish_transcript();
        self.set_state(SessionState::Opening);

        match self.start_capture().await {
            Ok(frames) => self.frames = Some(frames),
            Err(e) => {
                self.notify(SessionNotice::new(NoticeKind::CaptureUnavailable, e.to_string()));
                self.set_state(SessionState::Idle);
                return;
            }
        }

        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let setup = self.setup.clone();
        let connected = self.connected_tx.clone();
        self.connecting = Some(tokio::spawn(async move {
            let result = connector.open(&setup).await;
            let _ = connected.send((generation, result));
        }));
    }

    /// Open the input device off the runtime threads
    async fn start_capture(&mut self) -> Result<FrameStream> {
        let Some(mut capture) = self.capture.take() else {
            return Err(Error::CaptureUnavailable("capture source was lost".to_string()));
        };

        let joined = tokio::task::spawn_blocking(move || {
            let result = capture.start();
            (capture, result)
        })
        .await;

        match joined {
            Ok((capture, result)) => {
                self.capture = Some(capture);
                result
            }
            Err(e) => Err(Error::CaptureUnavailable(format!("capture start panicked: {e}"))),
        }
    }

    /// Release the input device off the runtime threads
    async fn stop_capture(&mut self) {
        let Some(mut capture) = self.capture.take() else {
            return;
        };

        let joined = tokio::task::spawn_blocking(move || {
            capture.stop();
            capture
        })
        .await;

        match joined {
            Ok(capture) => self.capture = Some(capture),
            Err(e) => tracing::error!(error = %e, "capture stop panicked, capture disabled"),
        }
    }

    async fn on_stop(&mut self) {
        match self.state() {
            SessionState::Idle | SessionState::Closing => {}
            SessionState::Opening | SessionState::Active => self.teardown(None).await,
        }
    }

    async fn on_connected(&mut self, generation: u64, result: Result<Connection>) {
        if generation != self.generation || self.state() != SessionState::Opening {
            if let Ok(connection) = result {
                tracing::debug!(generation, "discarding stale connection");
                tokio::spawn(async move { connection.transport.close().await });
            }
            return;
        }

        self.connecting = None;

        match result {
            Ok(connection) => {
                tracing::debug!("connected, waiting for session acceptance");
                self.transport = Some(connection.transport);
                self.events = Some(connection.events);
            }
            Err(e) => {
                self.teardown(Some(SessionNotice::new(NoticeKind::ConnectFailed, e.to_string())))
                    .await;
            }
        }
    }

    async fn on_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Opened => self.on_opened(),
            StreamEvent::TextDelta { speaker, text } => {
                self.assembler.push(speaker, &text);
                self.publish_transcript();
            }
            StreamEvent::AudioChunk { payload } => {
                self.scheduler.enqueue(&payload);
            }
            StreamEvent::TurnComplete => {
                self.assembler.commit();
                self.publish_transcript();
            }
            StreamEvent::Interrupted => self.scheduler.interrupt(),
            StreamEvent::Closed { reason } => {
                self.teardown(Some(SessionNotice::new(NoticeKind::RemoteClosed, reason)))
                    .await;
            }
            StreamEvent::TransportError { detail } => {
                self.teardown(Some(SessionNotice::new(NoticeKind::TransportError, detail)))
                    .await;
            }
        }
    }

    fn on_opened(&mut self) {
        if self.state() != SessionState::Opening {
            tracing::debug!(state = %self.state(), "ignoring duplicate open");
            return;
        }

        let (Some(frames), Some(transport)) = (self.frames.take(), self.transport.clone()) else {
            tracing::warn!("session opened without capture or transport");
            return;
        };

        self.pump = Some(tokio::spawn(pump_frames(frames, transport)));
        self.set_state(SessionState::Active);
    }

    /// Release everything in order: connection, capture, playback
    ///
    /// A voluntary stop passes through `Closing`; an involuntary end (with
    /// a notice) goes straight back to `Idle`.
    async fn teardown(&mut self, notice: Option<SessionNotice>) {
        if self.state() == SessionState::Idle {
            return;
        }
        if notice.is_none() {
            self.set_state(SessionState::Closing);
        }

        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.events = None;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }

        self.frames = None;
        self.stop_capture().await;

        self.scheduler.interrupt();
        self.assembler.discard_pending();
        self.publish_transcript();

        if let Some(notice) = notice {
            self.notify(notice);
        }
        if let Some(session_id) = self.session_id.take() {
            tracing::info!(%session_id, turns = self.assembler.history().len(), "session finished");
        }
        self.set_state(SessionState::Idle);
    }
}

async fn next_event(events: Option<&mut mpsc::Receiver<StreamEvent>>) -> Option<StreamEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Forward captured frames to the remote agent until capture ends
async fn pump_frames(mut frames: FrameStream, transport: Arc<dyn SessionTransport>) {
    let mut sent: u64 = 0;
    while let Some(frame) = frames.next().await {
        transport.send(codec::encode(&frame));
        sent += 1;
    }
    tracing::debug!(sent, "capture stream ended");
}

/// Caller side of a running [`SessionController`]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    transcript: watch::Receiver<LiveTranscript>,
    notices: broadcast::Sender<SessionNotice>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ControllerGone)
    }

    /// Start a session, or stop the running one
    ///
    /// # Errors
    ///
    /// Returns `ControllerGone` if the controller task has exited
    pub async fn start(&self) -> Result<()> {
        self.command(Command::Start).await
    }

    /// Stop the running session; no-op when idle
    ///
    /// # Errors
    ///
    /// Returns `ControllerGone` if the controller task has exited
    pub async fn stop(&self) -> Result<()> {
        self.command(Command::Stop).await
    }

    /// Stop any session and wait for the controller to exit
    ///
    /// # Errors
    ///
    /// Returns `ControllerGone` if the controller task failed
    pub async fn shutdown(self) -> Result<()> {
        // already gone is fine, the join below reports real failures
        let _ = self.commands.send(Command::Shutdown).await;
        self.task.await.map_err(|_| Error::ControllerGone)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether audio is flowing both ways
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Receiver of state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Current transcript snapshot
    #[must_use]
    pub fn transcript(&self) -> LiveTranscript {
        self.transcript.borrow().clone()
    }

    /// Receiver of transcript snapshots
    #[must_use]
    pub fn watch_transcript(&self) -> watch::Receiver<LiveTranscript> {
        self.transcript.clone()
    }

    /// Subscribe to involuntary-termination notices
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
