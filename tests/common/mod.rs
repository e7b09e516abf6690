//! Shared test utilities
//!
//! Fakes for the three session seams (capture, connector, output device) so
//! the controller can be driven without audio hardware or a network.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use prep_voice::voice::codec::{AudioFrame, encode};
use prep_voice::voice::{
    CaptureSource, FrameStream, OutputDevice, PlaybackHandle, PlaybackNotice, ScheduledBuffer,
    WireChunk,
};
use prep_voice::{
    Connection, Connector, Error, Result, SessionController, SessionHandle, SessionSetup,
    SessionState, SessionTransport, StreamEvent,
};

pub const WAIT: Duration = Duration::from_secs(2);

/// Setup used by every test session
#[must_use]
pub fn test_setup() -> SessionSetup {
    SessionSetup {
        model: "models/test-live".to_string(),
        instructions: "What are we prepping for?".to_string(),
        voice: None,
        input_sample_rate: 16000,
        output_sample_rate: 24000,
    }
}

/// A mono 16 kHz frame of constant samples
#[must_use]
pub fn mic_frame(value: i16) -> AudioFrame {
    AudioFrame::mono(vec![value; 4096], 16000).unwrap()
}

/// Encoded 24 kHz agent speech lasting `ms` milliseconds
#[must_use]
pub fn speech_chunk(ms: usize) -> WireChunk {
    encode(&AudioFrame::mono(vec![500; 24 * ms], 24000).unwrap())
}

/// Poll `check` until it holds or the wait expires
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Await a future with the shared test timeout
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut)
        .await
        .expect("timed out waiting")
}

/// Record every state change the controller publishes from now on
pub fn record_states(handle: &SessionHandle) -> Arc<Mutex<Vec<SessionState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut rx = handle.watch_state();
    drop(rx.borrow_and_update());
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = *rx.borrow_and_update();
            sink.lock().unwrap().push(state);
        }
    });
    seen
}

/// Wait until the session reaches `target`
pub async fn wait_state(handle: &SessionHandle, target: SessionState) {
    let mut rx = handle.watch_state();
    within(rx.wait_for(|s| *s == target))
        .await
        .expect("controller gone");
}

// ---------------------------------------------------------------------------
// Capture

#[derive(Default)]
struct CaptureShared {
    fail: bool,
    sender: Option<mpsc::Sender<AudioFrame>>,
    starts: usize,
    stops: usize,
    /// Blocking time spent in `stop`, like joining a device thread
    stop_delay: Duration,
}

/// Capture source fed by the test
pub struct FakeCapture {
    shared: Arc<Mutex<CaptureShared>>,
}

/// Test-side control of a [`FakeCapture`]
#[derive(Clone)]
pub struct CaptureControl {
    shared: Arc<Mutex<CaptureShared>>,
}

impl FakeCapture {
    #[must_use]
    pub fn new() -> (Self, CaptureControl) {
        let shared = Arc::new(Mutex::new(CaptureShared::default()));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            CaptureControl { shared },
        )
    }
}

impl CaptureSource for FakeCapture {
    fn start(&mut self) -> Result<FrameStream> {
        let mut shared = self.shared.lock().unwrap();
        shared.starts += 1;
        if shared.fail {
            return Err(Error::CaptureUnavailable("no input device".to_string()));
        }
        let (tx, rx) = mpsc::channel(16);
        shared.sender = Some(tx);
        Ok(ReceiverStream::new(rx))
    }

    fn stop(&mut self) {
        let delay = self.shared.lock().unwrap().stop_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut shared = self.shared.lock().unwrap();
        if shared.sender.take().is_some() {
            shared.stops += 1;
        }
    }

    fn is_capturing(&self) -> bool {
        self.shared.lock().unwrap().sender.is_some()
    }
}

impl CaptureControl {
    pub fn set_fail(&self, fail: bool) {
        self.shared.lock().unwrap().fail = fail;
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        self.shared.lock().unwrap().stop_delay = delay;
    }

    /// Emit a frame; false if capture is not running
    pub fn push(&self, frame: AudioFrame) -> bool {
        let sender = self.shared.lock().unwrap().sender.clone();
        sender.is_some_and(|tx| tx.try_send(frame).is_ok())
    }

    #[must_use]
    pub fn starts(&self) -> usize {
        self.shared.lock().unwrap().starts
    }

    #[must_use]
    pub fn stops(&self) -> usize {
        self.shared.lock().unwrap().stops
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.shared.lock().unwrap().sender.is_some()
    }
}

// ---------------------------------------------------------------------------
// Transport

/// Records everything the controller sends
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<WireChunk>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    close_delay: Mutex<Duration>,
}

impl FakeTransport {
    /// Make `close` take a while, as a real handshake does
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = delay;
    }

    #[must_use]
    pub fn sent(&self) -> Vec<WireChunk> {
        self.sent.lock().unwrap().clone()
    }

    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionTransport for FakeTransport {
    fn send(&self, chunk: WireChunk) {
        if !self.is_closed() {
            self.sent.lock().unwrap().push(chunk);
        }
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.close_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One opened fake connection, as seen from the remote side
pub struct Link {
    pub events: mpsc::Sender<StreamEvent>,
    pub transport: Arc<FakeTransport>,
    pub setup: SessionSetup,
}

impl Link {
    pub async fn emit(&self, event: StreamEvent) {
        self.events.send(event).await.expect("controller dropped events");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Succeed,
    Fail,
    /// Never completes
    Hang,
}

/// Connector whose outcome the test chooses
pub struct ScriptedConnector {
    mode: Mutex<ConnectMode>,
    opens: AtomicUsize,
    links: mpsc::UnboundedSender<Link>,
}

impl ScriptedConnector {
    #[must_use]
    pub fn new(mode: ConnectMode) -> (Arc<Self>, mpsc::UnboundedReceiver<Link>) {
        let (links, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                mode: Mutex::new(mode),
                opens: AtomicUsize::new(0),
                links,
            }),
            rx,
        )
    }

    pub fn set_mode(&self, mode: ConnectMode) {
        *self.mode.lock().unwrap() = mode;
    }

    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, setup: &SessionSetup) -> Result<Connection> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();

        match mode {
            ConnectMode::Fail => Err(Error::Transport("connection refused".to_string())),
            ConnectMode::Hang => std::future::pending().await,
            ConnectMode::Succeed => {
                let (events_tx, events_rx) = mpsc::channel(64);
                let transport = Arc::new(FakeTransport::default());
                let _ = self.links.send(Link {
                    events: events_tx,
                    transport: Arc::clone(&transport),
                    setup: setup.clone(),
                });
                Ok(Connection {
                    transport,
                    events: events_rx,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Output

/// Output device with a hand-driven clock that records calls
#[derive(Default)]
pub struct ManualOutput {
    now: Mutex<Duration>,
    played: Mutex<Vec<(PlaybackHandle, Duration, Duration)>>,
    stopped: Mutex<Vec<PlaybackHandle>>,
    notifiers: Mutex<Vec<(PlaybackHandle, mpsc::UnboundedSender<PlaybackNotice>)>>,
}

impl ManualOutput {
    pub fn set_now(&self, now: Duration) {
        *self.now.lock().unwrap() = now;
    }

    /// `(handle, start, duration)` for every accepted buffer
    #[must_use]
    pub fn played(&self) -> Vec<(PlaybackHandle, Duration, Duration)> {
        self.played.lock().unwrap().clone()
    }

    #[must_use]
    pub fn stopped(&self) -> Vec<PlaybackHandle> {
        self.stopped.lock().unwrap().clone()
    }

    /// Report a buffer as finished
    pub fn finish(&self, handle: PlaybackHandle) {
        let notifiers = self.notifiers.lock().unwrap();
        if let Some((_, tx)) = notifiers.iter().find(|(h, _)| *h == handle) {
            let _ = tx.send(PlaybackNotice::Finished(handle));
        }
    }
}

impl OutputDevice for ManualOutput {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    fn play(&self, buffer: ScheduledBuffer) -> Result<()> {
        self.played
            .lock()
            .unwrap()
            .push((buffer.handle, buffer.start_at, buffer.frame.duration()));
        self.notifiers
            .lock()
            .unwrap()
            .push((buffer.handle, buffer.notify));
        Ok(())
    }

    fn stop(&self, handle: PlaybackHandle) {
        self.stopped.lock().unwrap().push(handle);
    }
}

// ---------------------------------------------------------------------------
// Session

/// A running controller wired to fakes
pub struct Harness {
    pub handle: SessionHandle,
    pub capture: CaptureControl,
    pub connector: Arc<ScriptedConnector>,
    pub links: mpsc::UnboundedReceiver<Link>,
    pub output: Arc<ManualOutput>,
}

impl Harness {
    #[must_use]
    pub fn spawn(mode: ConnectMode) -> Self {
        let (capture, control) = FakeCapture::new();
        let (connector, links) = ScriptedConnector::new(mode);
        let output = Arc::new(ManualOutput::default());

        let handle = SessionController::new(
            Box::new(capture),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::clone(&output) as Arc<dyn OutputDevice>,
            test_setup(),
        )
        .spawn();

        Self {
            handle,
            capture: control,
            connector,
            links,
            output,
        }
    }

    /// Next connection the controller opened
    pub async fn next_link(&mut self) -> Link {
        within(self.links.recv()).await.expect("connector dropped")
    }

    /// Start a session and bring it to `Active`
    pub async fn open_active(&mut self) -> Link {
        self.handle.start().await.unwrap();
        let link = self.next_link().await;
        link.emit(StreamEvent::Opened).await;
        wait_state(&self.handle, SessionState::Active).await;
        link
    }
}
