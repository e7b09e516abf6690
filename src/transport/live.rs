//! WebSocket connection to the Live API

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::protocol::{self, ClientMessage};
use super::{Connection, Connector, SessionSetup, SessionTransport, StreamEvent};
use crate::voice::WireChunk;
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type SocketSink = futures::stream::SplitSink<Socket, Message>;
type SocketStream = futures::stream::SplitStream<Socket>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const EVENT_QUEUE: usize = 256;

/// Opens Live API sessions over a WebSocket
pub struct LiveConnector {
    endpoint: Url,
    api_key: SecretString,
}

impl LiveConnector {
    /// Create a connector for `endpoint`
    ///
    /// # Errors
    ///
    /// Returns `Config` if the endpoint is not a `ws://` or `wss://` URL
    pub fn new(endpoint: &str, api_key: SecretString) -> Result<Self> {
        let endpoint =
            Url::parse(endpoint).map_err(|e| Error::Config(format!("invalid endpoint: {e}")))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "endpoint must use ws:// or wss://, got {}",
                endpoint.scheme()
            )));
        }
        Ok(Self { endpoint, api_key })
    }

    fn session_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("key", self.api_key.expose_secret());
        url
    }
}

impl std::fmt::Debug for LiveConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnector")
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for LiveConnector {
    async fn open(&self, setup: &SessionSetup) -> Result<Connection> {
        let host = self.endpoint.host_str().unwrap_or_default().to_string();
        tracing::info!(%host, model = %setup.model, "connecting to live session");

        let url = self.session_url();
        let (socket, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::Transport(format!("connection to {host} timed out")))?
            .map_err(|e| Error::Transport(format!("connection to {host} failed: {e}")))?;

        let (mut sink, stream) = socket.split();

        let setup_json = serde_json::to_string(&protocol::setup_message(setup))?;
        sink.send(Message::Text(setup_json))
            .await
            .map_err(|e| Error::Transport(format!("failed to send setup: {e}")))?;

        tracing::debug!("setup sent, waiting for acceptance");

        Ok(LiveTransport::spawn(sink, stream, setup.output_sample_rate))
    }
}

enum Outbound {
    Audio(WireChunk),
    Close,
}

/// Send side of a Live API session
pub struct LiveTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
    closing: watch::Sender<bool>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl LiveTransport {
    fn spawn(sink: SocketSink, stream: SocketStream, inbound_rate: u32) -> Connection {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (opened_tx, opened_rx) = watch::channel(false);
        let (closing_tx, closing_rx) = watch::channel(false);
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            opened_rx,
            closing_rx,
            Arc::clone(&closed),
            failed_tx,
        ));
        let reader = tokio::spawn(read_loop(
            stream,
            events_tx,
            opened_tx,
            Arc::clone(&closed),
            inbound_rate,
            failed_rx,
        ));

        let transport = Arc::new(Self {
            outbound: outbound_tx,
            closed,
            closing: closing_tx,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        });

        Connection {
            transport,
            events: events_rx,
        }
    }
}

#[async_trait]
impl SessionTransport for LiveTransport {
    fn send(&self, chunk: WireChunk) {
        if self.is_closed() {
            tracing::warn!("dropping audio frame, session is closed");
            return;
        }
        if self.outbound.send(Outbound::Audio(chunk)).is_err() {
            tracing::warn!("dropping audio frame, writer has stopped");
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.closing.send_replace(true) {
            return;
        }

        let _ = self.outbound.send(Outbound::Close);

        let writer = self.writer.lock().ok().and_then(|mut w| w.take());
        if let Some(mut writer) = writer {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                tracing::warn!("writer did not finish in time, aborting");
                writer.abort();
            }
        }

        tracing::debug!("live session closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for LiveTransport {
    fn drop(&mut self) {
        for slot in [&self.writer, &self.reader] {
            if let Some(task) = slot.lock().ok().and_then(|mut t| t.take()) {
                task.abort();
            }
        }
    }
}

/// Drain queued audio into the socket
///
/// A failed send closes the transport and hands the detail to the reader,
/// which ends the event stream with `TransportError`.
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut opened: watch::Receiver<bool>,
    mut closing: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
    failed: mpsc::UnboundedSender<String>,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    // Hold audio until the server accepts the setup
    let accepted = tokio::select! {
        r = opened.wait_for(|o| *o) => r.is_ok(),
        _ = closing.wait_for(|c| *c) => false,
    };

    if accepted {
        while let Some(msg) = outbound.recv().await {
            let chunk = match msg {
                Outbound::Audio(chunk) => chunk,
                Outbound::Close => break,
            };
            let text = match serde_json::to_string(&protocol::audio_message(chunk)) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode audio message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::warn!(error = %e, "failed to send audio, stopping writer");
                closed.store(true, Ordering::SeqCst);
                let _ = failed.send(e.to_string());
                return;
            }
        }
    }

    if let Err(e) = sink.send(Message::Close(None)).await {
        tracing::debug!(error = %e, "close frame not sent");
    }
    let _ = sink.close().await;
}

async fn read_loop<St, E>(
    mut stream: St,
    events: mpsc::Sender<StreamEvent>,
    opened: watch::Sender<bool>,
    closed: Arc<AtomicBool>,
    inbound_rate: u32,
    mut writer_failed: mpsc::UnboundedReceiver<String>,
) where
    St: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let terminal = loop {
        let next = tokio::select! {
            next = stream.next() => next,
            Some(detail) = writer_failed.recv() => {
                break StreamEvent::TransportError {
                    detail: format!("send failed: {detail}"),
                };
            }
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                break StreamEvent::TransportError {
                    detail: e.to_string(),
                };
            }
            None => {
                break StreamEvent::Closed {
                    reason: "connection ended".to_string(),
                };
            }
        };

        let bytes = match frame {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(frame) => {
                let reason = frame.map_or_else(
                    || "closed by server".to_string(),
                    |f| {
                        if f.reason.is_empty() {
                            format!("closed by server ({})", u16::from(f.code))
                        } else {
                            f.reason.to_string()
                        }
                    },
                );
                break StreamEvent::Closed { reason };
            }
            _ => continue,
        };

        let message = match protocol::parse_server_message(&bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable server message");
                continue;
            }
        };

        for event in message.into_events(inbound_rate) {
            if event == StreamEvent::Opened {
                opened.send_replace(true);
            }
            if events.send(event).await.is_err() {
                return;
            }
        }
    };

    closed.store(true, Ordering::SeqCst);
    tracing::info!(event = ?terminal, "live session ended");
    let _ = events.send(terminal).await;
}
