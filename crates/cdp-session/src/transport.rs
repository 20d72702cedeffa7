//! Transport boundary: one persistent bidirectional text-message channel.
//!
//! The engine consumes this as an opaque capability; byte-level concerns
//! (TLS, framing, keep-alive) stay behind the trait. `WebSocketTransport` is
//! the production implementation, `ChannelTransport` a fully in-memory pair
//! for tests and embedding, `NoopTransport` an explicit never-connected
//! stand-in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::SessionError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Send/receive capability over one persistent connection.
///
/// `next_message` yields inbound text frames in wire arrival order and
/// returns `None` once the connection is gone for good.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection. Calling it again once open is a no-op.
    async fn start(&self) -> Result<(), SessionError>;

    /// Ship one outbound text frame.
    async fn send_text(&self, text: String) -> Result<(), SessionError>;

    /// Next inbound text frame, `None` on a dead connection.
    async fn next_message(&self) -> Option<String>;

    /// Tear the connection down. Safe to call more than once.
    async fn close(&self);

    fn is_connected(&self) -> bool;
}

/// Transport that is never connected: sends fail and no message ever
/// arrives. Stands in where a session object is needed without a browser.
#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn start(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn send_text(&self, _text: String) -> Result<(), SessionError> {
        Err(SessionError::transport("no transport available"))
    }

    async fn next_message(&self) -> Option<String> {
        std::future::pending().await
    }

    async fn close(&self) {}

    fn is_connected(&self) -> bool {
        false
    }
}

/// WebSocket client transport for a DevTools endpoint.
///
/// The read half runs on its own task and only forwards frames into a
/// bounded channel; it never executes application logic.
pub struct WebSocketTransport {
    url: String,
    connected: AtomicBool,
    writer: Mutex<Option<WsSink>>,
    inbound: Mutex<Option<mpsc::Receiver<String>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connected: AtomicBool::new(false),
            writer: Mutex::new(None),
            inbound: Mutex::new(None),
            reader_task: Mutex::new(None),
            stop: CancellationToken::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn run_reader(mut source: WsSource, tx: mpsc::Sender<String>, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                frame = source.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            if tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => continue,
                    },
                    Some(Ok(WsMessage::Close(_))) => {
                        info!(target: "cdp-transport", "connection closed by remote");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(target: "cdp-transport", ?err, "read failure, stopping reader");
                        break;
                    }
                    None => break,
                }
            }
        }
        // Dropping `tx` here ends the inbound stream for the consumer.
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn start(&self) -> Result<(), SessionError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (stream, _) = connect_async(&self.url).await.map_err(|err| {
            SessionError::transport(format!("connect {}: {err}", self.url))
        })?;
        let (sink, source) = stream.split();

        let (tx, rx) = mpsc::channel(512);
        *self.writer.lock().await = Some(sink);
        *self.inbound.lock().await = Some(rx);

        let task = tokio::spawn(Self::run_reader(source, tx, self.stop.child_token()));
        *self.reader_task.lock().await = Some(task);

        self.connected.store(true, Ordering::SeqCst);
        info!(target: "cdp-transport", url = %self.url, "devtools connection established");
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        let mut guard = self.writer.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| SessionError::transport("transport not started"))?;
        sink.send(WsMessage::Text(text.into())).await.map_err(|err| {
            self.connected.store(false, Ordering::SeqCst);
            SessionError::transport(format!("send: {err}"))
        })
    }

    async fn next_message(&self) -> Option<String> {
        let mut guard = self.inbound.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn close(&self) {
        self.stop.cancel();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// The far side of a [`ChannelTransport`] pair.
pub struct ChannelRemote {
    /// Push inbound frames (replies, events) toward the client.
    pub to_client: mpsc::Sender<String>,
    /// Frames the client sent.
    pub from_client: mpsc::Receiver<String>,
}

/// Fully in-memory transport, paired with a [`ChannelRemote`] that plays the
/// browser side. Frames keep their order in both directions.
pub struct ChannelTransport {
    connected: AtomicBool,
    inbound: Mutex<mpsc::Receiver<String>>,
    outbound: mpsc::Sender<String>,
}

impl ChannelTransport {
    pub fn pair() -> (Arc<Self>, ChannelRemote) {
        let (to_client, inbound) = mpsc::channel(64);
        let (outbound, from_client) = mpsc::channel(64);
        (
            Arc::new(Self {
                connected: AtomicBool::new(false),
                inbound: Mutex::new(inbound),
                outbound,
            }),
            ChannelRemote {
                to_client,
                from_client,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn start(&self) -> Result<(), SessionError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::transport("channel transport not started"));
        }
        self.outbound
            .send(text)
            .await
            .map_err(|_| SessionError::transport("peer dropped"))
    }

    async fn next_message(&self) -> Option<String> {
        let mut guard = self.inbound.lock().await;
        guard.recv().await
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.inbound.lock().await.close();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
