//! Thin duplex channel over the persistent recognition connection.
//!
//! The session writes through it only from the audio sender and reads
//! from it only in the result receiver, so each half needs no locking
//! beyond its own mutex.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, CONTENT_TYPE};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};
use tracing::debug;

use crate::config::AsrConfig;
use crate::error::AsrError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, tungstenite::Message>;
type WsSource = SplitStream<WsStream>;

/// What a single `receive` call produced.
#[derive(Debug)]
pub enum TransportEvent {
    /// A text message from the service.
    Text(String),
    /// The connection ended, locally or remotely.
    Closed,
    /// The connection failed.
    Failed(String),
}

/// Send/receive/close primitives over the persistent connection.
#[async_trait]
pub trait AsrTransport: Send + Sync + 'static {
    async fn send_text(&self, text: String) -> Result<(), AsrError>;
    async fn send_binary(&self, data: Vec<u8>) -> Result<(), AsrError>;
    /// Blocks until a message, closure, or error is available.
    async fn receive(&self) -> TransportEvent;
    /// Idempotent: the underlying teardown runs exactly once, and a
    /// blocked `receive` is woken with [`TransportEvent::Closed`].
    async fn close(&self);
}

/// WebSocket transport to the DashScope inference endpoint.
pub struct WsTransport {
    sink: Mutex<WsSink>,
    source: Mutex<WsSource>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl WsTransport {
    /// Opens the authorized connection. Connection parameters (model,
    /// api_key) travel as query parameters, credentials also as a
    /// Bearer header.
    pub async fn connect(config: &AsrConfig) -> Result<Self, AsrError> {
        let url = format!(
            "{}?model={}&api_key={}",
            config.endpoint,
            urlencoding::encode(&config.model),
            urlencoding::encode(&config.api_key),
        );

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AsrError::Connect(format!("invalid endpoint: {e}")))?;
        let bearer = format!("Bearer {}", config.api_key)
            .parse::<HeaderValue>()
            .map_err(|_| AsrError::Connect("API key is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| AsrError::Connect(e.to_string()))?;
        debug!(endpoint = %config.endpoint, "websocket connected");

        let (sink, source) = stream.split();
        let (close_tx, _) = watch::channel(false);
        Ok(Self {
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            closed: AtomicBool::new(false),
            close_tx,
        })
    }

    fn send_error(e: tungstenite::Error) -> AsrError {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                AsrError::TransportClosed
            }
            other => AsrError::Transport(other.to_string()),
        }
    }
}

#[async_trait]
impl AsrTransport for WsTransport {
    async fn send_text(&self, text: String) -> Result<(), AsrError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AsrError::TransportClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(tungstenite::Message::Text(text.into()))
            .await
            .map_err(Self::send_error)
    }

    async fn send_binary(&self, data: Vec<u8>) -> Result<(), AsrError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AsrError::TransportClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(tungstenite::Message::Binary(data.into()))
            .await
            .map_err(Self::send_error)
    }

    async fn receive(&self) -> TransportEvent {
        let mut close_rx = self.close_tx.subscribe();
        let mut source = self.source.lock().await;
        loop {
            let event = tokio::select! {
                _ = close_rx.wait_for(|closed| *closed) => Some(TransportEvent::Closed),
                message = source.next() => match message {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        Some(TransportEvent::Text(text.to_string()))
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        Some(TransportEvent::Closed)
                    }
                    // Ping/pong are handled by tungstenite itself; the
                    // service never sends binary frames.
                    Some(Ok(_)) => None,
                    Some(Err(e)) => Some(TransportEvent::Failed(e.to_string())),
                },
            };
            if let Some(event) = event {
                return event;
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.close_tx.send(true);
        let mut sink = self.sink.lock().await;
        let _ = sink.send(tungstenite::Message::Close(None)).await;
        let _ = sink.close().await;
        debug!("websocket closed");
    }
}
