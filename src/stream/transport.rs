//! Transport contract between the session controller and the push channel.
//!
//! A [`Transport`] opens one authenticated duplex [`Connection`] per call.
//! The connection is a pair of channels: outbound command text goes through a
//! cloneable [`FrameSender`], inbound text frames arrive as [`RawMessage`]s
//! from [`Connection::recv`]. The inbound sequence ending is the drop signal;
//! it is not an error.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthError, ConnectionCredentials};
use crate::stream::proto::ClientMessage;

/// Opaque inbound text frame.
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub text: String,
    pub received_at: Instant,
}

impl RawMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: Instant::now(),
        }
    }
}

/// Opens connections to the push endpoint.
///
/// Implementations perform network I/O and the authentication handshake
/// only; retry policy belongs to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, credentials: &ConnectionCredentials)
        -> Result<Connection, ConnectError>;
}

/// Cloneable sender for outbound command frames.
#[derive(Clone, Debug)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<String>,
}

impl FrameSender {
    /// Queues raw text for transmission.
    pub fn send_text(&self, text: String) -> Result<(), SendError> {
        self.tx.send(text).map_err(|_| SendError::Closed)
    }

    /// Serializes and queues a client message.
    pub fn send(&self, message: &ClientMessage) -> Result<(), SendError> {
        let text = message
            .to_text()
            .map_err(|err| SendError::Encode(err.to_string()))?;
        self.send_text(text)
    }
}

/// One live, authenticated connection.
///
/// Dropping the connection disconnects it.
#[derive(Debug)]
pub struct Connection {
    sender: FrameSender,
    frames: mpsc::UnboundedReceiver<RawMessage>,
    closed: CancellationToken,
    session_id: Option<String>,
}

impl Connection {
    /// Server-assigned identifier from the handshake, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Returns a cloneable sender for outbound commands.
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Receives the next inbound frame.
    ///
    /// Returns `None` once the connection has dropped or was disconnected.
    pub async fn recv(&mut self) -> Option<RawMessage> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            frame = self.frames.recv() => frame,
        }
    }

    /// Releases the connection. Safe to call more than once.
    pub fn disconnect(&self) {
        self.closed.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Far side of a [`Connection`], held by whatever moves bytes on the wire.
#[derive(Debug)]
pub struct TransportPeer {
    /// Outbound command text written by the client.
    pub commands: mpsc::UnboundedReceiver<String>,
    /// Inbound frames delivered to the client.
    pub frames: mpsc::UnboundedSender<RawMessage>,
    /// Fires when the client side disconnects.
    pub closed: CancellationToken,
}

impl TransportPeer {
    /// Delivers an inbound text frame. Returns `false` once the client is gone.
    pub fn push(&self, text: impl Into<String>) -> bool {
        !self.closed.is_cancelled() && self.frames.send(RawMessage::new(text)).is_ok()
    }
}

/// Creates a connected [`Connection`] / [`TransportPeer`] pair.
pub fn duplex() -> (Connection, TransportPeer) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    let connection = Connection {
        sender: FrameSender { tx: command_tx },
        frames: frame_rx,
        closed: closed.clone(),
        session_id: None,
    };
    let peer = TransportPeer {
        commands: command_rx,
        frames: frame_tx,
        closed,
    };
    (connection, peer)
}

/// Errors produced while opening a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("credentials unavailable: {0}")]
    Auth(#[from] AuthError),

    #[error("authentication rejected: {0}")]
    Rejected(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
}

/// Errors produced when a command cannot be transmitted.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SendError {
    #[error("connection closed")]
    Closed,

    #[error("failed to encode command: {0}")]
    Encode(String),
}
