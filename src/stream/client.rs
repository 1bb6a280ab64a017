//! Websocket implementation of [`Transport`].
//!
//! `connect` opens the socket, authenticates, and then hands the socket to a
//! background pump task. The pump forwards outbound command text, answers
//! pings and pushes inbound text frames into the connection. It exits on
//! close, socket error, EOF or when the client side disconnects.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use secrecy::ExposeSecret;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};

use crate::auth::ConnectionCredentials;
use crate::retry::with_timeout;
use crate::stream::decoder::{decode_frame, InboundFrame};
use crate::stream::proto::{AuthReply, ClientMessage};
use crate::stream::transport::{duplex, ConnectError, Connection, Transport, TransportPeer};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Production sync server endpoint.
pub const SYNC_ENDPOINT: &str = "wss://api.syncano.com:8200";
/// Local development sync server endpoint.
pub const LOCAL_SYNC_ENDPOINT: &str = "ws://localhost:8200";

/// Opens authenticated websocket connections to the sync server.
#[derive(Clone, Debug)]
pub struct WebSocketTransport {
    local: bool,
    endpoint_override: Option<String>,
    connect_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            local: false,
            endpoint_override: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit endpoint. Takes precedence over local mode.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim().to_string());
        self
    }

    /// Bounds the socket open plus the auth round trip.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint;
        }
        if self.local {
            LOCAL_SYNC_ENDPOINT
        } else {
            SYNC_ENDPOINT
        }
    }

    async fn open(&self, credentials: &ConnectionCredentials) -> Result<Connection, ConnectError> {
        let (mut socket, _) = connect_async(self.endpoint())
            .await
            .map_err(map_socket_error)?;

        let auth = ClientMessage::Auth {
            instance: credentials.instance.clone(),
            api_key: credentials.api_key.expose_secret().clone(),
            auth_key: credentials
                .auth_key
                .as_ref()
                .map(|key| key.expose_secret().clone()),
        };
        let text = auth
            .to_text()
            .map_err(|err| ConnectError::Handshake(err.to_string()))?;
        socket.send(Message::Text(text.into())).await?;

        let reply = recv_auth_reply(&mut socket).await?;
        if !reply.is_ok() {
            return Err(ConnectError::Rejected(reply.reason()));
        }

        let (connection, peer) = duplex();
        let connection = connection.with_session_id(reply.uuid);
        info!(
            event = "sync_socket_open",
            endpoint = self.endpoint(),
            instance = %credentials.instance
        );
        tokio::spawn(pump_socket(socket, peer));
        Ok(connection)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        credentials: &ConnectionCredentials,
    ) -> Result<Connection, ConnectError> {
        with_timeout(self.connect_timeout, self.open(credentials))
            .await
            .map_err(|_| ConnectError::Timeout(self.connect_timeout))?
    }
}

fn map_socket_error(err: WsError) -> ConnectError {
    match err {
        WsError::Io(io) => ConnectError::Unreachable(io.to_string()),
        other => ConnectError::WebSocket(other),
    }
}

async fn recv_auth_reply<S>(socket: &mut S) -> Result<AuthReply, ConnectError>
where
    S: futures_util::Sink<Message, Error = WsError>
        + Stream<Item = Result<Message, WsError>>
        + Unpin,
{
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                Ok(Some(InboundFrame::Auth(reply))) => return Ok(reply),
                Ok(Some(InboundFrame::Ping)) | Ok(None) => {}
                Ok(Some(_)) => {
                    return Err(ConnectError::Handshake(
                        "received notification before auth reply".to_string(),
                    ));
                }
                Err(err) => return Err(ConnectError::Handshake(err.to_string())),
            },
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err(ConnectError::Handshake(
                    "socket closed before auth reply".to_string(),
                ));
            }
            Some(Ok(_)) => {
                return Err(ConnectError::Handshake(
                    "received non-text frame before auth reply".to_string(),
                ));
            }
            Some(Err(err)) => return Err(ConnectError::WebSocket(err)),
            None => {
                return Err(ConnectError::Handshake(
                    "socket ended before auth reply".to_string(),
                ));
            }
        }
    }
}

async fn pump_socket<S>(mut socket: S, mut peer: TransportPeer)
where
    S: futures_util::Sink<Message, Error = WsError>
        + Stream<Item = Result<Message, WsError>>
        + Unpin,
{
    loop {
        tokio::select! {
            _ = peer.closed.cancelled() => {
                let _ = socket.close().await;
                debug!(event = "sync_socket_closed_by_client");
                return;
            }
            maybe_command = peer.commands.recv() => {
                let Some(text) = maybe_command else {
                    let _ = socket.close().await;
                    return;
                };
                if let Err(err) = socket.send(Message::Text(text.into())).await {
                    debug!(event = "sync_socket_send_failed", error = %err);
                    break;
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        if !peer.push(text.to_string()) {
                            let _ = socket.close().await;
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(event = "sync_socket_read_failed", error = %err);
                        break;
                    }
                }
            }
        }
    }
    debug!(event = "sync_socket_dropped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{WebSocketTransport, LOCAL_SYNC_ENDPOINT, SYNC_ENDPOINT};

    #[test]
    fn uses_production_endpoint_by_default() {
        assert_eq!(WebSocketTransport::new().endpoint(), SYNC_ENDPOINT);
    }

    #[test]
    fn uses_local_endpoint_when_enabled() {
        let transport = WebSocketTransport::new().with_local_mode(true);
        assert_eq!(transport.endpoint(), LOCAL_SYNC_ENDPOINT);
    }

    #[test]
    fn endpoint_override_takes_precedence() {
        let transport = WebSocketTransport::new()
            .with_local_mode(true)
            .with_endpoint("  ws://sync-dev.example:8200   \n")
            .with_connect_timeout(Duration::from_millis(250));
        assert_eq!(transport.endpoint(), "ws://sync-dev.example:8200");
    }
}
