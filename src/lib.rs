//! Realtime subscription client for the Syncano sync server.
//!
//! The crate is organized by concern:
//! - `stream`: push-channel transport, subscription registry, notification
//!   decoding, observer dispatch and the session controller.
//! - `auth`: credential providers consulted before every connect.
//! - `record`: canonical record shapes carried by notifications.
//! - `config`: session options and defaults.
//! - `retry`: shared retry, backoff and timeout utilities.

/// Credential providers and the HTTP user login helper.
pub mod auth;
/// Session options and their defaults.
pub mod config;
/// Canonical record shapes and lenient field decoders.
pub mod record;
/// Retry and timeout helpers used across the crate.
pub mod retry;
/// Realtime transport, subscriptions, decoding and dispatch.
pub mod stream;

pub use auth::{ApiKeyAuthenticator, AuthError, Authenticator, ConnectionCredentials};
pub use config::SyncOptions;
pub use stream::client::WebSocketTransport;
pub use stream::dispatch::{EventDispatcher, ObserverHandle, ObserverKind, SyncError};
pub use stream::notification::Notification;
pub use stream::registry::{Delivery, SubscribeError, SubscriptionRequest};
pub use stream::session::{ConnectionState, StartError, SyncSession};
