//! Realtime sync modules.
//!
//! - `transport`: connection contract and in-memory duplex channel.
//! - `client`: websocket transport with the auth handshake.
//! - `proto`: client commands and server control replies.
//! - `notification` / `decoder`: typed notifications and frame decoding.
//! - `registry`: declarative subscription set with replay.
//! - `dispatch`: observer registration and the error stream.
//! - `session`: lifecycle state machine with reconnect-and-replay.

/// Websocket transport.
pub mod client;
/// Inbound frame decoding.
pub mod decoder;
/// Observer fan-out and the error stream item type.
pub mod dispatch;
/// Typed notification values.
pub mod notification;
/// Wire protocol messages.
pub mod proto;
/// Subscription bookkeeping.
pub mod registry;
/// Session controller.
pub mod session;
/// Transport contract and duplex connection.
pub mod transport;
