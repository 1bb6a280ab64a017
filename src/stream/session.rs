//! Session controller: connection lifecycle, reconnect-and-replay.
//!
//! [`SyncSession`] composes the transport, the subscription registry, the
//! decoder and the dispatcher. A single worker task owns the live
//! [`Connection`] and runs decode + dispatch sequentially, which keeps
//! notifications in arrival order. When the inbound sequence ends the worker
//! reconnects with backoff and replays every tracked subscription.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting -> ...
//!                      |                          |
//!                      +-------> Failed <---------+
//! ```
//!
//! `stop()` is valid from any state and ends in `Disconnected`. It interrupts
//! pending backoff waits and connect attempts.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::SyncOptions;
use crate::retry::{sleep_or_cancelled, RetryPolicy};
use crate::stream::decoder::{decode_frame, InboundFrame};
use crate::stream::dispatch::{EventDispatcher, SyncError};
use crate::stream::registry::{
    Delivery, SubscribeError, Subscription, SubscriptionRegistry, SubscriptionRequest,
};
use crate::stream::transport::{ConnectError, Connection, RawMessage, Transport};

/// Observable connection state.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ConnectionState {
    /// Not started, or stopped.
    #[default]
    Disconnected,
    /// A connect attempt is in flight or waiting out its backoff.
    Connecting,
    /// Authenticated and receiving; tracked subscriptions have been sent.
    Connected,
    /// The connection dropped and the worker is establishing a new one.
    Reconnecting,
    /// A connect or reconnect budget ran out. `start()` may be called again.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

/// Errors returned by [`SyncSession::start`].
#[derive(Debug, Error)]
pub enum StartError {
    #[error("session is already running")]
    AlreadyRunning,

    #[error("connect failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: ConnectError,
    },

    #[error("start was interrupted by stop()")]
    Cancelled,
}

enum EstablishError {
    Cancelled,
    Exhausted { attempts: usize, source: ConnectError },
}

struct Shared {
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    registry: SubscriptionRegistry,
    dispatcher: EventDispatcher,
    options: SyncOptions,
    state: watch::Sender<ConnectionState>,
    session_id: Mutex<Option<String>>,
}

struct RunHandle {
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl RunHandle {
    fn is_finished(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| worker.is_finished())
    }
}

/// Realtime subscription session over a [`Transport`].
pub struct SyncSession {
    shared: Arc<Shared>,
    run: Mutex<Option<RunHandle>>,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("state", &self.state())
            .field("subscriptions", &self.shared.registry.len())
            .field("dispatcher", &self.shared.dispatcher)
            .finish()
    }
}

impl SyncSession {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        transport: Arc<dyn Transport>,
        options: SyncOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let registry = SubscriptionRegistry::new(options.subscription_context);
        Self {
            shared: Arc::new(Shared {
                transport,
                authenticator,
                registry,
                dispatcher: EventDispatcher::new(),
                options,
                state,
                session_id: Mutex::new(None),
            }),
            run: Mutex::new(None),
        }
    }

    /// Connects and starts the receive worker.
    ///
    /// Retries according to `connect_policy`. On success the session is
    /// `Connected` and every tracked subscription has been sent. After the
    /// budget is exhausted the session is `Failed` and may be started again.
    pub async fn start(&self) -> Result<(), StartError> {
        let cancel = {
            let mut run = self.run.lock();
            if let Some(previous) = run.as_ref() {
                // The worker sets `Failed` as its last step before exiting.
                if !previous.is_finished() && self.state() != ConnectionState::Failed {
                    return Err(StartError::AlreadyRunning);
                }
                previous.cancel.cancel();
            }
            let cancel = CancellationToken::new();
            *run = Some(RunHandle {
                cancel: cancel.clone(),
                worker: None,
            });
            self.shared.set_state(ConnectionState::Connecting);
            cancel
        };

        let policy = self.shared.options.connect_policy.clone();
        let result = self
            .shared
            .establish(&policy, ConnectionState::Connecting, &cancel)
            .await;

        let mut run = self.run.lock();
        if cancel.is_cancelled() {
            // A connect attempt may have raced the stop() state update.
            if run.is_none() {
                self.shared.set_state(ConnectionState::Disconnected);
            }
            return Err(StartError::Cancelled);
        }

        match result {
            Ok(connection) => {
                if !self.shared.attach(&connection, &cancel) {
                    connection.disconnect();
                    return Err(StartError::Cancelled);
                }
                let worker = tokio::spawn(run_worker(
                    Arc::clone(&self.shared),
                    connection,
                    cancel.clone(),
                ));
                if let Some(handle) = run.as_mut() {
                    handle.worker = Some(worker);
                }
                Ok(())
            }
            Err(EstablishError::Cancelled) => Err(StartError::Cancelled),
            Err(EstablishError::Exhausted { attempts, source }) => {
                *run = None;
                self.shared.set_state(ConnectionState::Failed);
                warn!(event = "start_failed", attempts, error = %source);
                Err(StartError::RetriesExhausted { attempts, source })
            }
        }
    }

    /// Stops the session. Valid from any state.
    ///
    /// Interrupts any pending connect or backoff wait, disconnects the
    /// transport and waits for the worker to exit. Subscriptions are kept and
    /// replayed by the next `start()`.
    pub async fn stop(&self) {
        let handle = {
            let mut run = self.run.lock();
            let handle = run.take();
            if let Some(handle) = handle.as_ref() {
                handle.cancel.cancel();
            }
            handle
        };
        // Commands issued while the worker winds down must not reach the
        // old link; an attach racing this point sees the cancelled token.
        self.shared.registry.detach();

        if let Some(worker) = handle.and_then(|handle| handle.worker) {
            if let Err(err) = worker.await {
                warn!(event = "worker_join_failed", error = %err);
            }
        }

        *self.shared.session_id.lock() = None;
        self.shared.set_state(ConnectionState::Disconnected);
        info!(event = "session_stopped");
    }

    /// Records a subscription and sends it when connected.
    ///
    /// A transmission failure is returned as [`Delivery::Failed`] and also
    /// reported on the error stream; the subscription stays recorded.
    pub fn subscribe_collection(
        &self,
        request: SubscriptionRequest,
    ) -> Result<Delivery, SubscribeError> {
        let subscription = Subscription::try_from(request)?;
        let delivery = self.shared.registry.subscribe(subscription);
        self.shared.report_delivery(&delivery);
        Ok(delivery)
    }

    /// Removes a subscription. Unknown subscriptions yield [`Delivery::Unchanged`].
    pub fn unsubscribe_collection(
        &self,
        request: SubscriptionRequest,
    ) -> Result<Delivery, SubscribeError> {
        let subscription = Subscription::try_from(request)?;
        let delivery = self.shared.registry.unsubscribe(&subscription);
        self.shared.report_delivery(&delivery);
        Ok(delivery)
    }

    /// Tracked subscriptions in insertion order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.registry.snapshot()
    }

    /// Observer registration for the notification and error streams.
    pub fn events(&self) -> &EventDispatcher {
        &self.shared.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Server-assigned id of the live connection.
    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id.lock().clone()
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if let Some(handle) = self.run.lock().take() {
            handle.cancel.cancel();
        }
        self.shared.registry.detach();
        self.shared.registry.clear();
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!(event = "connection_state_changed", state = next.as_str());
        }
    }

    fn report_delivery(&self, delivery: &Delivery) {
        if let Delivery::Failed(err) = delivery {
            warn!(event = "command_send_failed", error = %err);
            self.dispatcher.report(&SyncError::Send(err.clone()));
        }
    }

    async fn connect_once(&self) -> Result<Connection, ConnectError> {
        let credentials = self.authenticator.authenticate().await?;
        self.transport.connect(&credentials).await
    }

    async fn establish(
        &self,
        policy: &RetryPolicy,
        waiting: ConnectionState,
        cancel: &CancellationToken,
    ) -> Result<Connection, EstablishError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(EstablishError::Cancelled);
            }

            self.set_state(ConnectionState::Connecting);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EstablishError::Cancelled),
                result = self.connect_once() => result,
            };

            let error = match result {
                Ok(connection) => {
                    info!(
                        event = "connected",
                        attempt,
                        session_id = connection.session_id().unwrap_or_default()
                    );
                    return Ok(connection);
                }
                Err(error) => error,
            };

            warn!(
                event = "connect_attempt_failed",
                attempt,
                max_attempts,
                error = %error
            );
            if !policy.allows_retry_after(attempt) {
                return Err(EstablishError::Exhausted {
                    attempts: attempt,
                    source: error,
                });
            }
            self.dispatcher
                .report(&SyncError::Connect { attempt, source: error });

            self.set_state(waiting);
            let delay = policy.delay_for_attempt(attempt);
            debug!(
                event = "connect_backoff",
                attempt,
                delay_ms = delay.as_millis() as u64
            );
            if !sleep_or_cancelled(delay, cancel).await {
                return Err(EstablishError::Cancelled);
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Returns `false` without attaching when `cancel` has fired.
    fn attach(&self, connection: &Connection, cancel: &CancellationToken) -> bool {
        match self
            .registry
            .replay_all_unless_cancelled(connection.sender(), cancel)
        {
            Ok(None) => return false,
            Ok(Some(count)) => info!(event = "subscriptions_replayed", count),
            Err(err) => {
                warn!(event = "subscription_replay_failed", error = %err);
                self.dispatcher.report(&SyncError::Send(err));
            }
        }

        *self.session_id.lock() = connection.session_id().map(str::to_string);
        self.set_state(ConnectionState::Connected);
        true
    }

    fn release(&self, connection: &Connection) {
        connection.disconnect();
        self.registry.detach();
        *self.session_id.lock() = None;
    }

    async fn pump(&self, connection: &mut Connection, cancel: &CancellationToken) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                frame = connection.recv() => frame,
            };
            let Some(frame) = frame else {
                return;
            };
            self.handle_frame(&frame);
        }
    }

    fn handle_frame(&self, frame: &RawMessage) {
        match decode_frame(&frame.text) {
            Ok(Some(InboundFrame::Notification(notification))) => {
                self.dispatcher.dispatch(&notification);
            }
            Ok(Some(InboundFrame::CallResponse(response))) => {
                if response.is_ok() {
                    debug!(event = "call_acknowledged", message_id = response.message_id);
                } else {
                    let reason = response.reason();
                    warn!(
                        event = "call_rejected",
                        message_id = response.message_id,
                        reason = %reason
                    );
                    self.dispatcher.report(&SyncError::CallRejected {
                        message_id: response.message_id,
                        reason,
                    });
                }
            }
            Ok(Some(InboundFrame::Auth(_))) | Ok(Some(InboundFrame::Ping)) | Ok(None) => {}
            Err(err) => {
                warn!(event = "frame_decode_failed", error = %err);
                self.dispatcher.report(&SyncError::Decode(err));
            }
        }
    }
}

async fn run_worker(shared: Arc<Shared>, mut connection: Connection, cancel: CancellationToken) {
    loop {
        shared.pump(&mut connection, &cancel).await;
        shared.release(&connection);
        if cancel.is_cancelled() {
            debug!(event = "worker_cancelled");
            return;
        }

        warn!(event = "connection_dropped");
        shared.set_state(ConnectionState::Reconnecting);
        let policy = shared.options.reconnect_policy.clone();
        match shared
            .establish(&policy, ConnectionState::Reconnecting, &cancel)
            .await
        {
            Ok(next) => {
                connection = next;
                if !shared.attach(&connection, &cancel) {
                    shared.release(&connection);
                    return;
                }
            }
            Err(EstablishError::Cancelled) => return,
            Err(EstablishError::Exhausted { attempts, source }) => {
                shared.dispatcher.report(&SyncError::Connect {
                    attempt: attempts,
                    source,
                });
                shared
                    .dispatcher
                    .report(&SyncError::ReconnectExhausted { attempts });
                shared.set_state(ConnectionState::Failed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState;

    #[test]
    fn state_names_are_stable() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Reconnecting.as_str(), "reconnecting");
        assert_eq!(ConnectionState::Failed.as_str(), "failed");
    }
}
