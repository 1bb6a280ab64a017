//! Observer registration and ordered notification fan-out.
//!
//! Observers are grouped per kind (new, change, delete, error) and invoked in
//! registration order. The observer list is snapshotted before each dispatch,
//! so callbacks may register or unregister observers without deadlocking; such
//! changes take effect from the next notification. A callback that returns an
//! error or panics is reported on the error stream and never stops delivery.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::stream::decoder::DecodeError;
use crate::stream::notification::{
    ChangeNotification, DeleteNotification, NewNotification, Notification,
};
use crate::stream::transport::{ConnectError, SendError};

/// Error returned by an observer callback.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;
/// Result returned by an observer callback.
pub type ObserverResult = Result<(), ObserverError>;

type Callback<T> = Arc<dyn Fn(&T) -> ObserverResult + Send + Sync>;

/// Observation stream an observer is attached to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ObserverKind {
    New,
    Change,
    Delete,
    Error,
}

/// Token returned on registration; pass it to [`EventDispatcher::unregister`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObserverHandle {
    kind: ObserverKind,
    id: u64,
}

impl ObserverHandle {
    pub fn kind(&self) -> ObserverKind {
        self.kind
    }
}

/// Item type of the error stream.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to decode frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("{kind:?} observer failed: {message}")]
    Observer { kind: ObserverKind, message: String },

    #[error("failed to send command: {0}")]
    Send(#[from] SendError),

    #[error("connection attempt {attempt} failed: {source}")]
    Connect {
        attempt: usize,
        #[source]
        source: ConnectError,
    },

    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: usize },

    #[error("server rejected call {message_id:?}: {reason}")]
    CallRejected {
        message_id: Option<u64>,
        reason: String,
    },
}

struct ObserverList<T> {
    entries: Vec<(u64, Callback<T>)>,
}

impl<T> Default for ObserverList<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> ObserverList<T> {
    fn push(&mut self, id: u64, callback: Callback<T>) {
        self.entries.push((id, callback));
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    fn snapshot(&self) -> Vec<Callback<T>> {
        self.entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }
}

#[derive(Default)]
struct ObserverTable {
    new: ObserverList<NewNotification>,
    change: ObserverList<ChangeNotification>,
    delete: ObserverList<DeleteNotification>,
    error: ObserverList<SyncError>,
}

/// Routes notifications and errors to registered observers.
pub struct EventDispatcher {
    table: RwLock<ObserverTable>,
    next_id: AtomicU64,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.read();
        f.debug_struct("EventDispatcher")
            .field("new", &table.new.entries.len())
            .field("change", &table.change.entries.len())
            .field("delete", &table.delete.entries.len())
            .field("error", &table.error.entries.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(ObserverTable::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attaches an observer for newly created entities.
    pub fn on_new<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&NewNotification) -> ObserverResult + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.table.write().new.push(id, Arc::new(callback));
        ObserverHandle {
            kind: ObserverKind::New,
            id,
        }
    }

    /// Attaches an observer for entity changes.
    pub fn on_change<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&ChangeNotification) -> ObserverResult + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.table.write().change.push(id, Arc::new(callback));
        ObserverHandle {
            kind: ObserverKind::Change,
            id,
        }
    }

    /// Attaches an observer for deletions.
    pub fn on_delete<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&DeleteNotification) -> ObserverResult + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.table.write().delete.push(id, Arc::new(callback));
        ObserverHandle {
            kind: ObserverKind::Delete,
            id,
        }
    }

    /// Attaches an observer to the error stream.
    pub fn on_error<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&SyncError) -> ObserverResult + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.table.write().error.push(id, Arc::new(callback));
        ObserverHandle {
            kind: ObserverKind::Error,
            id,
        }
    }

    /// Detaches an observer. Returns `false` if it was already gone.
    pub fn unregister(&self, handle: ObserverHandle) -> bool {
        let mut table = self.table.write();
        match handle.kind {
            ObserverKind::New => table.new.remove(handle.id),
            ObserverKind::Change => table.change.remove(handle.id),
            ObserverKind::Delete => table.delete.remove(handle.id),
            ObserverKind::Error => table.error.remove(handle.id),
        }
    }

    pub fn observer_count(&self, kind: ObserverKind) -> usize {
        let table = self.table.read();
        match kind {
            ObserverKind::New => table.new.entries.len(),
            ObserverKind::Change => table.change.entries.len(),
            ObserverKind::Delete => table.delete.entries.len(),
            ObserverKind::Error => table.error.entries.len(),
        }
    }

    /// Delivers one notification to every observer of its kind.
    pub fn dispatch(&self, notification: &Notification) {
        match notification {
            Notification::New(new) => {
                let observers = self.table.read().new.snapshot();
                self.deliver(ObserverKind::New, &observers, new);
            }
            Notification::Change(change) => {
                let observers = self.table.read().change.snapshot();
                self.deliver(ObserverKind::Change, &observers, change);
            }
            Notification::Delete(delete) => {
                let observers = self.table.read().delete.snapshot();
                self.deliver(ObserverKind::Delete, &observers, delete);
            }
        }
    }

    /// Publishes an error to the error stream.
    ///
    /// Failures of error observers are logged and otherwise dropped.
    pub fn report(&self, error: &SyncError) {
        let observers = self.table.read().error.snapshot();
        if observers.is_empty() {
            debug!(event = "error_unobserved", error = %error);
            return;
        }

        for observer in &observers {
            if let Err(message) = run_observer(observer, error) {
                warn!(event = "error_observer_failed", error = %message);
            }
        }
    }

    fn deliver<T>(&self, kind: ObserverKind, observers: &[Callback<T>], value: &T) {
        for observer in observers {
            if let Err(message) = run_observer(observer, value) {
                warn!(event = "observer_failed", kind = ?kind, error = %message);
                self.report(&SyncError::Observer { kind, message });
            }
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn run_observer<T>(observer: &Callback<T>, value: &T) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| observer(value))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(format!("observer panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
