//! Declarative subscription bookkeeping.
//!
//! The registry is the single source of truth for what the client wants to
//! receive. Every mutation and the matching command send happen under one
//! lock, so concurrent subscribe/unsubscribe calls reach the wire in the same
//! order they are applied locally. After each (re)connect the session calls
//! [`SubscriptionRegistry::replay_all`] to bring the server back in line.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::stream::proto::{
    ClientMessage, CollectionParams, SubscriptionContext, SUBSCRIBE_COLLECTION,
    UNSUBSCRIBE_COLLECTION,
};
use crate::stream::transport::{FrameSender, SendError};

/// Selects a collection either by id or by its human-readable key.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CollectionSelector {
    Id(String),
    Key(String),
}

/// A validated subscription target.
///
/// Two subscriptions are the same when project, collection selector and
/// folder set are equal; folder order does not matter.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Subscription {
    project_id: String,
    collection: Option<CollectionSelector>,
    folders: BTreeSet<String>,
}

impl Subscription {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn collection(&self) -> Option<&CollectionSelector> {
        self.collection.as_ref()
    }

    /// Folder filter. Empty means every folder.
    pub fn folders(&self) -> &BTreeSet<String> {
        &self.folders
    }

    fn params(&self, context: SubscriptionContext) -> CollectionParams {
        let (collection_id, collection_key) = match &self.collection {
            Some(CollectionSelector::Id(id)) => (Some(id.clone()), None),
            Some(CollectionSelector::Key(key)) => (None, Some(key.clone())),
            None => (None, None),
        };
        let (folder, folders) = match self.folders.len() {
            0 => (None, None),
            1 => (self.folders.iter().next().cloned(), None),
            _ => (None, Some(self.folders.iter().cloned().collect())),
        };

        CollectionParams {
            project_id: self.project_id.clone(),
            collection_id,
            collection_key,
            folder,
            folders,
            context: Some(context),
        }
    }
}

/// Caller-facing subscription parameters.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscriptionRequest {
    /// Project that owns the collection. Required.
    pub project_id: String,
    /// Selects the collection by numeric id. Exclusive with `collection_key`.
    pub collection_id: Option<String>,
    /// Selects the collection by its key. Exclusive with `collection_id`.
    pub collection_key: Option<String>,
    /// Restricts the subscription to one folder.
    pub folder: Option<String>,
    /// Restricts the subscription to several folders; merged with `folder`.
    pub folders: Vec<String>,
}

impl SubscriptionRequest {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    pub fn collection_id(mut self, collection_id: impl Into<String>) -> Self {
        self.collection_id = Some(collection_id.into());
        self
    }

    pub fn collection_key(mut self, collection_key: impl Into<String>) -> Self {
        self.collection_key = Some(collection_key.into());
        self
    }

    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn folders<I, S>(mut self, folders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.folders.extend(folders.into_iter().map(Into::into));
        self
    }
}

impl TryFrom<SubscriptionRequest> for Subscription {
    type Error = SubscribeError;

    fn try_from(request: SubscriptionRequest) -> Result<Self, Self::Error> {
        if request.project_id.trim().is_empty() {
            return Err(SubscribeError::MissingProject);
        }

        let collection = match (request.collection_id, request.collection_key) {
            (Some(_), Some(_)) => return Err(SubscribeError::ConflictingSelector),
            (Some(id), None) => Some(CollectionSelector::Id(non_empty(id, "collection_id")?)),
            (None, Some(key)) => Some(CollectionSelector::Key(non_empty(key, "collection_key")?)),
            (None, None) => None,
        };

        let mut folders = BTreeSet::new();
        for folder in request.folder.into_iter().chain(request.folders) {
            folders.insert(non_empty(folder, "folder")?);
        }

        Ok(Self {
            project_id: request.project_id,
            collection,
            folders,
        })
    }
}

fn non_empty(value: String, field: &'static str) -> Result<String, SubscribeError> {
    if value.trim().is_empty() {
        Err(SubscribeError::EmptySelector { field })
    } else {
        Ok(value)
    }
}

/// Validation errors for subscription requests. Raised before any I/O.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SubscribeError {
    #[error("collection_id and collection_key are mutually exclusive")]
    ConflictingSelector,

    #[error("project_id must not be empty")]
    MissingProject,

    #[error("{field} must not be empty")]
    EmptySelector { field: &'static str },
}

/// Outcome of a subscribe or unsubscribe call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Delivery {
    /// The command was handed to the live connection.
    Sent {
        /// Id echoed back by the server in the matching call response.
        message_id: u64,
    },
    /// Recorded locally; converges on the next connect.
    Deferred,
    /// Nothing to do: already subscribed, or not subscribed at all.
    Unchanged,
    /// Recorded locally but transmission failed. Converges on reconnect.
    Failed(SendError),
}

#[derive(Debug)]
struct Entry {
    subscription: Subscription,
    /// A subscribe for this entry reached the wire at least once.
    announced: bool,
}

#[derive(Debug)]
struct RegistryState {
    entries: Vec<Entry>,
    /// Unsubscribes the server has not seen yet. Only tracked for contexts
    /// that outlive a single connection.
    pending_removals: Vec<Subscription>,
    link: Option<FrameSender>,
    next_message_id: u64,
}

impl RegistryState {
    fn position(&self, subscription: &Subscription) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.subscription == *subscription)
    }

    fn send(
        &mut self,
        method: &str,
        subscription: &Subscription,
        context: SubscriptionContext,
    ) -> Result<Option<u64>, SendError> {
        let Some(link) = self.link.as_ref() else {
            return Ok(None);
        };

        self.next_message_id += 1;
        let message_id = self.next_message_id;
        let message = ClientMessage::call(method, subscription.params(context), message_id);
        match link.send(&message) {
            Ok(()) => {
                debug!(event = "command_sent", method, message_id);
                Ok(Some(message_id))
            }
            Err(err) => {
                self.link = None;
                Err(err)
            }
        }
    }

    fn delivery(
        &mut self,
        method: &str,
        subscription: &Subscription,
        context: SubscriptionContext,
    ) -> Delivery {
        match self.send(method, subscription, context) {
            Ok(Some(message_id)) => Delivery::Sent { message_id },
            Ok(None) => Delivery::Deferred,
            Err(err) => Delivery::Failed(err),
        }
    }

    fn replay(
        &mut self,
        link: FrameSender,
        context: SubscriptionContext,
    ) -> Result<usize, SendError> {
        self.link = Some(link);
        let mut sent = 0;

        while let Some(pending) = self.pending_removals.first().cloned() {
            self.send(UNSUBSCRIBE_COLLECTION, &pending, context)?;
            self.pending_removals.remove(0);
            sent += 1;
        }

        for index in 0..self.entries.len() {
            let subscription = self.entries[index].subscription.clone();
            self.send(SUBSCRIBE_COLLECTION, &subscription, context)?;
            self.entries[index].announced = true;
            sent += 1;
        }
        Ok(sent)
    }
}

/// Thread-safe set of subscriptions in insertion order.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    context: SubscriptionContext,
}

impl SubscriptionRegistry {
    pub fn new(context: SubscriptionContext) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                entries: Vec::new(),
                pending_removals: Vec::new(),
                link: None,
                next_message_id: 0,
            }),
            context,
        }
    }

    /// Records `subscription` and sends it if a connection is attached.
    ///
    /// Subscribing twice to the same target is a no-op.
    pub fn subscribe(&self, subscription: Subscription) -> Delivery {
        let mut state = self.state.lock();
        if state.position(&subscription).is_some() {
            return Delivery::Unchanged;
        }

        let pending_before = state.pending_removals.len();
        state
            .pending_removals
            .retain(|pending| *pending != subscription);
        let still_on_server = state.pending_removals.len() != pending_before;

        let delivery = state.delivery(SUBSCRIBE_COLLECTION, &subscription, self.context);
        let announced = still_on_server || matches!(delivery, Delivery::Sent { .. });
        state.entries.push(Entry {
            subscription,
            announced,
        });
        delivery
    }

    /// Forgets `subscription` and sends the unsubscribe if connected.
    ///
    /// When the server keeps subscriptions across connections, an unsubscribe
    /// that could not be sent is queued and goes out first on the next replay.
    pub fn unsubscribe(&self, subscription: &Subscription) -> Delivery {
        let mut state = self.state.lock();
        let Some(position) = state.position(subscription) else {
            return Delivery::Unchanged;
        };

        let removed = state.entries.remove(position);
        let delivery =
            state.delivery(UNSUBSCRIBE_COLLECTION, &removed.subscription, self.context);
        if removed.announced
            && self.context.outlives_connection()
            && !matches!(delivery, Delivery::Sent { .. })
        {
            state.pending_removals.push(removed.subscription);
        }
        delivery
    }

    /// Attaches `link`, flushes queued unsubscribes and re-sends every tracked
    /// subscription in order.
    ///
    /// Returns the number of commands sent. On failure the link is detached
    /// again; the next connection replays everything still outstanding.
    pub fn replay_all(&self, link: FrameSender) -> Result<usize, SendError> {
        self.state.lock().replay(link, self.context)
    }

    /// Like [`replay_all`](Self::replay_all), but leaves the registry detached
    /// and returns `Ok(None)` once `cancel` has fired.
    ///
    /// The check and the attach happen under the registry lock, so a
    /// `detach()` issued after cancelling cannot be overtaken.
    pub fn replay_all_unless_cancelled(
        &self,
        link: FrameSender,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>, SendError> {
        let mut state = self.state.lock();
        if cancel.is_cancelled() {
            return Ok(None);
        }
        state.replay(link, self.context).map(Some)
    }

    /// Drops the attached link. Later mutations are deferred.
    pub fn detach(&self) {
        self.state.lock().link = None;
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().link.is_some()
    }

    /// Removes every subscription and queued unsubscribe without sending anything.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.pending_removals.clear();
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|entry| entry.subscription.clone())
            .collect()
    }

    pub fn contains(&self, subscription: &Subscription) -> bool {
        self.state.lock().position(subscription).is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}
