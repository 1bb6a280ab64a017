//! Typed notification values produced by the decoder.

use std::collections::HashSet;

use crate::record::{DataObject, Folder, User};

/// What happened to the target entity.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NotificationType {
    New,
    Change,
    Delete,
}

impl NotificationType {
    /// Maps the wire `type` discriminator; unknown values yield `None`.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "change" => Some(Self::Change),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Change => "change",
            Self::Delete => "delete",
        }
    }
}

/// Kind of entity the notification is about.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NotificationObject {
    Data,
    Folder,
    User,
}

impl NotificationObject {
    /// Maps the wire `object` discriminator; unknown values yield `None`.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "data" => Some(Self::Data),
            "folder" => Some(Self::Folder),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Folder => "folder",
            Self::User => "user",
        }
    }
}

/// Snapshot of the entity carried by new and change notifications.
#[derive(Clone, Debug, PartialEq)]
pub enum Entity {
    Data(DataObject),
    Folder(Folder),
    User(User),
}

impl Entity {
    pub fn id(&self) -> &str {
        match self {
            Self::Data(data) => &data.id,
            Self::Folder(folder) => &folder.id,
            Self::User(user) => &user.id,
        }
    }

    pub fn as_data(&self) -> Option<&DataObject> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_folder(&self) -> Option<&Folder> {
        match self {
            Self::Folder(folder) => Some(folder),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&User> {
        match self {
            Self::User(user) => Some(user),
            _ => None,
        }
    }
}

/// Identifiers affected by a change or delete.
///
/// Ids are unique and kept in arrival order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Target {
    pub ids: Vec<String>,
}

impl Target {
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let ids = ids
            .into_iter()
            .map(Into::into)
            .filter(|id: &String| seen.insert(id.clone()))
            .collect();
        Self { ids }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|candidate| candidate == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Where the notification originated.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NotificationSource {
    /// Project the entity belongs to, when the frame names it.
    pub project_id: Option<String>,
    /// Collection the entity belongs to, when the frame names it.
    pub collection_id: Option<String>,
    /// Channel name for channel-routed frames.
    pub channel: Option<String>,
}

/// An entity was created.
#[derive(Clone, Debug, PartialEq)]
pub struct NewNotification {
    pub object: NotificationObject,
    /// Full snapshot of the created entity.
    pub entity: Entity,
    pub source: NotificationSource,
}

impl NewNotification {
    /// The created record when `object` is [`NotificationObject::Data`].
    pub fn data(&self) -> Option<&DataObject> {
        self.entity.as_data()
    }
}

/// One or more fields of an existing entity changed.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeNotification {
    pub object: NotificationObject,
    /// Ids of the changed entities. Falls back to the id of `entity`.
    pub target: Target,
    /// Partial snapshot holding only the changed fields.
    pub entity: Entity,
    /// Names of the fields present in the change payload, sorted.
    pub changed_fields: Vec<String>,
    pub source: NotificationSource,
}

impl ChangeNotification {
    pub fn data(&self) -> Option<&DataObject> {
        self.entity.as_data()
    }

    pub fn changed(&self, field: &str) -> bool {
        self.changed_fields.iter().any(|name| name == field)
    }
}

/// Entities were removed. No snapshot is carried.
#[derive(Clone, Debug, PartialEq)]
pub struct DeleteNotification {
    pub object: NotificationObject,
    /// Ids of the removed entities; never empty.
    pub target: Target,
    pub source: NotificationSource,
}

/// A decoded notification frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    New(NewNotification),
    Change(ChangeNotification),
    Delete(DeleteNotification),
}

impl Notification {
    pub fn notification_type(&self) -> NotificationType {
        match self {
            Self::New(_) => NotificationType::New,
            Self::Change(_) => NotificationType::Change,
            Self::Delete(_) => NotificationType::Delete,
        }
    }

    pub fn object(&self) -> NotificationObject {
        match self {
            Self::New(new) => new.object,
            Self::Change(change) => change.object,
            Self::Delete(delete) => delete.object,
        }
    }

    pub fn source(&self) -> &NotificationSource {
        match self {
            Self::New(new) => &new.source,
            Self::Change(change) => &change.source,
            Self::Delete(delete) => &delete.source,
        }
    }
}
