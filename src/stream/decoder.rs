//! Envelope-level decoding of inbound frames.
//!
//! The decoder only owns the `type`/`object` discrimination. Record payloads
//! are handed to the shared decoders in [`crate::record`]. Frames with an
//! unknown `type` or `object` decode to `Ok(None)` so that server-added kinds
//! never break older clients.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::trace;

use crate::record::{DataObject, IdRepr};
use crate::stream::notification::{
    ChangeNotification, DeleteNotification, Entity, NewNotification, Notification,
    NotificationObject, NotificationSource, NotificationType, Target,
};
use crate::stream::proto::{AuthReply, CallResponse};

/// Any frame the client understands.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    Notification(Notification),
    CallResponse(CallResponse),
    Auth(AuthReply),
    Ping,
}

/// Errors produced for malformed frames. These are never fatal.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a json object")]
    NotAnObject,

    #[error("frame has no string `type` discriminator")]
    MissingType,

    #[error("`{kind}` frame is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("`{field}` must be a json object")]
    ExpectedObject { field: &'static str },

    #[error("invalid `{field}` payload: {source}")]
    Payload {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("delete frame target has no ids")]
    EmptyTarget,
}

/// Decodes one raw text frame.
pub fn decode_frame(text: &str) -> Result<Option<InboundFrame>, DecodeError> {
    let Value::Object(fields) = serde_json::from_str::<Value>(text)? else {
        return Err(DecodeError::NotAnObject);
    };
    let frame_type = match fields.get("type") {
        Some(Value::String(frame_type)) => frame_type.clone(),
        _ => return Err(DecodeError::MissingType),
    };

    if let Some(kind) = NotificationType::from_wire(&frame_type) {
        return Ok(decode_notification_fields(kind, fields)?.map(InboundFrame::Notification));
    }

    match frame_type.as_str() {
        "callresponse" => serde_json::from_value(Value::Object(fields))
            .map(|response| Some(InboundFrame::CallResponse(response)))
            .map_err(|source| DecodeError::Payload {
                field: "callresponse",
                source,
            }),
        "auth" => serde_json::from_value(Value::Object(fields))
            .map(|reply| Some(InboundFrame::Auth(reply)))
            .map_err(|source| DecodeError::Payload {
                field: "auth",
                source,
            }),
        "ping" => Ok(Some(InboundFrame::Ping)),
        other => {
            trace!(event = "frame_ignored", frame_type = other);
            Ok(None)
        }
    }
}

/// Decodes a frame and keeps it only if it is a notification.
pub fn decode_notification(text: &str) -> Result<Option<Notification>, DecodeError> {
    Ok(match decode_frame(text)? {
        Some(InboundFrame::Notification(notification)) => Some(notification),
        _ => None,
    })
}

fn decode_notification_fields(
    kind: NotificationType,
    mut fields: Map<String, Value>,
) -> Result<Option<Notification>, DecodeError> {
    let object = fields
        .get("object")
        .and_then(Value::as_str)
        .and_then(NotificationObject::from_wire);
    let Some(object) = object else {
        trace!(
            event = "notification_ignored",
            frame_type = kind.as_str(),
            object = ?fields.get("object")
        );
        return Ok(None);
    };

    let source = NotificationSource {
        project_id: scalar_field(&fields, "project_id"),
        collection_id: scalar_field(&fields, "collection_id"),
        channel: scalar_field(&fields, "channel"),
    };

    let notification = match kind {
        NotificationType::New => {
            let data = take_present(&mut fields, "data").ok_or(DecodeError::MissingField {
                kind: "new",
                field: "data",
            })?;
            Notification::New(NewNotification {
                object,
                entity: decode_entity(object, data)?,
                source,
            })
        }
        NotificationType::Change => {
            let mut data = match take_present(&mut fields, "data") {
                None => Map::new(),
                Some(Value::Object(data)) => data,
                Some(_) => return Err(DecodeError::ExpectedObject { field: "data" }),
            };
            if let Some(additional) = take_present(&mut fields, "additional") {
                data.insert("additional".to_string(), additional);
            }

            let mut changed_fields: Vec<String> =
                data.keys().filter(|name| *name != "id").cloned().collect();
            changed_fields.sort();

            let entity = decode_entity(object, Value::Object(data))?;
            let mut target = match take_present(&mut fields, "target") {
                Some(target) => decode_target(target)?,
                None => Target::default(),
            };
            if target.is_empty() && !entity.id().is_empty() {
                target = Target::from_ids([entity.id()]);
            }

            Notification::Change(ChangeNotification {
                object,
                target,
                entity,
                changed_fields,
                source,
            })
        }
        NotificationType::Delete => {
            let target = take_present(&mut fields, "target").ok_or(DecodeError::MissingField {
                kind: "delete",
                field: "target",
            })?;
            let target = decode_target(target)?;
            if target.is_empty() {
                return Err(DecodeError::EmptyTarget);
            }
            Notification::Delete(DeleteNotification {
                object,
                target,
                source,
            })
        }
    };

    Ok(Some(notification))
}

fn decode_entity(object: NotificationObject, data: Value) -> Result<Entity, DecodeError> {
    let entity = match object {
        NotificationObject::Data => DataObject::from_value(data).map(Entity::Data),
        NotificationObject::Folder => serde_json::from_value(data).map(Entity::Folder),
        NotificationObject::User => serde_json::from_value(data).map(Entity::User),
    };
    entity.map_err(|source| DecodeError::Payload {
        field: "data",
        source,
    })
}

#[derive(Deserialize)]
struct TargetRepr {
    #[serde(default)]
    ids: Vec<IdRepr>,
    #[serde(default)]
    id: Option<IdRepr>,
}

fn decode_target(value: Value) -> Result<Target, DecodeError> {
    let repr: TargetRepr =
        serde_json::from_value(value).map_err(|source| DecodeError::Payload {
            field: "target",
            source,
        })?;
    Ok(Target::from_ids(
        repr.id.into_iter().chain(repr.ids).map(IdRepr::into_string),
    ))
}

fn take_present(fields: &mut Map<String, Value>, key: &str) -> Option<Value> {
    fields.remove(key).filter(|value| !value.is_null())
}

fn scalar_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}
