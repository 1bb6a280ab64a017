//! Canonical record shapes shared by the REST surface and notification payloads.
//!
//! The server is loose about scalar types: ids and numeric columns arrive
//! either as JSON numbers or as strings, and images arrive either as a
//! descriptor object or as an inline base64 blob. The deserializers here
//! normalise all of those into one shape.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Moderation state of a data object.
///
/// Unrecognised values decode as [`DataObjectState::All`].
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq)]
#[serde(from = "String")]
pub enum DataObjectState {
    Pending,
    Moderated,
    Rejected,
    #[default]
    All,
}

impl DataObjectState {
    /// Wire representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Moderated => "Moderated",
            Self::Rejected => "Rejected",
            Self::All => "All",
        }
    }
}

impl From<String> for DataObjectState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Pending" => Self::Pending,
            "Moderated" => Self::Moderated,
            "Rejected" => Self::Rejected,
            _ => Self::All,
        }
    }
}

/// Image attached to a data object.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Image {
    /// Hosted image location, when the server sent one.
    pub url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Raw image bytes decoded from an inline base64 payload.
    pub bytes: Option<Vec<u8>>,
}

impl Image {
    /// Builds an image from a bare string payload.
    ///
    /// `http(s)://` strings are treated as URLs; anything else must be
    /// standard base64, optionally prefixed with a `data:` URI header.
    pub fn from_inline(payload: &str) -> Result<Self, base64::DecodeError> {
        let trimmed = payload.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Ok(Self {
                url: Some(trimmed.to_string()),
                ..Self::default()
            });
        }

        Ok(Self {
            bytes: Some(decode_base64(trimmed)?),
            ..Self::default()
        })
    }
}

/// User avatar descriptor.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct Avatar {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_u32")]
    pub width: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_opt_u32")]
    pub height: Option<u32>,
}

/// Application user.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct User {
    #[serde(default, deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub avatar: Option<Avatar>,
}

/// Folder inside a collection.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct Folder {
    #[serde(default, deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub source_id: Option<String>,
    #[serde(default)]
    pub is_custom: Option<bool>,
}

/// A record stored in a collection.
///
/// Every field except `id` is optional because change notifications carry
/// partial snapshots.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct DataObject {
    #[serde(default, deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default, deserialize_with = "deserialize_image")]
    pub image: Option<Image>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub state: Option<DataObjectState>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_i64")]
    pub data1: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_opt_i64")]
    pub data2: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_opt_i64")]
    pub data3: Option<i64>,
    /// Free-form key/value pairs attached to the record.
    #[serde(default, deserialize_with = "deserialize_additional")]
    pub additional: BTreeMap<String, Value>,
}

impl DataObject {
    /// Decodes a record from its JSON representation.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Identifier that may be encoded as a JSON string or number.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum IdRepr {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl IdRepr {
    pub(crate) fn into_string(self) -> String {
        match self {
            Self::Text(value) => value,
            Self::Signed(value) => value.to_string(),
            Self::Unsigned(value) => value.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberRepr {
    Signed(i64),
    Float(f64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ImageRepr {
    Inline(String),
    Descriptor(ImageDescriptor),
}

#[derive(Deserialize)]
struct ImageDescriptor {
    #[serde(default, alias = "url")]
    image: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_u32")]
    width: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_opt_u32")]
    height: Option<u32>,
    #[serde(default)]
    value: Option<String>,
}

pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(IdRepr::deserialize(deserializer)?.into_string())
}

pub(crate) fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<IdRepr>::deserialize(deserializer)?.map(IdRepr::into_string))
}

fn deserialize_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberRepr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberRepr::Signed(value)) => Ok(Some(value)),
        Some(NumberRepr::Float(value)) if value.fract() == 0.0 && value.is_finite() => {
            Ok(Some(value as i64))
        }
        Some(NumberRepr::Float(value)) => {
            Err(D::Error::custom(format!("expected an integer, got {value}")))
        }
        Some(NumberRepr::Text(text)) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            text.parse::<i64>()
                .map(Some)
                .map_err(|err| D::Error::custom(format!("invalid integer `{text}`: {err}")))
        }
    }
}

fn deserialize_opt_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    match deserialize_opt_i64(deserializer)? {
        None => Ok(None),
        Some(value) => u32::try_from(value)
            .map(Some)
            .map_err(|_| D::Error::custom(format!("{value} is out of range for a dimension"))),
    }
}

fn deserialize_image<'de, D>(deserializer: D) -> Result<Option<Image>, D::Error>
where
    D: Deserializer<'de>,
{
    let image = match Option::<ImageRepr>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(ImageRepr::Inline(payload)) => Image::from_inline(&payload)
            .map_err(|err| D::Error::custom(format!("invalid inline image: {err}")))?,
        Some(ImageRepr::Descriptor(descriptor)) => Image {
            url: descriptor.image,
            width: descriptor.width,
            height: descriptor.height,
            bytes: descriptor
                .value
                .as_deref()
                .map(decode_base64)
                .transpose()
                .map_err(|err| D::Error::custom(format!("invalid image value: {err}")))?,
        },
    };
    Ok(Some(image))
}

fn deserialize_additional<'de, D>(deserializer: D) -> Result<BTreeMap<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match payload.split_once(";base64,") {
        Some((header, body)) if header.starts_with("data:") => body,
        _ => payload,
    };
    BASE64_STANDARD.decode(payload.trim())
}
