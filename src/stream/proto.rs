use serde::{Deserialize, Serialize};
use serde_json::Value;

/// RPC method registering interest in a collection.
pub const SUBSCRIBE_COLLECTION: &str = "subscription.subscribe_collection";
/// RPC method dropping interest in a collection.
pub const UNSUBSCRIBE_COLLECTION: &str = "subscription.unsubscribe_collection";

/// Server-side lifetime of a subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionContext {
    /// Kept for the API client until explicitly removed.
    Client,
    /// Kept for the server-side session across reconnects.
    Session,
    /// Dropped by the server when the connection closes.
    #[default]
    Connection,
}

impl SubscriptionContext {
    /// Whether the server remembers the subscription after a disconnect.
    pub fn outlives_connection(&self) -> bool {
        !matches!(self, Self::Connection)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionParams {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folders: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<SubscriptionContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        instance: String,
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_key: Option<String>,
    },
    Call {
        method: String,
        params: CollectionParams,
        message_id: u64,
    },
}

/// Handshake reply sent by the server after the auth frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthReply {
    /// `OK` or `NOK`.
    pub result: String,
    /// Server-assigned connection id on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Rejection reason on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthReply {
    pub fn is_ok(&self) -> bool {
        self.result.eq_ignore_ascii_case("ok")
    }

    /// Human readable rejection reason.
    pub fn reason(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("result={}", self.result))
    }
}

/// Reply to a `call` frame, correlated by `message_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallResponse {
    /// Id of the `call` frame this answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
    /// `OK` or `NOK`.
    pub result: String,
    /// Method-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Rejection reason on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallResponse {
    pub fn is_ok(&self) -> bool {
        self.result.eq_ignore_ascii_case("ok")
    }

    pub fn reason(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("result={}", self.result))
    }
}

impl ClientMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Builds a collection RPC call.
    pub fn call(method: &str, params: CollectionParams, message_id: u64) -> Self {
        Self::Call {
            method: method.to_string(),
            params,
            message_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn call_serializes_with_type_tag_and_omits_unset_selectors() {
        let msg = ClientMessage::call(
            SUBSCRIBE_COLLECTION,
            CollectionParams {
                project_id: "1".to_string(),
                collection_id: Some("2".to_string()),
                collection_key: None,
                folder: None,
                folders: Some(vec!["a".to_string(), "b".to_string()]),
                context: Some(SubscriptionContext::Connection),
            },
            7,
        );

        let value: Value = serde_json::from_str(&msg.to_text().expect("encode")).expect("json");
        assert_eq!(
            value,
            json!({
                "type": "call",
                "method": "subscription.subscribe_collection",
                "params": {
                    "project_id": "1",
                    "collection_id": "2",
                    "folders": ["a", "b"],
                    "context": "connection"
                },
                "message_id": 7
            })
        );
        assert_eq!(ClientMessage::from_text(&value.to_string()).expect("decode"), msg);
    }

    #[test]
    fn auth_frame_omits_missing_auth_key() {
        let msg = ClientMessage::Auth {
            instance: "acme".to_string(),
            api_key: "key".to_string(),
            auth_key: None,
        };
        let value: Value = serde_json::from_str(&msg.to_text().expect("encode")).expect("json");
        assert_eq!(
            value,
            json!({"type": "auth", "instance": "acme", "api_key": "key"})
        );
    }

    #[test]
    fn replies_report_rejection_reason() {
        let reply: AuthReply =
            serde_json::from_value(json!({"result": "NOK", "error": "bad key"})).expect("decode");
        assert!(!reply.is_ok());
        assert_eq!(reply.reason(), "bad key");

        let response: CallResponse =
            serde_json::from_value(json!({"message_id": 3, "result": "NOK"})).expect("decode");
        assert!(!response.is_ok());
        assert_eq!(response.reason(), "result=NOK");
    }
}
