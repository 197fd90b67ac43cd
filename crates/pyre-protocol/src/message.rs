//! The JSON-RPC 2.0 message model.
//!
//! A single [`Message`] type covers calls, notifications and responses; which
//! one a given value is depends on field presence, checked by the `is_*`
//! predicates. Ids, params and results are kept as raw JSON so that request
//! ids can be compared and indexed by their exact textual encoding.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::error::{ErrorObject, CODE_INTERNAL_ERROR};

/// Protocol version carried in every message.
pub const VERSION: &str = "2.0";

/// Separator between namespace and method name on the wire.
pub const METHOD_SEPARATOR: &str = "_";

/// Method suffix that marks a subscribe call.
pub const SUBSCRIBE_METHOD_SUFFIX: &str = "_subscribe";

/// Method suffix that marks an unsubscribe call.
pub const UNSUBSCRIBE_METHOD_SUFFIX: &str = "_unsubscribe";

/// Method suffix used for subscription event notifications.
pub const NOTIFICATION_METHOD_SUFFIX: &str = "_subscription";

/// Write deadline applied when the caller carries none.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall ceiling on a subscribe round trip, independent of caller deadlines.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard cap on undelivered events buffered per client-side subscription.
/// Exceeding it terminates the subscription with an overflow error.
pub const MAX_CLIENT_SUBSCRIPTION_BUFFER: usize = 20_000;

/// A single JSON-RPC wire unit: request, notification, or (error) response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// Raw id. `None` when the field is absent; a literal `null` id is kept
    /// as the raw text `null` so it can be rejected as invalid.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "raw_or_null"
    )]
    pub id: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "raw_or_null"
    )]
    pub result: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Keeps JSON `null` as raw text instead of collapsing it into `None`.
/// A `null` result is a legitimate response payload, and a `null` id must
/// stay visible to the validity check.
fn raw_or_null<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

impl Message {
    /// True if this message is a notification: no id, has a method.
    pub fn is_notification(&self) -> bool {
        self.has_valid_version() && self.id.is_none() && self.has_method()
    }

    /// True if this message is a call: valid id and a method.
    pub fn is_call(&self) -> bool {
        self.has_valid_version() && self.has_valid_id() && self.has_method()
    }

    /// True if this message is a response: valid id, no method/params, and
    /// exactly one of result or error.
    pub fn is_response(&self) -> bool {
        self.has_valid_version()
            && self.has_valid_id()
            && self.method.is_none()
            && self.params.is_none()
            && (self.result.is_some() != self.error.is_some())
    }

    /// A valid id is present and a non-null scalar (not an object or array).
    pub fn has_valid_id(&self) -> bool {
        match &self.id {
            Some(id) => {
                let raw = id.get();
                !raw.is_empty()
                    && !raw.starts_with('{')
                    && !raw.starts_with('[')
                    && raw != "null"
            }
            None => false,
        }
    }

    pub fn has_valid_version(&self) -> bool {
        self.jsonrpc.as_deref() == Some(VERSION)
    }

    fn has_method(&self) -> bool {
        self.method.as_deref().is_some_and(|m| !m.is_empty())
    }

    /// The raw textual encoding of the id, used as the correlation key.
    pub fn id_text(&self) -> Option<&str> {
        self.id.as_deref().map(RawValue::get)
    }

    /// True if the method carries the subscribe suffix.
    pub fn is_subscribe(&self) -> bool {
        self.method
            .as_deref()
            .is_some_and(|m| m.ends_with(SUBSCRIBE_METHOD_SUFFIX))
    }

    /// True if the method carries the unsubscribe suffix.
    pub fn is_unsubscribe(&self) -> bool {
        self.method
            .as_deref()
            .is_some_and(|m| m.ends_with(UNSUBSCRIBE_METHOD_SUFFIX))
    }

    /// True if the method carries the event notification suffix.
    pub fn is_subscription_notification(&self) -> bool {
        self.method
            .as_deref()
            .is_some_and(|m| m.ends_with(NOTIFICATION_METHOD_SUFFIX))
    }

    /// The namespace component of the method (text before the first `_`).
    pub fn namespace(&self) -> &str {
        let method = self.method.as_deref().unwrap_or("");
        method.split(METHOD_SEPARATOR).next().unwrap_or("")
    }

    /// Build a call message.
    pub fn call(id: Box<RawValue>, method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            jsonrpc: Some(VERSION.to_string()),
            id: Some(id),
            method: Some(method.into()),
            params,
            ..Default::default()
        }
    }

    /// Build a notification message.
    pub fn notification(method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            jsonrpc: Some(VERSION.to_string()),
            method: Some(method.into()),
            params,
            ..Default::default()
        }
    }

    /// Build the success response to this message. Serialization failure of
    /// the result is reported as an internal error response instead.
    pub fn response(&self, result: &Value) -> Message {
        match serde_json::value::to_raw_value(result) {
            Ok(raw) => Message {
                jsonrpc: Some(VERSION.to_string()),
                id: self.id.clone(),
                result: Some(raw),
                ..Default::default()
            },
            Err(e) => self.error_response(ErrorObject::new(
                CODE_INTERNAL_ERROR,
                format!("result serialization failed: {e}"),
            )),
        }
    }

    /// Build the error response to this message, reusing its id.
    pub fn error_response(&self, error: ErrorObject) -> Message {
        Message {
            jsonrpc: Some(VERSION.to_string()),
            id: self.id.clone(),
            error: Some(error),
            ..Default::default()
        }
    }

    /// Build an error response with a `null` id, for messages whose id is
    /// unusable (parse errors, invalid requests).
    pub fn null_id_error(error: ErrorObject) -> Message {
        Message {
            jsonrpc: Some(VERSION.to_string()),
            id: serde_json::value::to_raw_value(&Value::Null).ok(),
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Params payload of a subscription event notification:
/// `{"subscription": id, "result": payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    pub subscription: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "raw_or_null"
    )]
    pub result: Option<Box<RawValue>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Message {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn classifies_call() {
        let msg = parse(r#"{"jsonrpc":"2.0","id":1,"method":"eth_getBlock","params":[]}"#);
        assert!(msg.is_call());
        assert!(!msg.is_notification());
        assert!(!msg.is_response());
        assert_eq!(msg.id_text(), Some("1"));
        assert_eq!(msg.namespace(), "eth");
    }

    #[test]
    fn classifies_notification() {
        let msg = parse(r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{}}"#);
        assert!(msg.is_notification());
        assert!(!msg.is_call());
        assert!(!msg.is_response());
    }

    #[test]
    fn classifies_response() {
        let msg = parse(r#"{"jsonrpc":"2.0","id":"abc","result":{"ok":true}}"#);
        assert!(msg.is_response());
        assert!(!msg.is_call());

        let msg = parse(r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"nope"}}"#);
        assert!(msg.is_response());
    }

    #[test]
    fn null_result_is_still_a_response() {
        let msg = parse(r#"{"jsonrpc":"2.0","id":7,"result":null}"#);
        assert!(msg.is_response());
        assert_eq!(msg.result.as_ref().unwrap().get(), "null");
    }

    #[test]
    fn result_and_error_together_is_invalid() {
        let msg = parse(
            r#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":-32000,"message":"x"}}"#,
        );
        assert!(!msg.is_response());
    }

    #[test]
    fn rejects_invalid_ids() {
        for raw in [
            r#"{"jsonrpc":"2.0","id":null,"method":"m"}"#,
            r#"{"jsonrpc":"2.0","id":{},"method":"m"}"#,
            r#"{"jsonrpc":"2.0","id":[1],"method":"m"}"#,
        ] {
            let msg = parse(raw);
            assert!(!msg.is_call(), "should reject: {raw}");
            assert!(!msg.is_notification(), "null id is not absent: {raw}");
        }
    }

    #[test]
    fn rejects_missing_or_wrong_version() {
        let msg = parse(r#"{"id":1,"method":"m"}"#);
        assert!(!msg.is_call());
        let msg = parse(r#"{"jsonrpc":"1.0","id":1,"method":"m"}"#);
        assert!(!msg.is_call());
    }

    #[test]
    fn exactly_one_classification_holds() {
        let samples = [
            r#"{"jsonrpc":"2.0","id":1,"method":"a_b"}"#,
            r#"{"jsonrpc":"2.0","method":"a_b"}"#,
            r#"{"jsonrpc":"2.0","id":1,"result":0}"#,
        ];
        for s in samples {
            let m = parse(s);
            let n = [m.is_call(), m.is_notification(), m.is_response()]
                .iter()
                .filter(|b| **b)
                .count();
            assert_eq!(n, 1, "exactly one kind for {s}");
        }
    }

    #[test]
    fn subscribe_suffix_detection() {
        let msg = parse(r#"{"jsonrpc":"2.0","id":1,"method":"eth_subscribe","params":["newHeads"]}"#);
        assert!(msg.is_subscribe());
        assert!(!msg.is_unsubscribe());
        let msg = parse(r#"{"jsonrpc":"2.0","id":1,"method":"eth_unsubscribe","params":["0x1"]}"#);
        assert!(msg.is_unsubscribe());
    }

    #[test]
    fn response_preserves_id_encoding() {
        let msg = parse(r#"{"jsonrpc":"2.0","id":"req-9","method":"x_y"}"#);
        let resp = msg.response(&serde_json::json!("pong"));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""id":"req-9""#));
        assert!(json.contains(r#""result":"pong""#));
        assert!(!json.contains("error"));
    }

    #[test]
    fn null_id_error_serializes_null() {
        let resp = Message::null_id_error(ErrorObject::new(-32600, "invalid request"));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""id":null"#));
    }

    #[test]
    fn subscription_payload_round_trip() {
        let json = r#"{"subscription":"0x9a8b","result":{"n":1}}"#;
        let p: SubscriptionPayload = serde_json::from_str(json).unwrap();
        assert_eq!(p.subscription, "0x9a8b");
        assert_eq!(p.result.as_ref().unwrap().get(), r#"{"n":1}"#);
    }
}
