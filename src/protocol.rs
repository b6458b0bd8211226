//! Shared JSON wire framing for control-surface protocols
//!
//! Both target applications speak one complete JSON object per WebSocket
//! text message. Requests carry an application envelope (`apiName`,
//! `apiVersion`, `requestID`) plus a `messageType` discriminator and an
//! optional `data` payload; responses and pushes carry the discriminator
//! and a `data` object whose shape is keyed by it. Dispatch is always by
//! `messageType`; reply correlation uses the echoed `requestID` where the
//! remote party provides one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{Result, StagehandError};

/// Application name advertised in every request envelope.
pub const API_NAME: &str = "Stagehand";

/// Envelope version advertised in every request envelope.
pub const API_VERSION: &str = "1.0";

/// Discriminator both targets use for application-level errors.
pub const MSG_API_ERROR: &str = "APIError";

/// Outbound request envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub api_name: &'static str,
    pub api_version: &'static str,
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Request {
    pub fn new(message_type: &str, data: Option<Value>) -> Self {
        Self {
            api_name: API_NAME,
            api_version: API_VERSION,
            request_id: Uuid::new_v4().to_string(),
            message_type: message_type.to_string(),
            data,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inbound message: a response to one of our requests, or an unsolicited
/// push. The two are distinguished by `messageType` alone.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(rename = "requestID", default)]
    pub request_id: Option<String>,
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| StagehandError::Protocol(format!("undecodable message: {e}")))
    }

    /// The application-level error carried by this message, if it is one.
    pub fn api_error(&self) -> Option<ApiError> {
        (self.message_type == MSG_API_ERROR)
            .then(|| serde_json::from_value(self.data.clone()).unwrap_or_default())
    }
}

/// Application-level error payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiError {
    #[serde(rename = "errorID", default)]
    pub error_id: i64,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_fields() {
        let request = Request::new("HotkeyTriggerRequest", Some(json!({"hotkeyID": "h1"})));
        let encoded = request.encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["apiName"], API_NAME);
        assert_eq!(value["apiVersion"], API_VERSION);
        assert_eq!(value["messageType"], "HotkeyTriggerRequest");
        assert_eq!(value["data"]["hotkeyID"], "h1");
        assert!(!value["requestID"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_request_omits_empty_data() {
        let request = Request::new("HotkeysInCurrentModelRequest", None);
        let encoded = request.encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = Request::new("GetVersionRequest", None);
        let b = Request::new("GetVersionRequest", None);
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_response_decode_dispatches_by_discriminator() {
        let raw = r#"{"messageType":"AuthenticationResponse","requestID":"42","data":{"authenticated":true}}"#;
        let response = Response::decode(raw).unwrap();
        assert_eq!(response.message_type, "AuthenticationResponse");
        assert_eq!(response.request_id.as_deref(), Some("42"));
        assert_eq!(response.data["authenticated"], true);
        assert!(response.api_error().is_none());
    }

    #[test]
    fn test_response_defaults_for_missing_fields() {
        let response = Response::decode(r#"{"messageType":"SomePush"}"#).unwrap();
        assert!(response.request_id.is_none());
        assert!(response.data.is_null());
    }

    #[test]
    fn test_response_rejects_garbage() {
        assert!(Response::decode("not json").is_err());
        assert!(Response::decode(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn test_api_error_extraction() {
        let raw = r#"{"messageType":"APIError","data":{"errorID":100,"message":"approval pending"}}"#;
        let response = Response::decode(raw).unwrap();
        let err = response.api_error().unwrap();
        assert_eq!(err.error_id, 100);
        assert_eq!(err.message, "approval pending");
    }
}
