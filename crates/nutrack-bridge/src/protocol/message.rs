//! Pipe frame types.
//!
//! Every line on the pipe is one JSON object discriminated by `type`:
//!
//! ```text
//! {"type":"request","requestId":"<id>","method":"GET","endpoint":"/x","data":{...,"urlParams":[]}}
//! {"type":"response","requestId":"<id>","data":{...}}
//! {"type":"response","requestId":"<id>","error":"<message>"}
//! {"type":"push-event","data":<opaque>}
//! ```

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One framed message on the pipe, decoded once at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FramedMessage {
    #[serde(rename = "request")]
    Request(RequestFrame),
    #[serde(rename = "response")]
    Response(ResponseFrame),
    /// Older backends tag pushes as `sse-message`.
    #[serde(rename = "push-event", alias = "sse-message")]
    PushEvent(PushFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub request_id: String,
    pub method: String,
    pub endpoint: String,
    #[serde(default)]
    pub data: Value,
}

impl RequestFrame {
    /// Path/query fragments packed into `data.urlParams`.
    pub fn url_params(&self) -> Vec<String> {
        self.data
            .get("urlParams")
            .and_then(Value::as_array)
            .map(|params| {
                params
                    .iter()
                    .map(|p| match p {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    /// Empty when the backend could not read the request's id.
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ResponseFrame {
    /// Settle the frame into the caller-facing result.
    ///
    /// Errors arrive either as a top-level `error` (string or object) or
    /// nested as `data.error` with `{message, code}`.
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error.filter(|e| !e.is_null()) {
            return Err(remote_error(error));
        }

        let data = self.data.unwrap_or(Value::Null);
        if let Some(error) = data.get("error").filter(|e| !e.is_null()) {
            return Err(remote_error(error.clone()));
        }

        Ok(data)
    }
}

fn remote_error(error: Value) -> BridgeError {
    match error {
        Value::String(message) => BridgeError::remote(message),
        Value::Object(map) => {
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string());
            let code = map.get("code").and_then(Value::as_str).map(str::to_string);
            BridgeError::Remote {
                message,
                status: None,
                code,
            }
        }
        other => BridgeError::remote(other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    #[serde(default)]
    pub data: Value,
}

impl FramedMessage {
    pub fn request(
        request_id: impl Into<String>,
        method: impl Into<String>,
        endpoint: impl Into<String>,
        data: Value,
    ) -> Self {
        FramedMessage::Request(RequestFrame {
            request_id: request_id.into(),
            method: method.into(),
            endpoint: endpoint.into(),
            data,
        })
    }

    pub fn response(request_id: impl Into<String>, data: Value) -> Self {
        FramedMessage::Response(ResponseFrame {
            request_id: request_id.into(),
            data: Some(data),
            error: None,
        })
    }

    pub fn error_response(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        FramedMessage::Response(ResponseFrame {
            request_id: request_id.into(),
            data: None,
            error: Some(Value::String(message.into())),
        })
    }

    pub fn push(data: Value) -> Self {
        FramedMessage::PushEvent(PushFrame { data })
    }

    /// Correlation id for request/response frames.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            FramedMessage::Request(frame) => Some(&frame.request_id),
            FramedMessage::Response(frame) => Some(&frame.request_id),
            FramedMessage::PushEvent(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FramedMessage::Request(_) => "request",
            FramedMessage::Response(_) => "response",
            FramedMessage::PushEvent(_) => "push-event",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let frame = FramedMessage::request(
            "k3j9x",
            "PUT",
            "/foodItems",
            json!({"data": {"name": "Oats"}, "urlParams": ["4001"]}),
        );
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["type"], "request");
        assert_eq!(value["requestId"], "k3j9x");
        assert_eq!(value["method"], "PUT");
        assert_eq!(value["data"]["urlParams"][0], "4001");
    }

    #[test]
    fn test_error_response_omits_data() {
        let json = serde_json::to_string(&FramedMessage::error_response("a1", "boom")).unwrap();
        assert!(json.contains("\"error\":\"boom\""));
        assert!(!json.contains("\"data\""));
    }

    #[test]
    fn test_legacy_push_tag_accepted() {
        let frame: FramedMessage =
            serde_json::from_str(r#"{"type":"sse-message","data":"DB_UPDATED"}"#).unwrap();
        assert_eq!(frame, FramedMessage::push(json!("DB_UPDATED")));
    }

    #[test]
    fn test_into_result_top_level_error() {
        let frame: ResponseFrame =
            serde_json::from_value(json!({"requestId": "a", "error": "invalid barcode"})).unwrap();
        let err = frame.into_result().unwrap_err();
        assert_eq!(err.to_string(), "invalid barcode");
    }

    #[test]
    fn test_into_result_nested_backend_error() {
        let frame: ResponseFrame = serde_json::from_value(json!({
            "requestId": "a",
            "data": {"error": {"message": "ProfileID is required", "code": "BACKEND_ERROR"}}
        }))
        .unwrap();

        match frame.into_result().unwrap_err() {
            BridgeError::Remote { message, code, .. } => {
                assert_eq!(message, "ProfileID is required");
                assert_eq!(code.as_deref(), Some("BACKEND_ERROR"));
            }
            other => panic!("Expected Remote, got: {:?}", other),
        }
    }

    #[test]
    fn test_into_result_missing_data_is_null() {
        let frame: ResponseFrame = serde_json::from_value(json!({"requestId": "a"})).unwrap();
        assert_eq!(frame.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_url_params_stringified() {
        let frame = RequestFrame {
            request_id: "x".into(),
            method: "GET".into(),
            endpoint: "/dishes".into(),
            data: json!({"urlParams": ["12", 7]}),
        };
        assert_eq!(frame.url_params(), vec!["12".to_string(), "7".to_string()]);
    }
}
