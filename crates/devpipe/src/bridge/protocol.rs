//! Wire protocol types for the debugging pipe.
//!
//! Outbound traffic is always a [`Request`]. Inbound frames are classified
//! exactly once into an [`Inbound`] variant, by presence of `id`, `error` and
//! `method`, before anything is routed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Session id of the implicit browser-level session.
pub const ROOT_SESSION: &str = "";

/// Command sent to the remote end.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<'a> {
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
    pub session_id: &'a str,
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Response carrying `result`.
    Success { id: u64, result: Value },
    /// Response carrying `error`.
    Failure { id: u64, error: RemoteError },
    /// Error not tied to any request, addressed to a session.
    GlobalError { session_id: String, error: Value },
    /// Event addressed to a session.
    Event {
        session_id: String,
        method: String,
        params: Value,
    },
    /// Anything that fits none of the above.
    Malformed { reason: String },
}

impl Inbound {
    /// Classify one frame of text.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(object)) => Self::classify(object),
            Ok(other) => Self::malformed(format!("expected a JSON object, got {}", kind(&other))),
            Err(e) => Self::malformed(format!("invalid JSON: {e}")),
        }
    }

    fn classify(mut object: Map<String, Value>) -> Self {
        if let Some(id) = object.remove("id") {
            let Some(id) = id.as_u64() else {
                return Self::malformed(format!("response id is not a positive integer: {id}"));
            };

            if let Some(error) = object.remove("error") {
                return match serde_json::from_value::<RemoteError>(error) {
                    Ok(error) => Self::Failure { id, error },
                    Err(e) => Self::malformed(format!("response {id} has an invalid error: {e}")),
                };
            }

            return match object.remove("result") {
                Some(result) => Self::Success { id, result },
                None => Self::malformed(format!("response {id} has neither result nor error")),
            };
        }

        let session_id = match object.remove("sessionId") {
            None | Some(Value::Null) => ROOT_SESSION.to_string(),
            Some(Value::String(session_id)) => session_id,
            Some(other) => {
                return Self::malformed(format!("sessionId is not a string: {other}"));
            }
        };

        if let Some(error) = object.remove("error") {
            return Self::GlobalError { session_id, error };
        }

        match object.remove("method") {
            Some(Value::String(method)) => Self::Event {
                session_id,
                method,
                params: object.remove("params").unwrap_or(Value::Null),
            },
            Some(other) => Self::malformed(format!("method is not a string: {other}")),
            None => Self::malformed("message has no id, error or method"),
        }
    }

    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_with_camel_case_session() {
        let params = json!({"url": "about:blank"});
        let request = Request {
            id: 7,
            method: "Target.createTarget",
            params: Some(&params),
            session_id: ROOT_SESSION,
        };
        insta::assert_json_snapshot!(request, @r#"
        {
          "id": 7,
          "method": "Target.createTarget",
          "params": {
            "url": "about:blank"
          },
          "sessionId": ""
        }
        "#);
    }

    #[test]
    fn request_omits_absent_params() {
        let request = Request {
            id: 1,
            method: "Fetch.enable",
            params: None,
            session_id: "ABC",
        };
        let text = serde_json::to_string(&request).unwrap();
        assert_eq!(text, r#"{"id":1,"method":"Fetch.enable","sessionId":"ABC"}"#);
    }

    #[test]
    fn parses_success_response() {
        let inbound = Inbound::parse(r#"{"id":1,"result":{}}"#);
        assert_eq!(
            inbound,
            Inbound::Success {
                id: 1,
                result: json!({})
            }
        );
    }

    #[test]
    fn parses_failure_response() {
        let inbound =
            Inbound::parse(r#"{"id":3,"error":{"code":-32601,"message":"'Foo.bar' wasn't found"}}"#);
        assert_eq!(
            inbound,
            Inbound::Failure {
                id: 3,
                error: RemoteError {
                    message: "'Foo.bar' wasn't found".to_string(),
                    code: Some(-32601),
                    data: None,
                },
            }
        );
    }

    #[test]
    fn error_wins_over_result_in_response() {
        let inbound = Inbound::parse(r#"{"id":2,"result":{},"error":{"message":"boom"}}"#);
        assert!(matches!(inbound, Inbound::Failure { id: 2, .. }));
    }

    #[test]
    fn parses_event_with_default_root_session() {
        let inbound = Inbound::parse(r#"{"method":"Fetch.requestPaused","params":{"requestId":"r1"}}"#);
        assert_eq!(
            inbound,
            Inbound::Event {
                session_id: ROOT_SESSION.to_string(),
                method: "Fetch.requestPaused".to_string(),
                params: json!({"requestId": "r1"}),
            }
        );
    }

    #[test]
    fn parses_event_for_child_session() {
        let inbound =
            Inbound::parse(r#"{"method":"Page.loadEventFired","params":{},"sessionId":"S1"}"#);
        assert!(matches!(
            inbound,
            Inbound::Event { ref session_id, ref method, .. }
                if session_id == "S1" && method == "Page.loadEventFired"
        ));
    }

    #[test]
    fn parses_global_error() {
        let inbound = Inbound::parse(r#"{"sessionId":"S1","error":{"message":"detached"}}"#);
        assert_eq!(
            inbound,
            Inbound::GlobalError {
                session_id: "S1".to_string(),
                error: json!({"message": "detached"}),
            }
        );
    }

    #[test]
    fn response_without_result_or_error_is_malformed() {
        assert!(matches!(
            Inbound::parse(r#"{"id":4}"#),
            Inbound::Malformed { .. }
        ));
    }

    #[test]
    fn non_object_and_invalid_json_are_malformed() {
        assert!(matches!(Inbound::parse("[1,2]"), Inbound::Malformed { .. }));
        assert!(matches!(Inbound::parse(""), Inbound::Malformed { .. }));
        assert!(matches!(Inbound::parse("{\"id\":"), Inbound::Malformed { .. }));
    }

    #[test]
    fn object_without_discriminator_is_malformed() {
        let inbound = Inbound::parse(r#"{"params":{}}"#);
        assert_eq!(
            inbound,
            Inbound::Malformed {
                reason: "message has no id, error or method".to_string()
            }
        );
    }

    #[test]
    fn negative_id_is_malformed() {
        assert!(matches!(
            Inbound::parse(r#"{"id":-1,"result":{}}"#),
            Inbound::Malformed { .. }
        ));
    }
}
