//! Newline-delimited JSON codec.
//!
//! Request:  `{"id": 1, "fn": "path.to.function", "args": [...]}`
//! Success:  `{"id": 1, "result": <value>}`
//! Failure:  `{"id": 1, "error": {"message": "...", "stack": "..."}}`
//!
//! The `id` correlates a response with its request. The protocol is
//! single-call-in-flight, so correlation degenerates to an equality check,
//! but the field keeps the wire format ready for pipelined calls.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{BridgeError, Result};

/// A decoded call request. The companion side of the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed back in the response.
    pub id: u64,
    /// Function path inside the companion's address space.
    #[serde(rename = "fn")]
    pub path: String,
    /// Argument list. Absent means no arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// An error payload reported by the companion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFault {
    /// Human-readable message.
    pub message: String,
    /// Companion-side stack trace, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// A decoded call response: either a result value or a fault.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    /// Correlation id of the request this answers.
    pub id: u64,
    /// Result value on success. A missing field decodes as JSON null.
    #[serde(default)]
    pub result: Option<Value>,
    /// Fault payload on failure.
    #[serde(default)]
    pub error: Option<RemoteFault>,
}

impl Response {
    /// Split the response into a result value or a fault.
    pub fn into_result(self) -> std::result::Result<Value, RemoteFault> {
        match self.error {
            Some(fault) => Err(fault),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Encode one call request as a single JSON line (without the trailing
/// newline - the writer appends it).
pub fn encode_request(id: u64, path: &str, args: &[Value]) -> Result<String> {
    let msg = json!({ "id": id, "fn": path, "args": args });
    Ok(serde_json::to_string(&msg)?)
}

/// Decode one response line.
///
/// # Errors
///
/// Returns [`BridgeError::Protocol`] if the line is not a well-formed
/// response message.
pub fn decode_response(line: &str) -> Result<Response> {
    serde_json::from_str(line)
        .map_err(|e| BridgeError::Protocol(format!("undecodable response line: {e}")))
}

/// Decode one request line (companion side).
pub fn decode_request(line: &str) -> Result<Request> {
    serde_json::from_str(line)
        .map_err(|e| BridgeError::Protocol(format!("undecodable request line: {e}")))
}

/// Encode a success response as a single JSON line (companion side).
pub fn encode_result(id: u64, value: &Value) -> Result<String> {
    let msg = json!({ "id": id, "result": value });
    Ok(serde_json::to_string(&msg)?)
}

/// Encode a failure response as a single JSON line (companion side).
pub fn encode_fault(id: u64, fault: &RemoteFault) -> Result<String> {
    let msg = json!({ "id": id, "error": fault });
    Ok(serde_json::to_string(&msg)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let line = encode_request(7, "greet", &[json!("world"), json!(2)]).unwrap();
        let request = decode_request(&line).unwrap();

        assert_eq!(request.id, 7);
        assert_eq!(request.path, "greet");
        assert_eq!(request.args, vec![json!("world"), json!(2)]);
    }

    #[test]
    fn test_request_without_args_decodes_empty() {
        let request = decode_request(r#"{"id":3,"fn":"tick"}"#).unwrap();
        assert_eq!(request.id, 3);
        assert!(request.args.is_empty());
    }

    #[test]
    fn test_response_result() {
        let response = decode_response(r#"{"id":1,"result":456}"#).unwrap();
        assert_eq!(response.id, 1);
        assert_eq!(response.into_result().unwrap(), json!(456));
    }

    #[test]
    fn test_response_missing_result_is_null() {
        let response = decode_response(r#"{"id":1}"#).unwrap();
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_response_fault() {
        let line = r#"{"id":2,"error":{"message":"boom","stack":"at foo:1"}}"#;
        let fault = decode_response(line).unwrap().into_result().unwrap_err();

        assert_eq!(fault.message, "boom");
        assert_eq!(fault.stack.as_deref(), Some("at foo:1"));
    }

    #[test]
    fn test_fault_without_stack() {
        let line = encode_fault(
            9,
            &RemoteFault {
                message: "nope".to_string(),
                stack: None,
            },
        )
        .unwrap();

        // stack is omitted, not serialized as null
        assert!(!line.contains("stack"));
        let fault = decode_response(&line).unwrap().into_result().unwrap_err();
        assert_eq!(fault.message, "nope");
        assert!(fault.stack.is_none());
    }

    #[test]
    fn test_malformed_line_is_protocol_error() {
        let err = decode_response("not json at all").unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));

        let err = decode_request(r#"{"id":"not a number"}"#).unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    /// Lossless round trip for all JSON value shapes, including nested
    /// containers and unicode strings.
    #[test]
    fn test_value_roundtrip() {
        let values = vec![
            Value::Null,
            json!(true),
            json!(-42),
            json!(3.5),
            json!("płótno 🚀 \u{2603}"),
            json!([1, [2, [3, "x"]], {"k": null}]),
            json!({"outer": {"inner": ["ä", 1.25, false]}, "empty": {}}),
        ];

        for value in values {
            let line = encode_result(11, &value).unwrap();
            let back = decode_response(&line).unwrap().into_result().unwrap();
            assert_eq!(back, value);
        }
    }

    /// Embedded newlines and other control characters must not break the
    /// one-message-per-line framing.
    #[test]
    fn test_embedded_delimiters_stay_on_one_line() {
        let tricky = json!({"text": "line one\nline two\r\n\ttabbed"});
        let line = encode_request(1, "echo", &[tricky.clone()]).unwrap();

        assert!(!line.contains('\n'));
        assert!(!line.contains('\r'));

        let request = decode_request(&line).unwrap();
        assert_eq!(request.args[0], tricky);
    }

    #[test]
    fn test_large_payload_single_line() {
        let big = json!(vec!["chunk\n"; 10_000]);
        let line = encode_result(5, &big).unwrap();

        assert!(!line.contains('\n'));
        assert_eq!(decode_response(&line).unwrap().into_result().unwrap(), big);
    }
}
