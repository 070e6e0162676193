// electrum-protocol: wire types and pure framing helpers for the Electrum
// newline-delimited JSON-RPC dialect.
//
// This crate holds no state and performs no I/O. Everything here is a pure
// function over strings and `serde_json::Value`s, so it can be exercised
// directly by property tests without standing up a transport.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The framing delimiter between statements on the wire.
pub const STATEMENT_DELIMITER: char = '\n';

/// Validates negotiated/requested protocol version strings, e.g. `"1.4.1"`.
fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+(\.\d+)+$").expect("version regex is valid"))
}

/// Returns `true` iff `version` matches `^\d+(\.\d+)+$`.
pub fn is_valid_version(version: &str) -> bool {
    version_regex().is_match(version)
}

// ---------------------------------------------------------------------------
// Request ids
// ---------------------------------------------------------------------------

/// A request id: either an ordinary monotonic counter value, or one of the
/// two protocol sentinels (`"versionNegotiation"`, `"keepAlive"`).
///
/// Keeping the sentinels as a distinct variant (rather than comparing raw
/// strings at call sites) is what lets the pending-request table treat
/// `"keepAlive"` as a guaranteed non-collision with any numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    Numeric(u64),
    Keyword(&'static str),
}

impl RequestId {
    pub const VERSION_NEGOTIATION: RequestId = RequestId::Keyword("versionNegotiation");
    pub const KEEP_ALIVE: RequestId = RequestId::Keyword("keepAlive");
}

impl Serialize for RequestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            RequestId::Numeric(n) => serializer.serialize_u64(*n),
            RequestId::Keyword(s) => serializer.serialize_str(s),
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Numeric(n) => write!(f, "{n}"),
            RequestId::Keyword(s) => write!(f, "{s}"),
        }
    }
}

fn request_id_from_value(value: &Value) -> Option<RequestId> {
    match value {
        Value::Number(n) => n.as_u64().map(RequestId::Numeric),
        Value::String(s) if s == "versionNegotiation" => Some(RequestId::VERSION_NEGOTIATION),
        Value::String(s) if s == "keepAlive" => Some(RequestId::KEEP_ALIVE),
        // Any other string id round-trips as a numeric-shaped keyword is not
        // possible here since RequestId::Keyword is restricted to the two
        // known sentinels; unrecognized string ids are carried in
        // `Statement::Response::raw_id` instead (see `parse_statement`).
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Outbound request frames
// ---------------------------------------------------------------------------

/// Builds one outbound request frame (without the trailing delimiter).
///
/// Deliberately omits a `"jsonrpc"` field: some Electrum servers disconnect
/// clients that advertise `"jsonrpc":"2.0"` incorrectly, so omission is the
/// safe, portable choice.
pub fn build_request(method: &str, params: &[Value], id: &RequestId) -> String {
    let frame = serde_json::json!({
        "method": method,
        "params": params,
        "id": id,
    });
    frame.to_string()
}

// ---------------------------------------------------------------------------
// Inbound statements
// ---------------------------------------------------------------------------

/// The `error` object of a JSON-RPC-ish error response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct ServerErrorPayload {
    pub message: String,
    #[serde(default)]
    pub code: Option<i64>,
}

/// One parsed inbound statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// A reply to a request previously sent by us.
    Response {
        id: RequestId,
        outcome: Result<Value, ServerErrorPayload>,
    },
    /// A server-pushed notification (no id, has a method).
    Notification { method: String, params: Value },
    /// A JSON-RPC batch: each element is parsed and routed independently,
    /// never re-serialized back into a string (see SPEC_FULL.md §9).
    Batch(Vec<Statement>),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("statement is neither a response nor a notification: {0}")]
    Unrecognized(Value),
    #[error("response id is not a recognized request-id shape: {0}")]
    UnrecognizedId(Value),
}

/// Parses one raw statement string (without its trailing delimiter) into a
/// [`Statement`].
pub fn parse_statement(raw: &str) -> Result<Statement, ParseError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    parse_value(value)
}

fn parse_value(value: Value) -> Result<Statement, ParseError> {
    match value {
        Value::Array(items) => {
            let parsed = items
                .into_iter()
                .map(parse_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Statement::Batch(parsed))
        }
        Value::Object(ref map) => {
            if let Some(id_value) = map.get("id").filter(|v| !v.is_null()) {
                let id = request_id_from_value(id_value)
                    .ok_or_else(|| ParseError::UnrecognizedId(id_value.clone()))?;
                let outcome = if let Some(error_value) = map.get("error").filter(|v| !v.is_null())
                {
                    let payload: ServerErrorPayload =
                        serde_json::from_value(error_value.clone())
                            .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
                    Err(payload)
                } else {
                    Ok(map.get("result").cloned().unwrap_or(Value::Null))
                };
                Ok(Statement::Response { id, outcome })
            } else if let Some(Value::String(method)) = map.get("method") {
                let params = map.get("params").cloned().unwrap_or(Value::Null);
                Ok(Statement::Notification {
                    method: method.clone(),
                    params,
                })
            } else {
                Err(ParseError::Unrecognized(value))
            }
        }
        other => Err(ParseError::Unrecognized(other)),
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Appends `chunk` to `buffer`, then repeatedly splits off completed
/// statements (delimited by [`STATEMENT_DELIMITER`]) and passes each to
/// `emit`, in arrival order. The trailing, possibly-incomplete remainder is
/// left in `buffer` for the next call.
///
/// This is the entire framing algorithm; it performs no I/O and is pure over
/// its two arguments plus the `emit` callback, which is what makes it
/// directly testable by property tests (see `tests/framing_proptest.rs`).
pub fn frame_chunk(buffer: &mut String, chunk: &str, mut emit: impl FnMut(String)) {
    buffer.push_str(chunk);
    while let Some(pos) = buffer.find(STATEMENT_DELIMITER) {
        let rest = buffer.split_off(pos + STATEMENT_DELIMITER.len_utf8());
        let mut statement = std::mem::replace(buffer, rest);
        statement.pop(); // drop the trailing delimiter
        emit(statement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_versions() {
        assert!(is_valid_version("1.4"));
        assert!(is_valid_version("1.4.1"));
        assert!(is_valid_version("10.20.30"));
        assert!(!is_valid_version("1"));
        assert!(!is_valid_version("v1.4"));
        assert!(!is_valid_version(""));
    }

    #[test]
    fn build_request_omits_jsonrpc_field() {
        let frame = build_request("server.version", &[], &RequestId::VERSION_NEGOTIATION);
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert!(value.get("jsonrpc").is_none());
        assert_eq!(value["method"], "server.version");
        assert_eq!(value["id"], "versionNegotiation");
    }

    #[test]
    fn parse_statement_response_success() {
        let stmt = parse_statement(r#"{"id":1,"result":"a"}"#).unwrap();
        assert_eq!(
            stmt,
            Statement::Response {
                id: RequestId::Numeric(1),
                outcome: Ok(Value::String("a".into())),
            }
        );
    }

    #[test]
    fn parse_statement_response_error() {
        let stmt = parse_statement(r#"{"id":2,"error":{"message":"boom","code":-1}}"#).unwrap();
        assert_eq!(
            stmt,
            Statement::Response {
                id: RequestId::Numeric(2),
                outcome: Err(ServerErrorPayload {
                    message: "boom".into(),
                    code: Some(-1),
                }),
            }
        );
    }

    #[test]
    fn parse_statement_keep_alive_sentinel() {
        let stmt = parse_statement(r#"{"id":"keepAlive","result":null}"#).unwrap();
        assert_eq!(
            stmt,
            Statement::Response {
                id: RequestId::KEEP_ALIVE,
                outcome: Ok(Value::Null),
            }
        );
    }

    #[test]
    fn parse_statement_notification() {
        let stmt = parse_statement(
            r#"{"method":"blockchain.headers.subscribe","params":[{"height":1}]}"#,
        )
        .unwrap();
        assert_eq!(
            stmt,
            Statement::Notification {
                method: "blockchain.headers.subscribe".into(),
                params: serde_json::json!([{"height": 1}]),
            }
        );
    }

    #[test]
    fn parse_statement_batch_routes_elements_directly() {
        let stmt = parse_statement(r#"[{"id":1,"result":"a"},{"id":2,"result":"b"}]"#).unwrap();
        assert_eq!(
            stmt,
            Statement::Batch(vec![
                Statement::Response {
                    id: RequestId::Numeric(1),
                    outcome: Ok(Value::String("a".into())),
                },
                Statement::Response {
                    id: RequestId::Numeric(2),
                    outcome: Ok(Value::String("b".into())),
                },
            ])
        );
    }

    #[test]
    fn frame_chunk_emits_complete_statements_in_order() {
        let mut buffer = String::new();
        let mut emitted = Vec::new();
        frame_chunk(&mut buffer, "a\nb\nc", |s| emitted.push(s));
        assert_eq!(emitted, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(buffer, "c");
    }

    #[test]
    fn frame_chunk_handles_split_statement_across_chunks() {
        let mut buffer = String::new();
        let mut emitted = Vec::new();
        frame_chunk(&mut buffer, r#"{"id":1,"result":"a"}"#, |s| emitted.push(s));
        assert!(emitted.is_empty());
        frame_chunk(&mut buffer, "\n{\"id\":2,\"resu", |s| emitted.push(s));
        assert_eq!(emitted, vec![r#"{"id":1,"result":"a"}"#.to_string()]);
        frame_chunk(&mut buffer, "lt\":\"b\"}\n", |s| emitted.push(s));
        assert_eq!(
            emitted,
            vec![
                r#"{"id":1,"result":"a"}"#.to_string(),
                r#"{"id":2,"result":"b"}"#.to_string(),
            ]
        );
        assert_eq!(buffer, "");
    }

    #[test]
    fn frame_chunk_trailing_empty_part_resets_buffer() {
        let mut buffer = String::new();
        let mut emitted = Vec::new();
        frame_chunk(&mut buffer, "only\n", |s| emitted.push(s));
        assert_eq!(emitted, vec!["only".to_string()]);
        assert_eq!(buffer, "");
    }
}
