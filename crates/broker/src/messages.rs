//! Wire message taxonomy.
//!
//! Every frame is one JSON object of shape `{type, data}`. Unknown top-level
//! fields are ignored (a few legacy producers still send them); unknown
//! `type` values take the explicit [`Inbound::Unknown`] path so the hub can
//! log and drop them without killing the connection.

use relay_core::{Error, Result, SessionSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

/// Raw inbound frame. `data` defaults to null for bare messages like
/// `get_active_sessions`.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::protocol(format!("invalid frame: {e}")))
    }
}

/// Error-class tracker messages that are both recorded and relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    JavascriptError,
    PromiseRejection,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::JavascriptError => "javascript_error",
            Self::PromiseRejection => "promise_rejection",
        }
    }
}

/// Decoded `session_start` payload.
///
/// Two shapes exist in the wild: metadata fields flattened into `data`, or a
/// nested `data.metadata` object. `sessionId` and `userId` are pulled out;
/// whatever remains is the opaque metadata snapshot.
#[derive(Debug, Clone, Validate)]
pub struct SessionStart {
    #[validate(length(min = 1, max = 128))]
    pub session_id: String,
    #[validate(length(max = 128))]
    pub user_id: String,
    pub metadata: Value,
}

impl SessionStart {
    fn from_data(data: Value) -> Result<Self> {
        let mut obj = match data {
            Value::Object(m) => m,
            _ => return Err(Error::protocol("session_start data must be an object")),
        };

        let session_id = obj
            .remove("sessionId")
            .and_then(|v| v.as_str().map(str::to_owned))
            .ok_or_else(|| Error::protocol("session_start missing sessionId"))?;
        let user_id = obj
            .remove("userId")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();

        let metadata = match obj.remove("metadata") {
            Some(nested @ Value::Object(_)) => nested,
            Some(other) if !other.is_null() => other,
            _ => Value::Object(obj),
        };

        let start = Self {
            session_id,
            user_id,
            metadata,
        };
        start
            .validate()
            .map_err(|e| Error::protocol(format!("session_start invalid: {e}")))?;
        Ok(start)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EventsBatchData {
    events: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SessionRefData {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ViewerSessionData {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GetSessionEventsData {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "fromIndex", default)]
    from_index: usize,
}

/// Parsed inbound message.
#[derive(Debug, Clone)]
pub enum Inbound {
    // Tracker
    SessionStart(SessionStart),
    EventsBatch(Vec<Value>),
    SessionEnd { session_id: Option<String> },
    Heartbeat { session_id: Option<String> },
    TrackerError { kind: ErrorKind, payload: Value },
    VisibilityChange(Value),

    // Viewer
    GetActiveSessions,
    ViewerJoin { session_id: String },
    ViewerLeave { session_id: String },
    GetSessionEvents { session_id: String, from_index: usize },

    Unknown(String),
}

impl Inbound {
    /// Dispatches on the envelope's `type` discriminant. Fields beyond a
    /// payload's declared schema are ignored; missing required fields are a
    /// protocol error.
    pub fn from_envelope(env: Envelope) -> Result<Self> {
        let msg = match env.kind.as_str() {
            "session_start" => Self::SessionStart(SessionStart::from_data(env.data)?),
            "events_batch" => {
                let data: EventsBatchData = decode(env.data, "events_batch")?;
                Self::EventsBatch(data.events)
            }
            "session_end" => {
                let data: SessionRefData = decode_or_default(env.data, "session_end")?;
                Self::SessionEnd {
                    session_id: data.session_id,
                }
            }
            "heartbeat" => {
                let data: SessionRefData = decode_or_default(env.data, "heartbeat")?;
                Self::Heartbeat {
                    session_id: data.session_id,
                }
            }
            "error" => Self::TrackerError {
                kind: ErrorKind::Error,
                payload: env.data,
            },
            "javascript_error" => Self::TrackerError {
                kind: ErrorKind::JavascriptError,
                payload: env.data,
            },
            "promise_rejection" => Self::TrackerError {
                kind: ErrorKind::PromiseRejection,
                payload: env.data,
            },
            "visibility_change" => Self::VisibilityChange(env.data),
            "get_active_sessions" => Self::GetActiveSessions,
            "viewer_join_session" => {
                let data: ViewerSessionData = decode(env.data, "viewer_join_session")?;
                Self::ViewerJoin {
                    session_id: data.session_id,
                }
            }
            "viewer_leave_session" => {
                let data: ViewerSessionData = decode(env.data, "viewer_leave_session")?;
                Self::ViewerLeave {
                    session_id: data.session_id,
                }
            }
            "get_session_events" => {
                let data: GetSessionEventsData = decode(env.data, "get_session_events")?;
                Self::GetSessionEvents {
                    session_id: data.session_id,
                    from_index: data.from_index,
                }
            }
            _ => Self::Unknown(env.kind),
        };
        Ok(msg)
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: Value, kind: &str) -> Result<T> {
    serde_json::from_value(data).map_err(|e| Error::protocol(format!("{kind} payload: {e}")))
}

fn decode_or_default<T: serde::de::DeserializeOwned + Default>(data: Value, kind: &str) -> Result<T> {
    if data.is_null() {
        return Ok(T::default());
    }
    decode(data, kind)
}

/// Outbound message, serialized as `{type, data}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Outbound {
    ActiveSessions {
        sessions: Vec<SessionSnapshot>,
    },
    #[serde(rename_all = "camelCase")]
    SessionStarted {
        session_id: String,
        user_id: String,
        metadata: Value,
    },
    #[serde(rename_all = "camelCase")]
    SessionEnded {
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionAssigned {
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionJoined {
        session_id: String,
        events: Vec<Value>,
        metadata: Value,
        total_events: u64,
        is_active: bool,
    },
    #[serde(rename_all = "camelCase")]
    SessionEvents {
        session_id: String,
        events: Vec<Value>,
        from_index: usize,
        total_events: u64,
        has_more: bool,
    },
    #[serde(rename_all = "camelCase")]
    EventsBatch {
        session_id: String,
        events: Vec<Value>,
    },
    Error {
        message: String,
    },
}

impl Outbound {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serializes to a wire frame. Infallible shapes only.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","data":{"message":"serialization failure"}}"#.to_string()
        })
    }
}

/// Builds a pass-through frame under the original wire kind
/// (`visibility_change`, `javascript_error`, …), tagging the payload with
/// the owning session.
pub fn relay_frame(kind: &str, session_id: &str, payload: &Value) -> String {
    let data = match payload {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("sessionId".to_string(), Value::String(session_id.to_string()));
            Value::Object(map)
        }
        other => serde_json::json!({
            "sessionId": session_id,
            "payload": other,
        }),
    };
    serde_json::json!({ "type": kind, "data": data }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_ignores_unknown_top_level_fields() {
        let env = Envelope::parse(
            r#"{"type":"heartbeat","data":{"sessionId":"s1"},"v":2,"ts":123}"#,
        )
        .unwrap();
        assert_eq!(env.kind, "heartbeat");
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let env = Envelope::parse(r#"{"type":"telemetry_blob","data":{}}"#).unwrap();
        match Inbound::from_envelope(env).unwrap() {
            Inbound::Unknown(kind) => assert_eq!(kind, "telemetry_blob"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_session_start_flat_shape() {
        let env = Envelope::parse(
            r#"{"type":"session_start","data":{"sessionId":"s1","userId":"u1","url":"/a","timeZone":"UTC"}}"#,
        )
        .unwrap();
        let Inbound::SessionStart(start) = Inbound::from_envelope(env).unwrap() else {
            panic!("expected SessionStart");
        };
        assert_eq!(start.session_id, "s1");
        assert_eq!(start.user_id, "u1");
        assert_eq!(start.metadata["url"], "/a");
        assert_eq!(start.metadata["timeZone"], "UTC");
        assert!(start.metadata.get("sessionId").is_none());
    }

    #[test]
    fn test_session_start_nested_metadata_shape() {
        let env = Envelope::parse(
            r#"{"type":"session_start","data":{"sessionId":"s1","userId":"u1","metadata":{"url":"/a"}}}"#,
        )
        .unwrap();
        let Inbound::SessionStart(start) = Inbound::from_envelope(env).unwrap() else {
            panic!("expected SessionStart");
        };
        assert_eq!(start.metadata, json!({"url": "/a"}));
    }

    #[test]
    fn test_session_start_missing_id_is_protocol_error() {
        let env = Envelope::parse(r#"{"type":"session_start","data":{"userId":"u1"}}"#).unwrap();
        assert!(Inbound::from_envelope(env).is_err());
    }

    #[test]
    fn test_events_batch_requires_events_field() {
        let env = Envelope::parse(r#"{"type":"events_batch","data":{}}"#).unwrap();
        assert!(Inbound::from_envelope(env).is_err());
    }

    #[test]
    fn test_heartbeat_without_data() {
        let env = Envelope::parse(r#"{"type":"heartbeat"}"#).unwrap();
        match Inbound::from_envelope(env).unwrap() {
            Inbound::Heartbeat { session_id } => assert!(session_id.is_none()),
            other => panic!("expected Heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn test_outbound_frame_shape() {
        let frame = Outbound::SessionAssigned {
            session_id: "s9".to_string(),
        }
        .to_frame();
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "session_assigned");
        assert_eq!(v["data"]["sessionId"], "s9");
    }

    #[test]
    fn test_session_events_frame_is_camel_case() {
        let frame = Outbound::SessionEvents {
            session_id: "s1".to_string(),
            events: vec![json!({"k": 1})],
            from_index: 0,
            total_events: 5,
            has_more: true,
        }
        .to_frame();
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["data"]["fromIndex"], 0);
        assert_eq!(v["data"]["totalEvents"], 5);
        assert_eq!(v["data"]["hasMore"], true);
    }

    #[test]
    fn test_relay_frame_tags_session() {
        let frame = relay_frame("visibility_change", "s1", &json!({"hidden": true}));
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "visibility_change");
        assert_eq!(v["data"]["sessionId"], "s1");
        assert_eq!(v["data"]["hidden"], true);
    }
}
