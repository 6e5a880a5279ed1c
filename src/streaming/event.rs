use crate::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventType {
    Start,
    Progress,
    Heartbeat,
    Chunk,
    Complete,
    Error,
}

impl StreamEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventType::Start => "start",
            StreamEventType::Progress => "progress",
            StreamEventType::Heartbeat => "heartbeat",
            StreamEventType::Chunk => "chunk",
            StreamEventType::Complete => "complete",
            StreamEventType::Error => "error",
        }
    }

    /// Complete and Error end a session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEventType::Complete | StreamEventType::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&Error> for StreamError {
    fn from(err: &Error) -> Self {
        let details = err.context().and_then(|c| {
            let mut map = serde_json::Map::new();
            if let Some(f) = &c.field_path {
                map.insert("field".into(), Value::String(f.clone()));
            }
            if let Some(d) = &c.details {
                map.insert("details".into(), Value::String(d.clone()));
            }
            if let Some(s) = &c.source {
                map.insert("source".into(), Value::String(s.clone()));
            }
            (!map.is_empty()).then_some(Value::Object(map))
        });
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details,
        }
    }
}

/// One event on the wire.
///
/// ```json
/// {"id":"…","type":"chunk","data":{…},"timestamp":1700000000000,"sequence":4,"isComplete":false}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    /// Session id.
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub sequence: u64,
    pub is_complete: bool,
}

impl StreamEvent {
    pub(crate) fn new(session_id: &str, event_type: StreamEventType, sequence: u64) -> Self {
        Self {
            id: session_id.to_string(),
            event_type,
            data: None,
            error: None,
            metadata: None,
            timestamp: now_ms(),
            sequence,
            is_complete: event_type.is_terminal(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorContext;
    use serde_json::json;

    #[test]
    fn test_wire_schema() {
        let mut ev = StreamEvent::new("s-1", StreamEventType::Chunk, 3);
        ev.data = Some(json!({"index": 0, "content": "SELECT"}));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["id"], "s-1");
        assert_eq!(v["type"], "chunk");
        assert_eq!(v["sequence"], 3);
        assert_eq!(v["isComplete"], false);
        assert!(v.get("error").is_none());
        assert!(v["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_terminal_events_are_complete() {
        assert!(StreamEvent::new("s", StreamEventType::Complete, 1).is_complete);
        assert!(StreamEvent::new("s", StreamEventType::Error, 1).is_complete);
        assert!(!StreamEvent::new("s", StreamEventType::Heartbeat, 1).is_complete);
    }

    #[test]
    fn test_error_payload_from_error() {
        let err = Error::validation_with_context(
            "DROP statements are not allowed",
            ErrorContext::new().with_source("sql_validator"),
        );
        let se = StreamError::from(&err);
        assert_eq!(se.code, "VALIDATION_ERROR");
        assert_eq!(se.details.unwrap()["source"], "sql_validator");

        let timeout = StreamError::from(&Error::deadline_exceeded("stream"));
        assert_eq!(timeout.code, "TIMEOUT");
    }

    #[test]
    fn test_round_trips_from_wire() {
        let raw = r#"{"id":"x","type":"heartbeat","timestamp":1,"sequence":2,"isComplete":false}"#;
        let ev: StreamEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.event_type, StreamEventType::Heartbeat);
        assert_eq!(ev.sequence, 2);
    }
}
