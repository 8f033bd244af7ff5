//! Structured update ("delta") documents exchanged with the telemetry bus.
//!
//! ```text
//! { "context": "vessels.<id>",
//!   "updates": [ { "timestamp": "...", "$source": "...",
//!                  "values": [ { "path": "a.b", "value": 1.0 } ] } ] }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A set of path/value changes for one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub context: String,
    pub updates: Vec<Update>,
}

/// One update record inside a delta.
///
/// `timestamp` and `$source` are optional on ingestion; the bus fills in
/// defaults for missing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "$source", default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub values: Vec<PathValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    pub path: String,
    pub value: serde_json::Value,
}

impl Delta {
    /// Builds a delta carrying a single update.
    pub fn single(context: impl Into<String>, update: Update) -> Self {
        Self {
            context: context.into(),
            updates: vec![update],
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json_slice(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

impl Update {
    pub fn single_value(
        timestamp: Option<DateTime<Utc>>,
        source: Option<String>,
        path: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            timestamp,
            source,
            values: vec![PathValue {
                path: path.into(),
                value,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_field_uses_dollar_prefix() {
        let delta = Delta::single(
            "vessels.self",
            Update::single_value(None, Some("mqtt.sensor".into()), "a.b", json!(1.5)),
        );

        let encoded: serde_json::Value =
            serde_json::from_slice(&delta.to_json_bytes().unwrap()).unwrap();

        assert_eq!(encoded["updates"][0]["$source"], "mqtt.sensor");
        assert!(encoded["updates"][0].get("timestamp").is_none());
        assert_eq!(encoded["updates"][0]["values"][0]["path"], "a.b");
    }

    #[test]
    fn parses_delta_without_optional_fields() {
        let raw = br#"{"context":"vessels.x","updates":[{"values":[{"path":"p","value":2}]}]}"#;
        let delta = Delta::from_json_slice(raw).unwrap();

        assert_eq!(delta.context, "vessels.x");
        assert_eq!(delta.updates[0].timestamp, None);
        assert_eq!(delta.updates[0].source, None);
        assert_eq!(delta.updates[0].values[0].value, json!(2));
    }
}
