// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Generated samples and their values

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ValueKind;

/// A single synthesized value. `Null` only appears when a value was dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl SampleValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SampleValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SampleValue::Number(n) => Some(*n),
            SampleValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            SampleValue::Null => false,
            SampleValue::Bool(b) => *b,
            SampleValue::Number(n) => *n != 0.0,
            SampleValue::Text(s) => !s.is_empty(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SampleValue::Null => "null",
            SampleValue::Bool(_) => "bool",
            SampleValue::Number(_) => "number",
            SampleValue::Text(_) => "string",
        }
    }

    /// Convert into the representation of `kind`. Nulls stay null.
    pub fn coerce(self, kind: ValueKind) -> SampleValue {
        match (kind, self) {
            (_, SampleValue::Null) => SampleValue::Null,
            (ValueKind::Number, SampleValue::Text(s)) => {
                s.trim().parse().map(SampleValue::Number).unwrap_or(SampleValue::Null)
            }
            (ValueKind::Number, v) => v.as_f64().map(SampleValue::Number).unwrap_or(SampleValue::Null),
            (ValueKind::Boolean, SampleValue::Text(s)) => {
                SampleValue::Bool(matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "on"))
            }
            (ValueKind::Boolean, v) => SampleValue::Bool(v.truthy()),
            (ValueKind::String, SampleValue::Text(s)) => SampleValue::Text(s),
            (ValueKind::String, v) => SampleValue::Text(v.to_string()),
        }
    }

    /// Build from a JSON value, typically a parameter's `default_value`
    pub fn from_json(value: &serde_json::Value) -> SampleValue {
        match value {
            serde_json::Value::Bool(b) => SampleValue::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map(SampleValue::Number).unwrap_or(SampleValue::Null),
            serde_json::Value::String(s) => SampleValue::Text(s.clone()),
            serde_json::Value::Null => SampleValue::Null,
            other => SampleValue::Text(other.to_string()),
        }
    }
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleValue::Null => write!(f, "null"),
            SampleValue::Bool(b) => write!(f, "{}", b),
            SampleValue::Number(n) => write!(f, "{}", n),
            SampleValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for SampleValue {
    fn from(v: f64) -> Self {
        SampleValue::Number(v)
    }
}

impl From<bool> for SampleValue {
    fn from(v: bool) -> Self {
        SampleValue::Bool(v)
    }
}

impl From<&str> for SampleValue {
    fn from(v: &str) -> Self {
        SampleValue::Text(v.to_string())
    }
}

/// One tick's output for one device. Serializes as `{device_id, timestamp, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSample {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    /// Keyed by parameter id
    pub data: BTreeMap<String, SampleValue>,
}

impl GeneratedSample {
    pub fn get(&self, parameter_id: &str) -> Option<&SampleValue> {
        self.data.get(parameter_id)
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_coercion() {
        assert_eq!(SampleValue::Number(2.0).coerce(ValueKind::Boolean), SampleValue::Bool(true));
        assert_eq!(SampleValue::Bool(true).coerce(ValueKind::Number), SampleValue::Number(1.0));
        assert_eq!(SampleValue::Number(1.5).coerce(ValueKind::String), SampleValue::Text("1.5".into()));
        assert_eq!(SampleValue::Null.coerce(ValueKind::Number), SampleValue::Null);
    }

    #[test]
    fn test_payload_shape() {
        let mut data = BTreeMap::new();
        data.insert("temp".to_string(), SampleValue::Number(21.5));
        data.insert("door".to_string(), SampleValue::Bool(false));
        data.insert("lost".to_string(), SampleValue::Null);
        let sample = GeneratedSample {
            device_id: "d1".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            data,
        };

        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["device_id"], "d1");
        assert_eq!(json["data"]["temp"], 21.5);
        assert_eq!(json["data"]["door"], false);
        assert!(json["data"]["lost"].is_null());
        assert!(json["timestamp"].as_str().unwrap().starts_with("2024-01-01T00:00:00"));
    }
}
