//! Measurement snapshot types
//!
//! A [`Readings`] value is one complete set of measurements fetched from a
//! bridge in a single request. It is never updated in place; a newer fetch
//! produces a new snapshot that replaces the old one wholesale.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Key carrying the measurement time in a JSON snapshot
pub const TIME_KEY: &str = "time";

/// A single measured value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    Bool(bool),
    Number(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl MeasurementValue {
    /// Convert a JSON value, returning `None` for `null` and nested values
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number),
            serde_json::Value::String(s) => Some(
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| Self::Timestamp(dt.with_timezone(&Utc)))
                    .unwrap_or_else(|_| Self::Text(s.clone())),
            ),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Loose truthiness used by binary sensors
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::Timestamp(_) => true,
            Self::Text(s) => !matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "" | "0" | "false" | "off" | "no"
            ),
        }
    }

    /// Render as a state string
    pub fn render(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::Timestamp(ts) => ts.to_rfc3339(),
            Self::Text(s) => s.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl From<f64> for MeasurementValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for MeasurementValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for MeasurementValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<DateTime<Utc>> for MeasurementValue {
    fn from(ts: DateTime<Utc>) -> Self {
        Self::Timestamp(ts)
    }
}

/// An immutable snapshot of named measurements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Readings {
    values: HashMap<String, MeasurementValue>,
    timestamp: DateTime<Utc>,
}

impl Readings {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            values: HashMap::new(),
            timestamp,
        }
    }

    /// Add a value while building a snapshot
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MeasurementValue>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Build a snapshot from a flat JSON object
    ///
    /// `null` fields are dropped so that "present" always means "present and
    /// non-null". The `time` field, when it holds an RFC 3339 string or a unix
    /// timestamp, becomes the measurement time; otherwise the current time is
    /// used. Returns `None` if `value` is not an object.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;

        let timestamp = object
            .get(TIME_KEY)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        let values = object
            .iter()
            .filter(|(key, _)| key.as_str() != TIME_KEY)
            .filter_map(|(key, v)| MeasurementValue::from_json(v).map(|mv| (key.clone(), mv)))
            .collect();

        Some(Self { values, timestamp })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn get(&self, key: &str) -> Option<&MeasurementValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_drops_nulls_and_extracts_time() {
        let readings = Readings::from_json(&json!({
            "time": "2024-02-01T10:00:00Z",
            "air_temperature": 21.5,
            "relative_humidity": 60,
            "is_raining": false,
            "wind_direction": "NNW",
            "visibility": null,
        }))
        .unwrap();

        assert_eq!(readings.len(), 4);
        assert!(!readings.contains("visibility"));
        assert!(!readings.contains("time"));
        assert_eq!(
            readings.timestamp(),
            Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(
            readings.get("air_temperature"),
            Some(&MeasurementValue::Number(21.5))
        );
        assert_eq!(
            readings.get("wind_direction"),
            Some(&MeasurementValue::Text("NNW".to_string()))
        );
    }

    #[test]
    fn test_from_json_unix_time() {
        let readings = Readings::from_json(&json!({ "time": 1_700_000_000 })).unwrap();
        assert_eq!(readings.timestamp().timestamp(), 1_700_000_000);
        assert!(readings.is_empty());
    }

    #[test]
    fn test_from_json_rejects_non_objects() {
        assert!(Readings::from_json(&json!([1, 2, 3])).is_none());
        assert!(Readings::from_json(&json!("text")).is_none());
    }

    #[test]
    fn test_timestamp_strings_become_timestamps() {
        let value = MeasurementValue::from_json(&json!("2024-01-31T23:59:00+01:00")).unwrap();
        assert!(matches!(value, MeasurementValue::Timestamp(_)));
    }

    #[test]
    fn test_truthiness() {
        assert!(MeasurementValue::Bool(true).is_truthy());
        assert!(!MeasurementValue::Bool(false).is_truthy());
        assert!(MeasurementValue::Number(1.0).is_truthy());
        assert!(!MeasurementValue::Number(0.0).is_truthy());
        assert!(!MeasurementValue::Text("off".into()).is_truthy());
        assert!(!MeasurementValue::Text("0".into()).is_truthy());
        assert!(MeasurementValue::Text("yes".into()).is_truthy());
    }

    #[test]
    fn test_render() {
        assert_eq!(MeasurementValue::Number(21.5).render(), "21.5");
        assert_eq!(MeasurementValue::Number(60.0).render(), "60");
        assert_eq!(MeasurementValue::Bool(false).render(), "false");
    }
}
