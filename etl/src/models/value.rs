use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One cell of a source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Text(String),
    Number(f64),
    #[serde(with = "utc_offset")]
    Timestamp(DateTime<Utc>),
}

/// Timestamps serialize with an explicit `+00:00` offset.
mod utc_offset {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}

/// Column name to value. Ordered so that every derived artifact (error
/// messages, parquet columns, SQL column lists) is deterministic.
pub type SourceRow = BTreeMap<String, Value>;

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null, or text that is empty once trimmed.
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// String form used for keys and categorical comparison.
    pub fn to_key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(format_number(*n)),
            Value::Timestamp(ts) => Some(ts.to_rfc3339()),
        }
    }

    /// Converts a JSON cell as produced by the relational source. Strings
    /// holding a full date-time become UTC timestamps.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Text(b.to_string()),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => Value::Number(f),
                None => Value::Text(n.to_string()),
            },
            serde_json::Value::String(s) => {
                if s.len() > 10 {
                    if let Some(ts) = parse_timestamp(&s) {
                        return Value::Timestamp(ts);
                    }
                }
                Value::Text(s)
            }
            other => Value::Text(other.to_string()),
        }
    }
}

/// Integral values print without a fractional part so numeric identifiers
/// survive a round trip through text.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Accepts RFC 3339, Postgres-style offsets (`+00`), naive date-times
/// (taken as UTC) and bare dates (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_timestamp("2024-01-02T03:04:05Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02T05:04:05+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02 03:04:05+00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02 03:04:05"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02T03:04:05"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-01-02"),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("02/01/2024"), None);
        assert_eq!(parse_timestamp("  "), None);
    }

    #[test]
    fn test_from_json_normalizes_datetimes_only() {
        let ts = Value::from_json(serde_json::json!("2024-01-02T00:00:00+05:30"));
        assert_eq!(
            ts,
            Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 18, 30, 0).unwrap())
        );

        // bare dates and identifiers stay text
        assert_eq!(
            Value::from_json(serde_json::json!("2024-01-02")),
            Value::text("2024-01-02")
        );
        assert_eq!(Value::from_json(serde_json::json!("L-100")), Value::text("L-100"));
        assert_eq!(Value::from_json(serde_json::json!(12.5)), Value::Number(12.5));
        assert_eq!(Value::from_json(serde_json::Value::Null), Value::Null);
    }

    #[test]
    fn test_timestamps_serialize_with_offset() {
        let value = Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "timestamp", "value": "2024-01-03T00:00:00+00:00"})
        );
        assert_eq!(serde_json::from_value::<Value>(json).unwrap(), value);
    }

    #[test]
    fn test_key_form() {
        assert_eq!(Value::Number(42.0).to_key().as_deref(), Some("42"));
        assert_eq!(Value::Number(0.5).to_key().as_deref(), Some("0.5"));
        assert_eq!(Value::text("  L1 ").to_key().as_deref(), Some("L1"));
        assert!(Value::Null.to_key().is_none());
        assert!(Value::text("   ").is_blank());
    }
}
