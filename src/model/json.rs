//! JSON shape helpers shared by the wire format and JSON columns
//!
//! Containers (tags, context files, code blocks, metadata) travel as real
//! JSON on the wire but are stored as encoded strings. Older clients and
//! backup files sometimes send those containers already string-encoded, so
//! every container field accepts both shapes on the way in.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Column encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Encode a typed container for a text column
pub fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Internal(format!("encode column: {}", e)))
}

/// Encode an opaque blob. A JSON string is taken as already encoded and
/// stored verbatim.
pub fn encode_blob(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Decode an opaque blob; text that is not JSON comes back as a JSON string
pub fn decode_blob(text: Option<&str>) -> Option<Value> {
    let text = text?;
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(_) => Some(Value::String(text.to_string())),
    }
}

/// Decode a container column, surfacing undecodable text as the empty container
pub fn decode_or_default<T: DeserializeOwned + Default>(text: Option<&str>) -> T {
    match text {
        None => T::default(),
        Some(t) if t.trim().is_empty() => T::default(),
        Some(t) => serde_json::from_str(t).unwrap_or_else(|e| {
            tracing::trace!(error = %e, "undecodable JSON column, using empty container");
            T::default()
        }),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timestamps
// ─────────────────────────────────────────────────────────────────────────────

/// Canonical text form: RFC 3339, millisecond precision, `Z` suffix.
/// Lexicographic order of this form matches chronological order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse RFC 3339, SQL `YYYY-MM-DD HH:MM:SS`, or epoch milliseconds
pub fn parse_ts(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    text.parse::<i64>().ok().and_then(from_epoch_millis)
}

pub fn from_epoch_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Current time at the precision the store keeps
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    from_epoch_millis(now.timestamp_millis()).unwrap_or(now)
}

fn ts_from_value<E: serde::de::Error>(value: Value) -> std::result::Result<Option<DateTime<Utc>>, E> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => parse_ts(&s)
            .map(Some)
            .ok_or_else(|| E::custom(format!("unrecognised timestamp '{}'", s))),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch_millis)
            .map(Some)
            .ok_or_else(|| E::custom("timestamp out of range")),
        other => Err(E::custom(format!("expected timestamp, got {}", other))),
    }
}

/// `#[serde(with = "json::timestamp")]` for required timestamps
pub mod timestamp {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&format_ts(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<DateTime<Utc>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(ts_from_value::<D::Error>(value)?.unwrap_or_else(now))
    }
}

/// `#[serde(with = "json::timestamp_opt")]` for optional timestamps
pub mod timestamp_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        ts: &Option<DateTime<Utc>>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => s.serialize_str(&format_ts(ts)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
        let value = Option::<Value>::deserialize(d)?.unwrap_or(Value::Null);
        ts_from_value::<D::Error>(value)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lenient field deserializers
// ─────────────────────────────────────────────────────────────────────────────

/// Accept a container or a string holding its JSON encoding
pub fn container<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(T::default()),
        Some(Value::String(s)) => Ok(decode_or_default(Some(&s))),
        Some(v) => serde_json::from_value(v).map_err(D::Error::custom),
    }
}

/// Accept an integer or a numeric string (ids from older exports are strings)
pub fn int_opt<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<i64>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("expected integer, got '{}'", s))),
        Some(other) => Err(D::Error::custom(format!("expected integer, got {}", other))),
    }
}

/// Accept a boolean, 0/1, or "true"/"false"
pub fn flag<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Deserialize)]
    struct Holder {
        #[serde(default, deserialize_with = "container")]
        tags: Vec<String>,
        #[serde(default, deserialize_with = "int_opt")]
        prompt_id: Option<i64>,
    }

    #[test]
    fn test_container_accepts_string_encoding() {
        let h: Holder = serde_json::from_str(r#"{"tags": "[\"a\",\"b\"]"}"#).unwrap();
        assert_eq!(h.tags, vec!["a", "b"]);
        let h: Holder = serde_json::from_str(r#"{"tags": ["c"]}"#).unwrap();
        assert_eq!(h.tags, vec!["c"]);
        let h: Holder = serde_json::from_str(r#"{"tags": "not json"}"#).unwrap();
        assert!(h.tags.is_empty());
    }

    #[test]
    fn test_int_opt_accepts_numeric_string() {
        let h: Holder = serde_json::from_str(r#"{"prompt_id": "42"}"#).unwrap();
        assert_eq!(h.prompt_id, Some(42));
        let h: Holder = serde_json::from_str(r#"{"prompt_id": null}"#).unwrap();
        assert_eq!(h.prompt_id, None);
    }

    #[test]
    fn test_blob_string_is_stored_verbatim() {
        let value = Value::String(r#"{"model":"x"}"#.into());
        let stored = encode_blob(&value).unwrap();
        assert_eq!(stored, r#"{"model":"x"}"#);
        assert_eq!(decode_blob(Some(&stored)), Some(serde_json::json!({"model": "x"})));
        assert_eq!(decode_blob(Some("plain")), Some(Value::String("plain".into())));
    }

    #[test]
    fn test_decode_failure_yields_empty_container() {
        let v: Vec<String> = decode_or_default(Some("{broken"));
        assert!(v.is_empty());
        let m: serde_json::Map<String, Value> = decode_or_default(Some("[1,2]"));
        assert!(m.is_empty());
    }

    #[test]
    fn test_parse_ts_formats() {
        let a = parse_ts("2024-03-01T10:00:00.000Z").unwrap();
        let b = parse_ts("2024-03-01 10:00:00").unwrap();
        let c = parse_ts("1709287200000").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(format_ts(&a), "2024-03-01T10:00:00.000Z");
    }

    proptest! {
        #[test]
        fn prop_tag_column_roundtrip(tags in proptest::collection::vec(".{0,12}", 0..8)) {
            let stored = encode(&tags).unwrap();
            let back: Vec<String> = decode_or_default(Some(&stored));
            prop_assert_eq!(back, tags);
        }
    }
}
