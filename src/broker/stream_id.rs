// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stream entry ids and field extraction.
//!
//! Redis stream ids are `{timestamp_ms}-{sequence}`. The reclaim sweep pages
//! through the pending list with an exclusive cursor built by
//! [`next_stream_id`], and ages entries with [`entry_age_ms`].

use crate::error::{RelayError, Result};
use std::collections::HashMap;

/// Split a stream id into `(timestamp_ms, sequence)`.
///
/// A bare number is treated as `{n}-0`. Returns `None` for anything else.
pub fn parse_stream_id(stream_id: &str) -> Option<(u64, u64)> {
    match stream_id.split_once('-') {
        Some((ts, seq)) => Some((ts.parse().ok()?, seq.parse().ok()?)),
        None => Some((stream_id.parse().ok()?, 0)),
    }
}

/// Compare two Redis stream IDs.
///
/// Malformed ids sort as `0-0`.
pub fn compare_stream_ids(a: &str, b: &str) -> std::cmp::Ordering {
    let a = parse_stream_id(a).unwrap_or((0, 0));
    let b = parse_stream_id(b).unwrap_or((0, 0));
    a.cmp(&b)
}

/// Parse the timestamp (milliseconds since epoch) from a stream ID.
///
/// Returns `None` for malformed IDs or special cases like "0".
pub fn parse_stream_id_timestamp(stream_id: &str) -> Option<u64> {
    let (ts, seq) = stream_id.split_once('-')?;
    seq.parse::<u64>().ok()?;
    ts.parse().ok()
}

/// The smallest id strictly greater than `stream_id`.
///
/// Used as the start of the next XPENDING page. Sequence overflow rolls
/// into the next millisecond.
pub fn next_stream_id(stream_id: &str) -> Option<String> {
    let (ts, seq) = parse_stream_id(stream_id)?;
    match seq.checked_add(1) {
        Some(seq) => Some(format!("{}-{}", ts, seq)),
        None => ts.checked_add(1).map(|ts| format!("{}-0", ts)),
    }
}

/// Age of an entry relative to `now_ms`, from the timestamp in its id.
///
/// Ids from the future report zero.
pub fn entry_age_ms(stream_id: &str, now_ms: u64) -> Option<u64> {
    parse_stream_id_timestamp(stream_id).map(|ts| now_ms.saturating_sub(ts))
}

/// Current wall clock in epoch millis.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Extract a bytes field from a stream entry.
pub fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| RelayError::Serialization(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(RelayError::Serialization(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Extract a string field from a stream entry.
pub fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    let bytes = get_bytes_field(fields, name)?;
    String::from_utf8(bytes)
        .map_err(|e| RelayError::Serialization(format!("Invalid UTF-8 in {}: {}", name, e)))
}

/// Flatten entry fields into `(name, bytes)` pairs, sorted by name.
///
/// Non-scalar values are skipped.
pub fn fields_to_pairs(fields: &HashMap<String, redis::Value>) -> Vec<(String, Vec<u8>)> {
    let mut pairs: Vec<(String, Vec<u8>)> = fields
        .iter()
        .filter_map(|(name, value)| match value {
            redis::Value::BulkString(bytes) => Some((name.clone(), bytes.clone())),
            redis::Value::SimpleString(s) => Some((name.clone(), s.as_bytes().to_vec())),
            redis::Value::Int(i) => Some((name.clone(), i.to_string().into_bytes())),
            _ => None,
        })
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_compare_stream_ids() {
        assert_eq!(compare_stream_ids("1-0", "2-0"), Ordering::Less);
        assert_eq!(compare_stream_ids("2-0", "1-0"), Ordering::Greater);
        assert_eq!(compare_stream_ids("1-5", "1-10"), Ordering::Less);
        assert_eq!(compare_stream_ids("1234-0", "1234-0"), Ordering::Equal);
        assert_eq!(compare_stream_ids("0", "0-0"), Ordering::Equal);
        assert_eq!(compare_stream_ids("garbage", "1-0"), Ordering::Less);
    }

    #[test]
    fn test_parse_stream_id_timestamp() {
        assert_eq!(parse_stream_id_timestamp("1700000000000-3"), Some(1_700_000_000_000));
        assert_eq!(parse_stream_id_timestamp("0"), None);
        assert_eq!(parse_stream_id_timestamp("abc-1"), None);
        assert_eq!(parse_stream_id_timestamp("1-abc"), None);
    }

    #[test]
    fn test_next_stream_id() {
        assert_eq!(next_stream_id("5-0").as_deref(), Some("5-1"));
        assert_eq!(next_stream_id("5").as_deref(), Some("5-1"));
        assert_eq!(
            next_stream_id(&format!("5-{}", u64::MAX)).as_deref(),
            Some("6-0")
        );
        assert_eq!(next_stream_id(&format!("{}-{}", u64::MAX, u64::MAX)), None);
        assert_eq!(next_stream_id("-"), None);
    }

    #[test]
    fn test_entry_age() {
        assert_eq!(entry_age_ms("1000-0", 4000), Some(3000));
        assert_eq!(entry_age_ms("5000-0", 4000), Some(0));
        assert_eq!(entry_age_ms("nope", 4000), None);
    }

    #[test]
    fn test_field_extraction() {
        let mut fields = HashMap::new();
        fields.insert("payload".to_string(), redis::Value::BulkString(b"{}".to_vec()));
        fields.insert("reason".to_string(), redis::Value::SimpleString("expired".into()));
        fields.insert("bad".to_string(), redis::Value::Nil);

        assert_eq!(get_bytes_field(&fields, "payload").unwrap(), b"{}");
        assert_eq!(get_string_field(&fields, "reason").unwrap(), "expired");
        assert!(get_bytes_field(&fields, "missing").is_err());
        assert!(get_bytes_field(&fields, "bad").is_err());

        let pairs = fields_to_pairs(&fields);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "payload");
    }
}
