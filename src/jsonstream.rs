//! Parsing helpers for `.jsonStream` archive files and the feed's
//! list-or-map payload shapes.
//!
//! Archive files carry one event per line, `HH:MM:SS.mmm{json}`, where the
//! timestamp is an offset from the start of the file set. Malformed lines
//! are skipped; the per-line parse is isolated so one bad line never stops
//! a stream.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Parse one archive line into `(offset_ms, payload)`.
///
/// Compressed streams carry a JSON *string* payload (base64 deflate) instead
/// of an object; both start characters are accepted.
pub fn parse_line(line: &str) -> Option<(u64, Value)> {
    let line = line.trim().trim_start_matches('\u{feff}');
    if line.is_empty() {
        return None;
    }
    let json_start = line.find(['{', '"'])?;
    let ts = timestamp_to_ms(line[..json_start].trim())?;
    let payload: Value = serde_json::from_str(&line[json_start..]).ok()?;
    Some((ts, payload))
}

/// Convert an `HH:MM:SS.mmm` offset to milliseconds.
pub fn timestamp_to_ms(ts: &str) -> Option<u64> {
    let mut parts = ts.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let secs_part = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let (seconds, millis) = match secs_part.split_once('.') {
        Some((s, m)) => {
            // Fractional part may be shorter than three digits.
            let frac: u64 = m.parse().ok()?;
            let scale = match m.len() {
                1 => 100,
                2 => 10,
                3 => 1,
                _ => return None,
            };
            (s.parse::<u64>().ok()?, frac * scale)
        }
        None => (secs_part.parse().ok()?, 0),
    };
    Some((hours * 3600 + minutes * 60 + seconds) * 1000 + millis)
}

/// Normalize a list-or-map collection into an ordered sequence.
///
/// The feed sends initial snapshots as JSON arrays and deltas as objects
/// keyed by stringified index. Map entries are ordered by numeric key
/// ascending; the key is surfaced so callers can recover implicit ids.
pub fn indexed_sequence(value: &Value) -> Vec<(Option<i64>, &Value)> {
    match value {
        Value::Array(items) => items.iter().map(|item| (None, item)).collect(),
        Value::Object(map) => {
            let mut entries: Vec<(i64, &Value)> = map
                .iter()
                .filter_map(|(k, v)| k.parse::<i64>().ok().map(|n| (n, v)))
                .collect();
            entries.sort_by_key(|(n, _)| *n);
            entries.into_iter().map(|(n, v)| (Some(n), v)).collect()
        }
        _ => Vec::new(),
    }
}

/// Coerce a JSON value that may be a number or numeric string.
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a feed timestamp: ISO-8601 with or without a trailing `Z` or
/// offset. Naive values are taken as UTC.
pub fn parse_utc(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Non-empty trimmed string content, if any.
pub fn as_text(value: &Value) -> Option<&str> {
    let text = value.as_str()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_archive_lines() {
        let (ts, payload) =
            parse_line("00:01:02.345{\"Status\":\"1\",\"Message\":\"AllClear\"}").unwrap();
        assert_eq!(ts, 62_345);
        assert_eq!(payload["Status"], "1");
    }

    #[test]
    fn parses_compressed_string_payload() {
        let (ts, payload) = parse_line("01:00:00.000\"eJxLyk9RAAA=\"").unwrap();
        assert_eq!(ts, 3_600_000);
        assert!(payload.is_string());
    }

    #[test]
    fn skips_garbage_lines() {
        assert!(parse_line("").is_none());
        assert!(parse_line("no json here").is_none());
        assert!(parse_line("00:00:01.000{broken").is_none());
        assert!(parse_line("nonsense{\"a\":1}").is_none());
    }

    #[test]
    fn short_fraction_is_scaled() {
        assert_eq!(timestamp_to_ms("00:00:01.5"), Some(1_500));
        assert_eq!(timestamp_to_ms("00:00:01.05"), Some(1_050));
        assert_eq!(timestamp_to_ms("00:00:01"), Some(1_000));
        assert_eq!(timestamp_to_ms("10:20:30.123"), Some(37_230_123));
    }

    #[test]
    fn indexed_sequence_orders_map_keys_numerically() {
        let value = json!({"10": {"a": 1}, "2": {"b": 2}, "skip": {}});
        let seq = indexed_sequence(&value);
        assert_eq!(seq.len(), 2);
        assert_eq!(seq[0].0, Some(2));
        assert_eq!(seq[1].0, Some(10));
    }

    #[test]
    fn parse_utc_accepts_feed_variants() {
        let expected = "2025-12-06T14:00:01Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap();
        assert_eq!(parse_utc("2025-12-06T14:00:01Z"), Some(expected));
        assert_eq!(parse_utc("2025-12-06T14:00:01+00:00"), Some(expected));
        assert_eq!(parse_utc("2025-12-06T14:00:01"), Some(expected));
        assert!(parse_utc("2025-12-06T14:00:01.002Z").is_some());
        assert!(parse_utc("not a date").is_none());
    }

    #[test]
    fn indexed_sequence_passes_lists_through() {
        let value = json!([{"a": 1}, {"b": 2}]);
        let seq = indexed_sequence(&value);
        assert_eq!(seq.len(), 2);
        assert_eq!(seq[0].0, None);
    }
}
