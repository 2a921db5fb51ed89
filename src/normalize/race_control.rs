//! Race-control message normalization.
//!
//! The `Messages` field arrives either as a list (snapshots) or as a map
//! keyed by numeric message id (deltas). Category, flag and scope come as
//! numbers or text depending on the path the message took through the feed.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

use crate::jsonstream;
use crate::types::{RaceControlMsg, RcCategory, RcFlag, RcScope};

/// Bounded id window used to drop re-delivered messages.
pub struct DedupWindow {
    capacity: usize,
    seen: HashSet<i64>,
    order: VecDeque<i64>,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(512)
    }
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, seen: HashSet::new(), order: VecDeque::new() }
    }

    /// Record an id; returns `false` when it was already in the window.
    pub fn insert(&mut self, id: i64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Field access that accepts both the long and the abbreviated key forms.
fn field<'a>(entry: &'a Value, long: &str, short: &str) -> Option<&'a Value> {
    entry.get(long).or_else(|| entry.get(short))
}

fn parse_category(value: Option<&Value>) -> RcCategory {
    match value {
        Some(v) => jsonstream::as_i64(v)
            .and_then(RcCategory::from_code)
            .or_else(|| v.as_str().and_then(RcCategory::from_text))
            .unwrap_or(RcCategory::Other),
        None => RcCategory::Other,
    }
}

fn parse_flag(value: Option<&Value>) -> Option<RcFlag> {
    let value = value?;
    jsonstream::as_i64(value)
        .and_then(RcFlag::from_code)
        .or_else(|| value.as_str().and_then(RcFlag::from_text))
}

fn parse_scope(value: Option<&Value>) -> Option<RcScope> {
    let value = value?;
    jsonstream::as_i64(value)
        .and_then(RcScope::from_code)
        .or_else(|| value.as_str().and_then(RcScope::from_text))
}

/// Message timestamps are ISO strings on the live feed but may be
/// millisecond offsets from session start in archived payloads.
fn parse_msg_utc(value: Option<&Value>, t0: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(text) => jsonstream::parse_utc(text),
        Value::Number(n) => {
            let millis = n.as_i64()?;
            Some(t0? + Duration::milliseconds(millis))
        }
        _ => None,
    }
}

fn normalize_one(
    entry: &Value,
    fallback_id: Option<i64>,
    t0: Option<DateTime<Utc>>,
) -> Option<RaceControlMsg> {
    if !entry.is_object() {
        return None;
    }
    let id = field(entry, "id", "id").and_then(jsonstream::as_i64).or(fallback_id);
    Some(RaceControlMsg {
        id,
        utc: parse_msg_utc(field(entry, "Utc", "utc"), t0),
        category: parse_category(field(entry, "Category", "m")),
        flag: parse_flag(field(entry, "Flag", "f")),
        scope: parse_scope(field(entry, "Scope", "s")),
        sector: field(entry, "Sector", "sc")
            .and_then(jsonstream::as_i64)
            .and_then(|s| u8::try_from(s).ok()),
        lap: field(entry, "Lap", "lap")
            .and_then(jsonstream::as_i64)
            .and_then(|l| u32::try_from(l).ok()),
        driver_number: field(entry, "RacingNumber", "drv")
            .and_then(jsonstream::as_text)
            .map(str::to_string),
        message: field(entry, "Message", "mes").and_then(jsonstream::as_text).map(str::to_string),
        status: entry.get("Status").and_then(jsonstream::as_text).map(str::to_string),
        mode: entry.get("Mode").and_then(jsonstream::as_text).map(str::to_string),
    })
}

/// Normalize a `RaceControlMessages` payload into an id-ordered, deduplicated
/// sequence of messages.
pub fn normalize_messages(
    payload: &Value,
    t0: Option<DateTime<Utc>>,
    dedup: &mut DedupWindow,
) -> Vec<RaceControlMsg> {
    let Some(raw) = payload.get("Messages") else { return Vec::new() };
    let mut messages: Vec<RaceControlMsg> = jsonstream::indexed_sequence(raw)
        .into_iter()
        .filter_map(|(key, entry)| normalize_one(entry, key, t0))
        .collect();
    messages.sort_by_key(|m| m.id.unwrap_or(i64::MAX));
    messages.retain(|m| match m.id {
        Some(id) => dedup.insert(id),
        None => true,
    });
    messages
}
