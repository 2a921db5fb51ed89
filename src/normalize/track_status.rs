//! TrackStatus normalization: numeric codes and free-text aliases to a
//! canonical track state.

use serde_json::Value;
use tracing::debug;

use crate::jsonstream;

/// Canonical track status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Clear,
    Yellow,
    Vsc,
    Sc,
    Red,
}

/// Ordered alias table: text forms override numeric codes, and the longer
/// VSC aliases must be checked before the plain SC substrings they contain.
const ALIASES: &[(&str, TrackState)] = &[
    ("VSC", TrackState::Vsc),
    ("VIRTUAL SAFETY CAR", TrackState::Vsc),
    ("SAFETY CAR", TrackState::Sc),
    ("SAFETYCAR", TrackState::Sc),
    ("SC DEPLOYED", TrackState::Sc),
    ("SC ENDING", TrackState::Sc),
    ("DOUBLE YELLOW", TrackState::Yellow),
    ("DOUBLEYELLOW", TrackState::Yellow),
    ("YELLOW", TrackState::Yellow),
    ("RED", TrackState::Red),
    ("ALLCLEAR", TrackState::Clear),
    ("ALL CLEAR", TrackState::Clear),
    ("CLEAR", TrackState::Clear),
];

fn from_code(code: i64) -> Option<TrackState> {
    match code {
        1 => Some(TrackState::Clear),
        2 => Some(TrackState::Yellow),
        4 => Some(TrackState::Sc),
        5 => Some(TrackState::Red),
        6 => Some(TrackState::Vsc),
        // VSC ending phase.
        7 => Some(TrackState::Vsc),
        // 8 observed as all-clear on the wire.
        8 => Some(TrackState::Clear),
        // 3 is undocumented; skipped until the feed pins its meaning down.
        _ => None,
    }
}

/// Map a `TrackStatus` payload to the canonical state, or `None` when
/// neither the message text nor the numeric code resolves.
pub fn normalize_track_status(payload: &Value) -> Option<TrackState> {
    let message = payload
        .get("Message")
        .or_else(|| payload.get("TrackStatus"))
        .and_then(jsonstream::as_text)
        .map(str::to_ascii_uppercase)
        .unwrap_or_default();

    if !message.is_empty() {
        for (alias, state) in ALIASES {
            if message.contains(alias) {
                return Some(*state);
            }
        }
    }

    if let Some(code) = payload.get("Status").and_then(jsonstream::as_i64) {
        let mapped = from_code(code);
        if mapped.is_none() {
            debug!(code, "unmapped track status code");
        }
        return mapped;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_codes_map_to_canonical_states() {
        assert_eq!(normalize_track_status(&json!({"Status": "1"})), Some(TrackState::Clear));
        assert_eq!(normalize_track_status(&json!({"Status": 2})), Some(TrackState::Yellow));
        assert_eq!(normalize_track_status(&json!({"Status": "4"})), Some(TrackState::Sc));
        assert_eq!(normalize_track_status(&json!({"Status": "5"})), Some(TrackState::Red));
        assert_eq!(normalize_track_status(&json!({"Status": "6"})), Some(TrackState::Vsc));
        assert_eq!(normalize_track_status(&json!({"Status": "7"})), Some(TrackState::Vsc));
    }

    #[test]
    fn undocumented_code_three_stays_unmapped() {
        assert_eq!(normalize_track_status(&json!({"Status": "3"})), None);
    }

    #[test]
    fn text_alias_overrides_numeric_code() {
        // Numeric says yellow, text says VSC: text wins.
        let payload = json!({"Status": "2", "Message": "VSCDeployed"});
        assert_eq!(normalize_track_status(&payload), Some(TrackState::Vsc));
    }

    #[test]
    fn vsc_aliases_beat_their_sc_substring() {
        assert_eq!(
            normalize_track_status(&json!({"Message": "VSC ENDING"})),
            Some(TrackState::Vsc)
        );
        assert_eq!(
            normalize_track_status(&json!({"Message": "SAFETY CAR DEPLOYED"})),
            Some(TrackState::Sc)
        );
    }

    #[test]
    fn unknown_payloads_resolve_to_none() {
        assert_eq!(normalize_track_status(&json!({})), None);
        assert_eq!(normalize_track_status(&json!({"Message": "???"})), None);
    }
}
