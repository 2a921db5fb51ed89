//! DriverList identity merging.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::jsonstream;

/// Merged driver identity, keyed by racing number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverInfo {
    pub racing_number: String,
    pub tla: Option<String>,
    pub full_name: Option<String>,
    pub broadcast_name: Option<String>,
    pub team_name: Option<String>,
    /// Lower-case hex with leading `#`.
    pub team_colour: Option<String>,
    pub line: Option<i64>,
    pub headshot_url: Option<String>,
}

/// Canonical colour form: lower-case, `#`-prefixed.
fn canonical_colour(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    if lowered.starts_with('#') {
        lowered
    } else {
        format!("#{lowered}")
    }
}

/// Merge a DriverList payload (snapshot or delta) into the identity map.
pub fn apply_driver_list(drivers: &mut BTreeMap<String, DriverInfo>, payload: &Value) {
    let Some(entries) = payload.as_object() else { return };
    for (racing_number, delta) in entries {
        // The feed mixes bookkeeping keys ("_kf") into the map.
        if !delta.is_object() {
            continue;
        }
        let driver = drivers.entry(racing_number.clone()).or_insert_with(|| DriverInfo {
            racing_number: racing_number.clone(),
            ..DriverInfo::default()
        });
        if let Some(tla) = delta.get("Tla").and_then(jsonstream::as_text) {
            driver.tla = Some(tla.to_string());
        }
        if let Some(name) = delta.get("FullName").and_then(jsonstream::as_text) {
            driver.full_name = Some(name.to_string());
        }
        if let Some(name) = delta.get("BroadcastName").and_then(jsonstream::as_text) {
            driver.broadcast_name = Some(name.to_string());
        }
        if let Some(team) = delta.get("TeamName").and_then(jsonstream::as_text) {
            driver.team_name = Some(team.to_string());
        }
        if let Some(colour) = delta.get("TeamColour").and_then(jsonstream::as_text) {
            driver.team_colour = Some(canonical_colour(colour));
        }
        if let Some(line) = delta.get("Line").and_then(jsonstream::as_i64) {
            driver.line = Some(line);
        }
        if let Some(url) = delta.get("HeadshotUrl").and_then(jsonstream::as_text) {
            driver.headshot_url = Some(url.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merges_identity_by_racing_number() {
        let mut drivers = BTreeMap::new();
        apply_driver_list(
            &mut drivers,
            &json!({
                "1": {"Tla": "VER", "FullName": "Max VERSTAPPEN", "TeamName": "Red Bull Racing",
                      "TeamColour": "3671C6", "Line": 1},
                "_kf": true,
            }),
        );
        apply_driver_list(&mut drivers, &json!({"1": {"Line": 2}}));

        assert_eq!(drivers.len(), 1);
        let max = drivers.get("1").unwrap();
        assert_eq!(max.tla.as_deref(), Some("VER"));
        assert_eq!(max.line, Some(2));
        assert_eq!(max.team_name.as_deref(), Some("Red Bull Racing"));
    }

    #[test]
    fn colour_is_canonicalized() {
        let mut drivers = BTreeMap::new();
        apply_driver_list(&mut drivers, &json!({"16": {"TeamColour": "E8002D"}}));
        apply_driver_list(&mut drivers, &json!({"44": {"TeamColour": "#27f4d2"}}));
        assert_eq!(drivers.get("16").unwrap().team_colour.as_deref(), Some("#e8002d"));
        assert_eq!(drivers.get("44").unwrap().team_colour.as_deref(), Some("#27f4d2"));
    }
}
