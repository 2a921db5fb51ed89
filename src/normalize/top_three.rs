//! TopThree accumulation: list snapshots plus digit-keyed deltas.

use serde_json::{json, Value};

use crate::jsonstream;

/// Accumulated podium state. The initial snapshot arrives as a three-element
/// list; subsequent deltas arrive as maps keyed by stringified slot index
/// and merge shallowly into the stored lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopThreeState {
    pub withheld: bool,
    pub lines: [Option<Value>; 3],
}

impl TopThreeState {
    /// Merge one TopThree payload, either form.
    pub fn merge(&mut self, payload: &Value) {
        if let Some(withheld) = payload.get("Withheld").and_then(Value::as_bool) {
            self.withheld = withheld;
        }
        match payload.get("Lines") {
            Some(Value::Array(items)) => {
                let mut lines: [Option<Value>; 3] = Default::default();
                for (idx, item) in items.iter().take(3).enumerate() {
                    if item.is_object() {
                        lines[idx] = Some(item.clone());
                    }
                }
                self.lines = lines;
            }
            Some(Value::Object(_)) => {
                let deltas = jsonstream::indexed_sequence(payload.get("Lines").unwrap_or(&Value::Null));
                for (key, delta) in deltas {
                    let Some(idx) = key.filter(|k| (0..3).contains(k)) else { continue };
                    let Some(delta) = delta.as_object() else { continue };
                    let slot = &mut self.lines[idx as usize];
                    let base = slot.get_or_insert_with(|| json!({}));
                    if let Some(base) = base.as_object_mut() {
                        for (field, value) in delta {
                            base.insert(field.clone(), value.clone());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// All three podium slots populated.
    pub fn is_complete(&self) -> bool {
        self.lines.iter().all(Option::is_some)
    }

    pub fn has_any(&self) -> bool {
        self.lines.iter().any(Option::is_some)
    }

    /// Rebuild a feed-shaped payload from the accumulated state.
    pub fn to_payload(&self) -> Value {
        json!({
            "Withheld": self.withheld,
            "Lines": self.lines.iter().map(|line| line.clone().unwrap_or(Value::Null)).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_then_delta_merges_shallowly() {
        let mut state = TopThreeState::default();
        state.merge(&json!({
            "Withheld": false,
            "Lines": [
                {"Position": "1", "Tla": "VER", "GapToLeader": ""},
                {"Position": "2", "Tla": "NOR", "GapToLeader": "+1.2"},
                {"Position": "3", "Tla": "LEC", "GapToLeader": "+3.4"},
            ]
        }));
        assert!(state.is_complete());

        state.merge(&json!({"Lines": {"1": {"GapToLeader": "+0.8"}}}));
        let p2 = state.lines[1].as_ref().unwrap();
        assert_eq!(p2["Tla"], "NOR");
        assert_eq!(p2["GapToLeader"], "+0.8");
    }

    #[test]
    fn delta_before_snapshot_accumulates() {
        let mut state = TopThreeState::default();
        state.merge(&json!({"Lines": {"0": {"Tla": "VER"}}}));
        state.merge(&json!({"Lines": {"2": {"Tla": "LEC"}}}));
        assert!(state.has_any());
        assert!(!state.is_complete());

        state.merge(&json!({"Lines": {"1": {"Tla": "NOR"}}}));
        assert!(state.is_complete());
    }

    #[test]
    fn out_of_range_slots_are_ignored() {
        let mut state = TopThreeState::default();
        state.merge(&json!({"Lines": {"7": {"Tla": "XXX"}, "-1": {"Tla": "YYY"}}}));
        assert!(!state.has_any());
    }

    #[test]
    fn payload_round_trip_shape() {
        let mut state = TopThreeState::default();
        state.merge(&json!({"Withheld": true, "Lines": [{"Tla": "VER"}, {"Tla": "NOR"}, {"Tla": "LEC"}]}));
        let payload = state.to_payload();
        assert_eq!(payload["Withheld"], true);
        assert_eq!(payload["Lines"].as_array().unwrap().len(), 3);
        assert_eq!(payload["Lines"][0]["Tla"], "VER");
    }
}
