//! TimingData merging: per-driver sector and lap state built up from deltas.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::jsonstream;

/// "No time" marker status on sector deltas.
const STATUS_NO_TIME: i64 = 2048;

/// One sector of the current lap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SectorSlot {
    pub value: Option<String>,
    pub personal_fastest: bool,
    pub overall_fastest: bool,
    pub stopped: bool,
}

/// Merged per-driver timing record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverTiming {
    pub sectors: [SectorSlot; 3],
    /// Personal-best sector times, reset on session-part changes.
    pub best_sectors: [Option<String>; 3],
    pub last_lap_time: Option<String>,
    pub position: Option<String>,
    pub in_pit: Option<bool>,
    pub retired: Option<bool>,
    pub number_of_laps: Option<i64>,
}

impl DriverTiming {
    fn lap_complete(&self) -> bool {
        self.sectors.iter().all(|s| s.value.is_some())
    }
}

/// Merged TimingData across all drivers.
#[derive(Debug, Clone, Default)]
pub struct TimingState {
    pub drivers: BTreeMap<String, DriverTiming>,
    pub session_part: Option<i64>,
}

/// Merge one TimingData delta payload into the state.
pub fn apply_timing_data(state: &mut TimingState, payload: &Value) {
    if let Some(part) = payload.get("SessionPart").and_then(jsonstream::as_i64) {
        if state.session_part != Some(part) {
            state.session_part = Some(part);
            // New qualifying part: everyone's personal bests start over.
            for driver in state.drivers.values_mut() {
                driver.best_sectors = Default::default();
            }
        }
    }

    let Some(lines) = payload.get("Lines").and_then(Value::as_object) else { return };
    for (racing_number, delta) in lines {
        if !delta.is_object() {
            continue;
        }
        let driver = state.drivers.entry(racing_number.clone()).or_default();
        apply_driver_delta(driver, delta);
    }
}

fn apply_driver_delta(driver: &mut DriverTiming, delta: &Value) {
    if let Some(position) = delta.get("Position").and_then(jsonstream::as_text) {
        driver.position = Some(position.to_string());
    }
    if let Some(in_pit) = delta.get("InPit").and_then(Value::as_bool) {
        driver.in_pit = Some(in_pit);
    }
    if let Some(retired) = delta.get("Retired").and_then(Value::as_bool) {
        driver.retired = Some(retired);
    }
    if let Some(laps) = delta.get("NumberOfLaps").and_then(jsonstream::as_i64) {
        driver.number_of_laps = Some(laps);
    }
    if let Some(lap_time) = delta
        .get("LastLapTime")
        .and_then(|l| l.get("Value"))
        .and_then(jsonstream::as_text)
    {
        driver.last_lap_time = Some(lap_time.to_string());
    }

    let Some(sectors) = delta.get("Sectors") else { return };
    let updates: Vec<(usize, &Value)> = jsonstream::indexed_sequence(sectors)
        .into_iter()
        .enumerate()
        .filter_map(|(position, (key, sector))| {
            let idx = key.map(|k| k as usize).unwrap_or(position);
            (idx < 3).then_some((idx, sector))
        })
        .collect();

    // A lone S1 with a completed previous lap starts a new lap: the stale
    // S2/S3 of the old lap must not linger next to the fresh S1.
    let has_value = |idx: usize| {
        updates.iter().any(|(i, sector)| {
            *i == idx
                && sector
                    .get("Value")
                    .and_then(jsonstream::as_text)
                    .is_some()
        })
    };
    if has_value(0) && !has_value(1) && !has_value(2) && driver.lap_complete() {
        driver.sectors[1] = SectorSlot::default();
        driver.sectors[2] = SectorSlot::default();
    }

    for (idx, sector) in updates {
        let slot = &mut driver.sectors[idx];
        let no_time = sector.get("Status").and_then(jsonstream::as_i64)
            == Some(STATUS_NO_TIME)
            || sector.get("Stopped").and_then(Value::as_bool) == Some(true);
        if let Some(stopped) = sector.get("Stopped").and_then(Value::as_bool) {
            slot.stopped = stopped;
        }
        if let Some(personal) = sector.get("PersonalFastest").and_then(Value::as_bool) {
            slot.personal_fastest = personal;
        }
        if let Some(overall) = sector.get("OverallFastest").and_then(Value::as_bool) {
            slot.overall_fastest = overall;
        }
        // An empty Value never clears an existing time.
        let value = sector.get("Value").and_then(jsonstream::as_text);
        if let Some(value) = value {
            if !no_time {
                slot.value = Some(value.to_string());
                if slot.personal_fastest {
                    driver.best_sectors[idx] = Some(value.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sector(value: &str, personal: bool) -> Value {
        json!({"Value": value, "Status": 0, "PersonalFastest": personal, "OverallFastest": false})
    }

    fn empty_sector() -> Value {
        json!({"Value": "", "Status": STATUS_NO_TIME, "PersonalFastest": false})
    }

    fn lines(rn: &str, sectors: Value) -> Value {
        json!({"Lines": {rn: {"Sectors": sectors}}})
    }

    #[test]
    fn lone_s1_clears_previous_lap_tail() {
        let mut state = TimingState::default();
        // Full lap.
        apply_timing_data(
            &mut state,
            &lines("44", json!([sector("28.1", false), sector("31.2", false), sector("27.9", false)])),
        );
        let driver = state.drivers.get("44").unwrap();
        assert!(driver.lap_complete());

        // New lap: S1 alone.
        apply_timing_data(&mut state, &lines("44", json!([sector("28.4", false), empty_sector(), empty_sector()])));
        let driver = state.drivers.get("44").unwrap();
        assert_eq!(driver.sectors[0].value.as_deref(), Some("28.4"));
        assert_eq!(driver.sectors[1].value, None);
        assert_eq!(driver.sectors[2].value, None);
    }

    #[test]
    fn full_lap_update_keeps_all_sectors() {
        let mut state = TimingState::default();
        apply_timing_data(
            &mut state,
            &lines("1", json!([sector("28.1", false), sector("31.2", false), sector("27.9", false)])),
        );
        apply_timing_data(
            &mut state,
            &lines("1", json!([sector("28.0", false), sector("31.0", false), sector("27.5", false)])),
        );
        let driver = state.drivers.get("1").unwrap();
        assert_eq!(driver.sectors[1].value.as_deref(), Some("31.0"));
        assert_eq!(driver.sectors[2].value.as_deref(), Some("27.5"));
    }

    #[test]
    fn map_keyed_sector_delta_merges() {
        let mut state = TimingState::default();
        apply_timing_data(
            &mut state,
            &lines("16", json!([sector("28.1", false), sector("31.2", false), sector("27.9", false)])),
        );
        // Delta touching only S2, keyed by stringified index.
        apply_timing_data(&mut state, &lines("16", json!({"1": sector("30.9", false)})));
        let driver = state.drivers.get("16").unwrap();
        assert_eq!(driver.sectors[0].value.as_deref(), Some("28.1"));
        assert_eq!(driver.sectors[1].value.as_deref(), Some("30.9"));
    }

    #[test]
    fn personal_fastest_updates_best_sector_only() {
        let mut state = TimingState::default();
        apply_timing_data(&mut state, &lines("81", json!([sector("27.9", true), empty_sector(), empty_sector()])));
        assert_eq!(
            state.drivers.get("81").unwrap().best_sectors[0].as_deref(),
            Some("27.9")
        );

        // Slower, not personal fastest: best unchanged.
        apply_timing_data(&mut state, &lines("81", json!([sector("28.6", false), empty_sector(), empty_sector()])));
        let driver = state.drivers.get("81").unwrap();
        assert_eq!(driver.sectors[0].value.as_deref(), Some("28.6"));
        assert_eq!(driver.best_sectors[0].as_deref(), Some("27.9"));
    }

    #[test]
    fn empty_value_never_clears_a_time() {
        let mut state = TimingState::default();
        apply_timing_data(&mut state, &lines("55", json!([sector("28.2", false), sector("31.0", false), sector("26.8", false)])));
        apply_timing_data(&mut state, &lines("55", json!({"2": {"Value": "", "Status": 0}})));
        assert_eq!(
            state.drivers.get("55").unwrap().sectors[2].value.as_deref(),
            Some("26.8")
        );
    }

    #[test]
    fn session_part_change_resets_best_sectors() {
        let mut state = TimingState::default();
        apply_timing_data(
            &mut state,
            &json!({"SessionPart": 1, "Lines": {"4": {"Sectors": [sector("27.7", true), empty_sector(), empty_sector()]}}}),
        );
        assert!(state.drivers.get("4").unwrap().best_sectors[0].is_some());

        apply_timing_data(&mut state, &json!({"SessionPart": 2}));
        assert_eq!(state.session_part, Some(2));
        assert!(state.drivers.get("4").unwrap().best_sectors[0].is_none());
    }

    #[test]
    fn stopped_sector_is_no_time() {
        let mut state = TimingState::default();
        apply_timing_data(
            &mut state,
            &lines("23", json!([{"Value": "45.1", "Stopped": true}, empty_sector(), empty_sector()])),
        );
        let driver = state.drivers.get("23").unwrap();
        assert_eq!(driver.sectors[0].value, None);
        assert!(driver.sectors[0].stopped);
    }

    #[test]
    fn lap_time_and_position_merge() {
        let mut state = TimingState::default();
        apply_timing_data(
            &mut state,
            &json!({"Lines": {"63": {
                "Position": "4",
                "InPit": false,
                "LastLapTime": {"Value": "1:27.456"},
                "NumberOfLaps": 12,
            }}}),
        );
        let driver = state.drivers.get("63").unwrap();
        assert_eq!(driver.position.as_deref(), Some("4"));
        assert_eq!(driver.in_pit, Some(false));
        assert_eq!(driver.last_lap_time.as_deref(), Some("1:27.456"));
        assert_eq!(driver.number_of_laps, Some(12));
    }
}
