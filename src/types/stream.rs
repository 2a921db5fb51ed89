//! Stream identifiers for the live-timing feed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of streams published by the live-timing host.
///
/// Wire names are used verbatim in the Subscribe frame, the archive file
/// names (`<StreamId>.jsonStream`) and the replay frame records. Unknown
/// names on the wire are skipped rather than mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamId {
    RaceControlMessages,
    TrackStatus,
    SessionStatus,
    SessionInfo,
    SessionData,
    TimingData,
    TimingAppData,
    DriverList,
    LapCount,
    WeatherData,
    TeamRadio,
    CarData,
    Heartbeat,
    ExtrapolatedClock,
    TopThree,
    TyreStintSeries,
    PitStopSeries,
    ChampionshipPrediction,
}

impl StreamId {
    /// All streams requested in the live Subscribe frame.
    pub const SUBSCRIBED: &'static [StreamId] = &[
        StreamId::RaceControlMessages,
        StreamId::TrackStatus,
        StreamId::SessionStatus,
        StreamId::SessionInfo,
        StreamId::SessionData,
        StreamId::TimingData,
        StreamId::TimingAppData,
        StreamId::DriverList,
        StreamId::LapCount,
        StreamId::WeatherData,
        StreamId::TeamRadio,
        StreamId::Heartbeat,
        StreamId::ExtrapolatedClock,
        StreamId::TopThree,
        StreamId::TyreStintSeries,
        StreamId::PitStopSeries,
        StreamId::ChampionshipPrediction,
    ];

    /// Streams whose recent activity counts as "the feed is alive" for the
    /// supervisor's drain detection.
    pub const LIVE_ACTIVITY: &'static [StreamId] = &[
        StreamId::SessionStatus,
        StreamId::SessionInfo,
        StreamId::RaceControlMessages,
        StreamId::TrackStatus,
        StreamId::TimingData,
        StreamId::TimingAppData,
        StreamId::DriverList,
        StreamId::LapCount,
        StreamId::WeatherData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamId::RaceControlMessages => "RaceControlMessages",
            StreamId::TrackStatus => "TrackStatus",
            StreamId::SessionStatus => "SessionStatus",
            StreamId::SessionInfo => "SessionInfo",
            StreamId::SessionData => "SessionData",
            StreamId::TimingData => "TimingData",
            StreamId::TimingAppData => "TimingAppData",
            StreamId::DriverList => "DriverList",
            StreamId::LapCount => "LapCount",
            StreamId::WeatherData => "WeatherData",
            StreamId::TeamRadio => "TeamRadio",
            StreamId::CarData => "CarData",
            StreamId::Heartbeat => "Heartbeat",
            StreamId::ExtrapolatedClock => "ExtrapolatedClock",
            StreamId::TopThree => "TopThree",
            StreamId::TyreStintSeries => "TyreStintSeries",
            StreamId::PitStopSeries => "PitStopSeries",
            StreamId::ChampionshipPrediction => "ChampionshipPrediction",
        }
    }

    /// Parse a wire name. The live feed appends `.z` to compressed streams;
    /// that suffix is accepted and stripped.
    pub fn parse(name: &str) -> Option<StreamId> {
        let name = name.strip_suffix(".z").unwrap_or(name);
        match name {
            "RaceControlMessages" => Some(StreamId::RaceControlMessages),
            "TrackStatus" => Some(StreamId::TrackStatus),
            "SessionStatus" => Some(StreamId::SessionStatus),
            "SessionInfo" => Some(StreamId::SessionInfo),
            "SessionData" => Some(StreamId::SessionData),
            "TimingData" => Some(StreamId::TimingData),
            "TimingAppData" => Some(StreamId::TimingAppData),
            "DriverList" => Some(StreamId::DriverList),
            "LapCount" => Some(StreamId::LapCount),
            "WeatherData" => Some(StreamId::WeatherData),
            "TeamRadio" => Some(StreamId::TeamRadio),
            "CarData" => Some(StreamId::CarData),
            "Heartbeat" => Some(StreamId::Heartbeat),
            "ExtrapolatedClock" => Some(StreamId::ExtrapolatedClock),
            "TopThree" => Some(StreamId::TopThree),
            "TyreStintSeries" => Some(StreamId::TyreStintSeries),
            "PitStopSeries" => Some(StreamId::PitStopSeries),
            "ChampionshipPrediction" => Some(StreamId::ChampionshipPrediction),
            _ => None,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
