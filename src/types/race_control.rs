//! Normalized race-control messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message category. The feed sends these either as numbers or text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RcCategory {
    CarEvent,
    SafetyCar,
    Flag,
    Session,
    Message,
    Other,
}

impl RcCategory {
    pub fn from_code(code: i64) -> Option<RcCategory> {
        match code {
            0 => Some(RcCategory::CarEvent),
            1 => Some(RcCategory::SafetyCar),
            2 => Some(RcCategory::Flag),
            3 => Some(RcCategory::Session),
            4 => Some(RcCategory::Message),
            5 => Some(RcCategory::Other),
            _ => None,
        }
    }

    pub fn from_text(text: &str) -> Option<RcCategory> {
        match text {
            "CarEvent" => Some(RcCategory::CarEvent),
            "SafetyCar" => Some(RcCategory::SafetyCar),
            "Flag" => Some(RcCategory::Flag),
            "Session" => Some(RcCategory::Session),
            "Message" => Some(RcCategory::Message),
            "Other" => Some(RcCategory::Other),
            _ => None,
        }
    }
}

/// Flag value carried by `Flag` category messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RcFlag {
    Green,
    Yellow,
    DoubleYellow,
    Red,
    Blue,
    White,
    Black,
    Chequered,
    Clear,
}

impl RcFlag {
    pub fn from_code(code: i64) -> Option<RcFlag> {
        match code {
            1 => Some(RcFlag::Green),
            2 => Some(RcFlag::Yellow),
            3 => Some(RcFlag::DoubleYellow),
            4 => Some(RcFlag::Red),
            5 => Some(RcFlag::Blue),
            6 => Some(RcFlag::White),
            7 => Some(RcFlag::Black),
            8 => Some(RcFlag::Chequered),
            _ => None,
        }
    }

    pub fn from_text(text: &str) -> Option<RcFlag> {
        match text.to_ascii_uppercase().as_str() {
            "GREEN" => Some(RcFlag::Green),
            "YELLOW" => Some(RcFlag::Yellow),
            "DOUBLE YELLOW" => Some(RcFlag::DoubleYellow),
            "RED" => Some(RcFlag::Red),
            "BLUE" => Some(RcFlag::Blue),
            "WHITE" => Some(RcFlag::White),
            "BLACK" => Some(RcFlag::Black),
            "CHEQUERED" => Some(RcFlag::Chequered),
            "CLEAR" => Some(RcFlag::Clear),
            _ => None,
        }
    }
}

/// Scope of a flag message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RcScope {
    Track,
    Sector,
    Driver,
}

impl RcScope {
    pub fn from_code(code: i64) -> Option<RcScope> {
        match code {
            0 => Some(RcScope::Track),
            1 => Some(RcScope::Sector),
            2 => Some(RcScope::Driver),
            _ => None,
        }
    }

    pub fn from_text(text: &str) -> Option<RcScope> {
        match text {
            "Track" => Some(RcScope::Track),
            "Sector" => Some(RcScope::Sector),
            "Driver" => Some(RcScope::Driver),
            _ => None,
        }
    }
}

/// A race-control message after normalization.
///
/// `status` and `mode` carry the raw `Status`/`Mode` strings from safety-car
/// messages ("DEPLOYED", "IN THIS LAP", "VIRTUAL SAFETY CAR", ...); the flag
/// machine matches on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceControlMsg {
    pub id: Option<i64>,
    pub utc: Option<DateTime<Utc>>,
    pub category: RcCategory,
    pub flag: Option<RcFlag>,
    pub scope: Option<RcScope>,
    pub sector: Option<u8>,
    pub lap: Option<u32>,
    pub driver_number: Option<String>,
    pub message: Option<String>,
    pub status: Option<String>,
    pub mode: Option<String>,
}
