//! Persisted start-reference selections.
//!
//! Two small JSON files remember which timing reference the user picked:
//! `live_delay_reference.json` for calibration and
//! `replay_start_reference.json` for playback. Both hold
//! `{"reference": "session" | "formation"}`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::error::Result;
use crate::TimingError;

/// Timing reference for calibration and replay start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    /// Anchor on `SessionStatus: Started`.
    #[default]
    Session,
    /// Anchor on the formation-lap start marker.
    Formation,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Session => "session",
            ReferenceKind::Formation => "formation",
        }
    }

    /// Lenient parse; anything unrecognized falls back to the default.
    pub fn parse_lenient(value: &str) -> ReferenceKind {
        match value.trim().to_ascii_lowercase().as_str() {
            "formation" => ReferenceKind::Formation,
            _ => ReferenceKind::Session,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredReference {
    reference: ReferenceKind,
}

/// Load/save wrapper for one reference file.
#[derive(Debug, Clone)]
pub struct ReferenceStore {
    path: PathBuf,
}

impl ReferenceStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read the stored reference; `fallback` when the file is missing or
    /// unreadable.
    pub async fn load(&self, fallback: ReferenceKind) -> ReferenceKind {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => match serde_json::from_str::<StoredReference>(&text) {
                Ok(stored) => stored.reference,
                Err(err) => {
                    debug!(path = %self.path.display(), %err, "reference file unreadable");
                    fallback
                }
            },
            Err(_) => fallback,
        }
    }

    pub async fn save(&self, reference: ReferenceKind) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TimingError::cache_error(parent, e))?;
        }
        let body = serde_json::to_string_pretty(&StoredReference { reference })?;
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| TimingError::cache_error(&self.path, e))
    }
}
