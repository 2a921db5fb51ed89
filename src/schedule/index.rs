//! Primary schedule source: the season `Index.json`.

use chrono::{Datelike, Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::debug;

use super::{build_session_windows, ScheduleResult, ScheduleSource, ScheduleSourceKind};
use crate::error::TimingError;
use crate::http::CachedClient;

/// Index payloads change rarely outside of session reschedules.
const INDEX_TTL: StdDuration = StdDuration::from_secs(60);

/// Reads `<static_base>/<year>/Index.json` and produces windows from every
/// meeting/session that has a start date.
pub struct IndexScheduleSource {
    http: Arc<CachedClient>,
    static_base: String,
}

impl IndexScheduleSource {
    pub fn new(http: Arc<CachedClient>, static_base: impl Into<String>) -> Self {
        Self { http, static_base: static_base.into() }
    }

    fn index_url(&self) -> String {
        format!("{}/{}/Index.json", self.static_base, Utc::now().year())
    }
}

#[async_trait::async_trait]
impl ScheduleSource for IndexScheduleSource {
    async fn fetch_windows(
        &self,
        pre_window: Duration,
        post_window: Duration,
        _active: bool,
    ) -> ScheduleResult {
        let url = self.index_url();
        match self.http.fetch_json(&url, &[], INDEX_TTL).await {
            Ok(payload) => {
                let windows = build_session_windows(&payload, pre_window, post_window);
                debug!(windows = windows.len(), "season index fetched");
                ScheduleResult {
                    windows,
                    source: ScheduleSourceKind::Index,
                    http_status: Some(200),
                    last_error: None,
                }
            }
            Err(err) => {
                let http_status = match &err {
                    TimingError::Status { status, .. } => Some(*status),
                    _ => None,
                };
                ScheduleResult {
                    windows: Vec::new(),
                    source: ScheduleSourceKind::Index,
                    http_status,
                    last_error: Some(err.to_string()),
                }
            }
        }
    }
}
