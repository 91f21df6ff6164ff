//! Request/response models for the dashboard API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tokentap_storage::{EventFilter, StoredEvent, UsageRow, UsageTotals};

fn default_limit() -> u64 {
    50
}

/// Query parameters for event listing and aggregations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub program: Option<String>,
    pub project: Option<String>,
    pub device_id: Option<String>,
    pub capture_mode: Option<String>,
    pub is_token_consuming: Option<bool>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl EventsQuery {
    /// Converts the query into a store filter.
    pub fn filter(&self) -> EventFilter {
        EventFilter {
            provider: self.provider.clone(),
            model: self.model.clone(),
            program: self.program.clone(),
            project: self.project.clone(),
            device_id: self.device_id.clone(),
            capture_mode: self.capture_mode.clone(),
            is_token_consuming: self.is_token_consuming,
            date_from: self.date_from,
            date_to: self.date_to,
        }
    }
}

/// Paginated event listing.
#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<StoredEvent>,
    pub total: u64,
}

/// Aggregate usage totals.
#[derive(Debug, Serialize)]
pub struct UsageResponse {
    #[serde(flatten)]
    pub totals: UsageTotals,
}

/// Usage breakdown rows.
#[derive(Debug, Serialize)]
pub struct UsageBreakdownResponse {
    pub rows: Vec<UsageRow>,
}

/// Result of a destructive delete.
#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: u64,
}

/// Internal status: pipeline counters and operator modes.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub network_mode: &'static str,
    pub debug_mode: &'static str,
    pub events: u64,
    pub sink_dropped: u64,
    pub sink_failed: u64,
    pub sink_written: u64,
    pub extract_degraded: u64,
    pub stream_skipped: u64,
}
