//! Data models for the store's query surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tokentap_core::Event;

/// A stored event with its row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    #[serde(flatten)]
    pub event: Event,
}

/// Filters for event queries and aggregations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
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

/// Aggregated token totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub request_count: u64,
    pub estimated_cost: f64,
}

/// Grouping key for usage breakdowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageGroup {
    Model,
    Program,
    Project,
    Device,
}

impl UsageGroup {
    /// The events column the breakdown groups on.
    pub fn column(&self) -> &'static str {
        match self {
            UsageGroup::Model => "model",
            UsageGroup::Program => "program",
            UsageGroup::Project => "project",
            UsageGroup::Device => "device_id",
        }
    }
}

/// One row of a usage breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRow {
    /// The group value (`unknown` when the column was null).
    pub key: String,
    #[serde(flatten)]
    pub totals: UsageTotals,
}

/// A registered device with usage summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: String,
    pub name: String,
    pub has_custom_name: bool,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub request_count: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub os: Option<String>,
}

/// Default display name for an unnamed device.
pub fn default_device_name(device_id: &str) -> String {
    let short: String = device_id.chars().take(8).collect();
    format!("Device {short}")
}

/// Parameters for registering a device name.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterDevice {
    pub name: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}
