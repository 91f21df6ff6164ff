//! The event-store contract consumed by the sink and the dashboard API.

use serde_json::Value;

use tokentap_core::Event;

use crate::error::Result;
use crate::models::{DeviceSummary, EventFilter, StoredEvent, UsageGroup, UsageRow, UsageTotals};

/// Append/query contract over the event collection.
///
/// Append is the only call on the write path; everything else serves the
/// dashboard. Implementations may block — only sink workers and API
/// handlers call in.
pub trait EventStore: Send + Sync {
    /// Appends one event document.
    fn append(&self, event: &Event) -> Result<()>;

    /// Queries events matching the filter, newest first.
    /// Returns the page and the total match count.
    fn query_events(
        &self,
        filter: &EventFilter,
        skip: u64,
        limit: u64,
    ) -> Result<(Vec<StoredEvent>, u64)>;

    /// Fetches a single event by row id.
    fn get_event(&self, id: i64) -> Result<Option<StoredEvent>>;

    /// Total number of stored events.
    fn count_events(&self) -> Result<u64>;

    /// Aggregates token totals over matching events.
    fn aggregate_usage(&self, filter: &EventFilter) -> Result<UsageTotals>;

    /// Usage breakdown grouped by model/program/project/device.
    fn usage_by(&self, group: UsageGroup, filter: &EventFilter) -> Result<Vec<UsageRow>>;

    /// Deletes every event. Returns the deleted count.
    fn delete_all_events(&self) -> Result<u64>;

    /// Registers or renames a device (last write wins).
    fn register_device(&self, device_id: &str, name: &str, metadata: Option<Value>) -> Result<()>;

    /// Lists devices observed in events, joined with registered names.
    fn list_devices(&self) -> Result<Vec<DeviceSummary>>;

    /// Removes a device registration; historical events are kept.
    fn delete_device(&self, device_id: &str) -> Result<()>;
}
