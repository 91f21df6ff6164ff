//! Application state for the dashboard API.

use std::sync::Arc;

use tokentap_core::counters::TapCounters;
use tokentap_core::security::SecurityGate;
use tokentap_storage::{EventStore, SinkCounters};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Event store (append is never called from here; queries only,
    /// plus the destructive endpoints).
    pub store: Arc<dyn EventStore>,
    /// Security gate for admin-token checks and mode reporting.
    pub security: SecurityGate,
    /// Pipeline counters.
    pub counters: Arc<TapCounters>,
    /// Sink counters.
    pub sink_counters: Arc<SinkCounters>,
}

impl AppState {
    /// Creates application state over the given store.
    pub fn new(
        store: Arc<dyn EventStore>,
        security: SecurityGate,
        counters: Arc<TapCounters>,
        sink_counters: Arc<SinkCounters>,
    ) -> Self {
        Self {
            store,
            security,
            counters,
            sink_counters,
        }
    }
}
