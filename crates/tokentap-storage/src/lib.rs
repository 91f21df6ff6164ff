//! Tokentap Storage - event persistence and the asynchronous write path.
//!
//! - [`store`] - the `EventStore` append/query contract
//! - [`database`] - the bundled SQLite document driver
//! - [`sink`] - bounded queue + writer workers bridging hooks and the store
//! - [`conn`] - the shared mutex-guarded SQLite connection
//! - [`schema`] - migrations (indexes required by the query surface)
//! - [`models`] - filters, aggregation rows, device records

pub mod conn;
pub mod database;
pub mod error;
pub mod models;
pub mod schema;
pub mod sink;
pub mod store;

pub use database::Database;
pub use error::{Result, StorageError};
pub use models::{
    DeviceSummary, EventFilter, RegisterDevice, StoredEvent, UsageGroup, UsageRow, UsageTotals,
};
pub use sink::{EventSink, SinkConfig, SinkCounters, SinkHandle};
pub use store::EventStore;
