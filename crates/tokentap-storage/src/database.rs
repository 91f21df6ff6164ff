//! SQLite-backed event store.
//!
//! Events are stored as full JSON documents with the hot filter and
//! aggregation columns denormalised alongside. This is the bundled driver
//! behind the [`EventStore`] contract; the rest of the pipeline only sees
//! the trait.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter};
use serde_json::Value;
use tracing::info;

use tokentap_core::Event;

use crate::conn::DbConn;
use crate::error::{Result, StorageError};
use crate::models::{
    default_device_name, DeviceSummary, EventFilter, StoredEvent, UsageGroup, UsageRow,
    UsageTotals,
};
use crate::store::EventStore;

/// SQLite event database.
#[derive(Clone)]
pub struct Database {
    conn: DbConn,
}

impl Database {
    /// Opens (creating if needed) the database in the default data directory.
    pub fn new() -> Result<Self> {
        let path = Self::default_db_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "opening event database");
        Ok(Self {
            conn: DbConn::open(&path)?,
        })
    }

    /// Opens a database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "opening event database");
        Ok(Self {
            conn: DbConn::open(&path)?,
        })
    }

    /// Creates an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: DbConn::open_in_memory()?,
        })
    }

    /// The default database path under the tokentap data directory.
    pub fn default_db_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("io", "tokentap", "tokentap")
            .ok_or_else(|| StorageError::Config("could not determine data directory".into()))?;
        Ok(dirs.data_dir().join("events.db"))
    }
}

/// Builds the WHERE clause and parameter list for a filter.
fn filter_clause(filter: &EventFilter) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    let mut push = |clause: &str, value: SqlValue| {
        values.push(value);
        clauses.push(clause.replace('?', &format!("?{}", values.len())));
    };

    if let Some(p) = &filter.provider {
        push("provider_id = ?", SqlValue::Text(p.clone()));
    }
    if let Some(m) = &filter.model {
        push("model = ?", SqlValue::Text(m.clone()));
    }
    if let Some(p) = &filter.program {
        push("program = ?", SqlValue::Text(p.clone()));
    }
    if let Some(p) = &filter.project {
        push("project = ?", SqlValue::Text(p.clone()));
    }
    if let Some(d) = &filter.device_id {
        push("device_id = ?", SqlValue::Text(d.clone()));
    }
    if let Some(c) = &filter.capture_mode {
        push("capture_mode = ?", SqlValue::Text(c.clone()));
    }
    if let Some(t) = filter.is_token_consuming {
        push("is_token_consuming = ?", SqlValue::Integer(t as i64));
    }
    if let Some(from) = &filter.date_from {
        push("timestamp >= ?", SqlValue::Text(from.to_rfc3339()));
    }
    if let Some(to) = &filter.date_to {
        push("timestamp <= ?", SqlValue::Text(to.to_rfc3339()));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

fn row_to_stored(id: i64, doc: &str) -> Result<StoredEvent> {
    let event: Event = serde_json::from_str(doc)?;
    Ok(StoredEvent { id, event })
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

impl EventStore for Database {
    fn append(&self, event: &Event) -> Result<()> {
        let doc = serde_json::to_string(event)?;
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO events (
                timestamp, provider_id, model, program, project, device_id,
                capture_mode, is_token_consuming, input_tokens, output_tokens,
                cache_creation_tokens, cache_read_tokens, estimated_cost, doc
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                event.timestamp.to_rfc3339(),
                event.provider_id,
                event.model,
                event.program,
                event.project,
                event.device_id,
                event.capture_mode.as_str(),
                event.is_token_consuming,
                event.input_tokens as i64,
                event.output_tokens as i64,
                event.cache_creation_tokens as i64,
                event.cache_read_tokens as i64,
                event.estimated_cost,
                doc,
            ],
        )?;
        Ok(())
    }

    fn query_events(
        &self,
        filter: &EventFilter,
        skip: u64,
        limit: u64,
    ) -> Result<(Vec<StoredEvent>, u64)> {
        let (clause, values) = filter_clause(filter);
        let conn = self.conn.lock()?;

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM events{clause}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT id, doc FROM events{clause} ORDER BY timestamp DESC LIMIT {limit} OFFSET {skip}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, doc) = row?;
            events.push(row_to_stored(id, &doc)?);
        }

        Ok((events, total as u64))
    }

    fn get_event(&self, id: i64) -> Result<Option<StoredEvent>> {
        let conn = self.conn.lock()?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, doc FROM events WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        row.map(|(id, doc)| row_to_stored(id, &doc)).transpose()
    }

    fn count_events(&self) -> Result<u64> {
        let conn = self.conn.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn aggregate_usage(&self, filter: &EventFilter) -> Result<UsageTotals> {
        let (clause, values) = filter_clause(filter);
        let conn = self.conn.lock()?;
        let totals = conn.query_row(
            &format!(
                "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(cache_creation_tokens), 0), COALESCE(SUM(cache_read_tokens), 0),
                        COUNT(*), COALESCE(SUM(estimated_cost), 0.0)
                 FROM events{clause}"
            ),
            params_from_iter(values.iter()),
            |row| {
                Ok(UsageTotals {
                    input_tokens: row.get::<_, i64>(0)? as u64,
                    output_tokens: row.get::<_, i64>(1)? as u64,
                    cache_creation_tokens: row.get::<_, i64>(2)? as u64,
                    cache_read_tokens: row.get::<_, i64>(3)? as u64,
                    request_count: row.get::<_, i64>(4)? as u64,
                    estimated_cost: row.get(5)?,
                })
            },
        )?;
        Ok(totals)
    }

    fn usage_by(&self, group: UsageGroup, filter: &EventFilter) -> Result<Vec<UsageRow>> {
        let (clause, values) = filter_clause(filter);
        let column = group.column();
        let conn = self.conn.lock()?;
        let sql = format!(
            "SELECT COALESCE({column}, 'unknown'),
                    COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(cache_creation_tokens), 0), COALESCE(SUM(cache_read_tokens), 0),
                    COUNT(*), COALESCE(SUM(estimated_cost), 0.0)
             FROM events{clause}
             GROUP BY COALESCE({column}, 'unknown')
             ORDER BY 2 DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok(UsageRow {
                key: row.get(0)?,
                totals: UsageTotals {
                    input_tokens: row.get::<_, i64>(1)? as u64,
                    output_tokens: row.get::<_, i64>(2)? as u64,
                    cache_creation_tokens: row.get::<_, i64>(3)? as u64,
                    cache_read_tokens: row.get::<_, i64>(4)? as u64,
                    request_count: row.get::<_, i64>(5)? as u64,
                    estimated_cost: row.get(6)?,
                },
            })
        })?;

        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn delete_all_events(&self) -> Result<u64> {
        let conn = self.conn.lock()?;
        let deleted = conn.execute("DELETE FROM events", [])?;
        Ok(deleted as u64)
    }

    fn register_device(&self, device_id: &str, name: &str, metadata: Option<Value>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let metadata = metadata.unwrap_or_else(|| Value::Object(Default::default()));
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO devices (id, name, metadata, first_seen, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 metadata = excluded.metadata,
                 last_updated = excluded.last_updated",
            params![device_id, name, metadata.to_string(), now],
        )?;
        Ok(())
    }

    fn list_devices(&self) -> Result<Vec<DeviceSummary>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT e.device_id,
                    MIN(e.timestamp), MAX(e.timestamp), COUNT(*),
                    COALESCE(SUM(e.input_tokens), 0), COALESCE(SUM(e.output_tokens), 0),
                    MAX(json_extract(e.doc, '$.device.os')),
                    d.name
             FROM events e
             LEFT JOIN devices d ON d.id = e.device_id
             WHERE e.device_id IS NOT NULL
             GROUP BY e.device_id
             ORDER BY MAX(e.timestamp) DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let custom_name: Option<String> = row.get(7)?;
            Ok(DeviceSummary {
                name: custom_name
                    .clone()
                    .unwrap_or_else(|| default_device_name(&id)),
                has_custom_name: custom_name.is_some(),
                id,
                first_seen: row.get::<_, Option<String>>(1)?.and_then(|s| parse_datetime(&s)),
                last_seen: row.get::<_, Option<String>>(2)?.and_then(|s| parse_datetime(&s)),
                request_count: row.get::<_, i64>(3)? as u64,
                total_input_tokens: row.get::<_, i64>(4)? as u64,
                total_output_tokens: row.get::<_, i64>(5)? as u64,
                os: row.get(6)?,
            })
        })?;

        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn delete_device(&self, device_id: &str) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute("DELETE FROM devices WHERE id = ?1", [device_id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tokentap_core::context::{ClientType, ContextMetadata};
    use tokentap_core::device::DeviceInfo;
    use tokentap_core::extract::{RequestDigest, UsageDelta};
    use tokentap_core::provider::CaptureMode;
    use tokentap_core::EventParts;

    fn sample_event(provider: &str, program: Option<&str>, input: u64, output: u64) -> Event {
        Event::assemble(EventParts {
            timestamp: Utc::now(),
            duration_ms: 42,
            provider_id: provider.to_string(),
            host: format!("api.{provider}.com"),
            path: "/v1/messages".to_string(),
            digest: RequestDigest {
                messages: Some(vec![serde_json::json!({"role": "user", "content": "hi"})]),
                ..Default::default()
            },
            usage: UsageDelta {
                input_tokens: input,
                output_tokens: output,
                ..Default::default()
            },
            context: ContextMetadata {
                program: program.map(str::to_string),
                ..Default::default()
            },
            device: DeviceInfo {
                id: "device-1".to_string(),
                os: "linux".to_string(),
                ..Default::default()
            },
            client_type: ClientType::ClaudeCode,
            user_agent: "claude-code/2.0".to_string(),
            response_status: 200,
            streaming: false,
            truncated: false,
            capture_mode: CaptureMode::KnownOnly,
            capture_full: false,
            path_matches_api: true,
            provider_tags: vec![],
            cost_per_input_token: Some(1e-6),
            cost_per_output_token: Some(2e-6),
            raw_request: None,
            raw_response: None,
        })
    }

    #[test]
    fn append_and_query_round_trip() {
        let db = Database::in_memory().unwrap();
        db.append(&sample_event("anthropic", Some("claude-code"), 10, 5))
            .unwrap();

        let (events, total) = db.query_events(&EventFilter::default(), 0, 50).unwrap();
        assert_eq!(total, 1);
        assert_eq!(events[0].event.provider_id, "anthropic");
        assert_eq!(events[0].event.input_tokens, 10);
        assert_eq!(events[0].event.messages[0]["content"], "[REDACTED]");
    }

    #[test]
    fn append_has_no_dedup() {
        let db = Database::in_memory().unwrap();
        let event = sample_event("anthropic", None, 1, 1);
        db.append(&event).unwrap();
        db.append(&event).unwrap();
        assert_eq!(db.count_events().unwrap(), 2);
    }

    #[test]
    fn filters_by_provider_and_program() {
        let db = Database::in_memory().unwrap();
        db.append(&sample_event("anthropic", Some("claude-code"), 10, 5))
            .unwrap();
        db.append(&sample_event("openai", Some("codex"), 20, 7)).unwrap();

        let filter = EventFilter {
            provider: Some("openai".to_string()),
            ..Default::default()
        };
        let (events, total) = db.query_events(&filter, 0, 50).unwrap();
        assert_eq!(total, 1);
        assert_eq!(events[0].event.provider_id, "openai");

        let filter = EventFilter {
            program: Some("claude-code".to_string()),
            ..Default::default()
        };
        let (_, total) = db.query_events(&filter, 0, 50).unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn date_range_filter() {
        let db = Database::in_memory().unwrap();
        db.append(&sample_event("anthropic", None, 1, 1)).unwrap();

        let filter = EventFilter {
            date_from: Some(Utc::now() + Duration::hours(1)),
            ..Default::default()
        };
        let (_, total) = db.query_events(&filter, 0, 50).unwrap();
        assert_eq!(total, 0);
    }

    #[test]
    fn aggregate_usage_totals() {
        let db = Database::in_memory().unwrap();
        db.append(&sample_event("anthropic", None, 10, 5)).unwrap();
        db.append(&sample_event("anthropic", None, 20, 15)).unwrap();

        let totals = db.aggregate_usage(&EventFilter::default()).unwrap();
        assert_eq!(totals.input_tokens, 30);
        assert_eq!(totals.output_tokens, 20);
        assert_eq!(totals.request_count, 2);
        assert!(totals.estimated_cost > 0.0);
    }

    #[test]
    fn usage_breakdown_by_model_and_program() {
        let db = Database::in_memory().unwrap();
        db.append(&sample_event("anthropic", Some("claude-code"), 10, 5))
            .unwrap();
        db.append(&sample_event("openai", Some("codex"), 20, 7)).unwrap();

        let rows = db
            .usage_by(UsageGroup::Program, &EventFilter::default())
            .unwrap();
        assert_eq!(rows.len(), 2);
        // Sorted by input tokens descending.
        assert_eq!(rows[0].key, "codex");
        assert_eq!(rows[0].totals.input_tokens, 20);
    }

    #[test]
    fn delete_all_events_returns_count() {
        let db = Database::in_memory().unwrap();
        db.append(&sample_event("anthropic", None, 1, 1)).unwrap();
        db.append(&sample_event("anthropic", None, 1, 1)).unwrap();
        assert_eq!(db.delete_all_events().unwrap(), 2);
        assert_eq!(db.count_events().unwrap(), 0);
    }

    #[test]
    fn device_registry_upsert_and_listing() {
        let db = Database::in_memory().unwrap();
        db.append(&sample_event("anthropic", None, 10, 5)).unwrap();

        let devices = db.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "device-1");
        assert!(!devices[0].has_custom_name);
        assert_eq!(devices[0].name, "Device device-1");
        assert_eq!(devices[0].os.as_deref(), Some("linux"));

        db.register_device("device-1", "Work laptop", None).unwrap();
        let devices = db.list_devices().unwrap();
        assert_eq!(devices[0].name, "Work laptop");
        assert!(devices[0].has_custom_name);

        // Last write wins.
        db.register_device("device-1", "Desk machine", None).unwrap();
        assert_eq!(db.list_devices().unwrap()[0].name, "Desk machine");

        db.delete_device("device-1").unwrap();
        assert!(!db.list_devices().unwrap()[0].has_custom_name);
    }
}
