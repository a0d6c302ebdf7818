// SQLite persistence for availability state and the latest probe results

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

use crate::availability::AvailabilityEntry;
use crate::probe::classify::{ProbeStatus, SubStatus};
use crate::probe::ProbeResult;
use crate::proxy::Platform;

/// Durable storage the core reads on startup and writes on change.
pub trait StateStore: Send + Sync {
    fn load_availability(&self) -> Result<Vec<AvailabilityEntry>>;
    fn save_availability(&self, entry: &AvailabilityEntry) -> Result<()>;
    fn load_probe_results(&self) -> Result<Vec<ProbeResult>>;
    fn save_probe_result(&self, result: &ProbeResult) -> Result<()>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        tracing::info!("SQLite database initialized at {:?}", path);
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS availability (
                platform TEXT NOT NULL,
                provider TEXT NOT NULL,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                blacklisted_until INTEGER,
                blacklist_level INTEGER NOT NULL DEFAULT 0,
                last_status TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (platform, provider)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS probe_results (
                platform TEXT NOT NULL,
                provider_id INTEGER NOT NULL,
                provider_name TEXT NOT NULL,
                status TEXT NOT NULL,
                sub_status TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                http_code INTEGER,
                message TEXT NOT NULL,
                model TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                checked_at INTEGER NOT NULL,
                PRIMARY KEY (platform, provider_id)
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn parse_column<T: std::str::FromStr>(raw: &str, column: &str) -> Option<T> {
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Skipping stored row with invalid {}: {}", column, raw);
            None
        }
    }
}

impl StateStore for SqliteStore {
    fn load_availability(&self) -> Result<Vec<AvailabilityEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT platform, provider, consecutive_failures, blacklisted_until, blacklist_level, last_status, updated_at
             FROM availability",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (platform, provider, failures, until, level, status, updated_at) = row?;
            let (Some(platform), Some(last_status)) = (
                parse_column::<Platform>(&platform, "platform"),
                parse_column::<ProbeStatus>(&status, "status"),
            ) else {
                continue;
            };
            result.push(AvailabilityEntry {
                platform,
                provider,
                consecutive_failures: failures,
                blacklisted_until: until.map(millis_to_datetime),
                blacklist_level: level,
                last_status,
                updated_at: millis_to_datetime(updated_at),
            });
        }

        Ok(result)
    }

    fn save_availability(&self, entry: &AvailabilityEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO availability
                (platform, provider, consecutive_failures, blacklisted_until, blacklist_level, last_status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.platform.to_string(),
                entry.provider,
                entry.consecutive_failures,
                entry.blacklisted_until.map(|u| u.timestamp_millis()),
                entry.blacklist_level,
                entry.last_status.as_str(),
                entry.updated_at.timestamp_millis(),
            ],
        )?;
        tracing::debug!(
            "Saved availability for {}/{}",
            entry.platform,
            entry.provider
        );
        Ok(())
    }

    fn load_probe_results(&self) -> Result<Vec<ProbeResult>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT platform, provider_id, provider_name, status, sub_status, latency_ms, http_code, message, model, endpoint, checked_at
             FROM probe_results",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<u16>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, i64>(10)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (
                platform,
                provider_id,
                provider_name,
                status,
                sub_status,
                latency_ms,
                http_code,
                message,
                model,
                endpoint,
                checked_at,
            ) = row?;
            let (Some(platform), Some(status), Some(sub_status)) = (
                parse_column::<Platform>(&platform, "platform"),
                parse_column::<ProbeStatus>(&status, "status"),
                parse_column::<SubStatus>(&sub_status, "sub_status"),
            ) else {
                continue;
            };
            result.push(ProbeResult {
                provider_id,
                provider_name,
                platform,
                status,
                sub_status,
                latency_ms: latency_ms.max(0) as u64,
                http_code,
                message,
                model,
                endpoint,
                checked_at: millis_to_datetime(checked_at),
            });
        }

        Ok(result)
    }

    fn save_probe_result(&self, result: &ProbeResult) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO probe_results
                (platform, provider_id, provider_name, status, sub_status, latency_ms, http_code, message, model, endpoint, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                result.platform.to_string(),
                result.provider_id,
                result.provider_name,
                result.status.as_str(),
                result.sub_status.as_str(),
                result.latency_ms as i64,
                result.http_code,
                result.message,
                result.model,
                result.endpoint,
                result.checked_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }
}
