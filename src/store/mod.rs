//! Durable at-least-once measurement buffer on embedded SQLite.

mod migrations;

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{params, Connection};

use crate::probe::{Measurement, ProbeType};

/// A measurement as persisted, with its storage identity.
#[derive(Debug, Clone)]
pub struct StoredMeasurement {
    /// Monotone rowid, never reused, stable across restarts.
    pub id: i64,
    /// True once the pusher has delivered this record.
    pub synced: bool,
    pub measurement: Measurement,
}

/// SQLite-backed measurement store.
///
/// WAL journaling gives crash safety and lets the pusher read while the
/// scheduler sink writes; the engine's transaction serialization is the
/// correctness boundary, so callers never hold cross-operation locks.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and applies
    /// schema migrations. The parent directory is created if missing.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("creating database directory {}", parent.display())
                })?;
            }
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("enabling WAL mode")?;

        migrations::apply(&mut conn).context("running migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory store, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("opening in-memory database")?;
        migrations::apply(&mut conn).context("running migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a single measurement, unsynced.
    pub fn save_measurement(&self, m: &Measurement) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn.prepare_cached(INSERT_SQL).context("preparing insert")?;

        bind_insert(&mut stmt, m).context("inserting measurement")?;

        Ok(())
    }

    /// Inserts a batch of measurements in one transaction, all-or-nothing.
    pub fn save_measurements(&self, measurements: &[Measurement]) -> Result<()> {
        if measurements.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().expect("store lock");
        let tx = conn.transaction().context("beginning insert transaction")?;

        {
            let mut stmt = tx.prepare_cached(INSERT_SQL).context("preparing insert")?;
            for m in measurements {
                bind_insert(&mut stmt, m).context("inserting measurement")?;
            }
        }

        tx.commit().context("committing insert transaction")
    }

    /// Returns up to `limit` unsynced measurements, oldest first.
    pub fn get_unsynced(&self, limit: usize) -> Result<Vec<StoredMeasurement>> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, timestamp, probe_type, target, latency_min, latency_avg,
                        latency_max, latency_p95, jitter, packet_loss, dns_time,
                        bufferbloat, synced
                 FROM measurements
                 WHERE synced = 0
                 ORDER BY timestamp ASC, id ASC
                 LIMIT ?1",
            )
            .context("preparing unsynced query")?;

        let rows = stmt
            .query_map(params![limit as i64], scan_row)
            .context("querying unsynced measurements")?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.context("scanning measurement row")??);
        }

        Ok(results)
    }

    /// Marks the given ids as synced, in one transaction. A synced
    /// record is never modified again.
    pub fn mark_synced(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().expect("store lock");
        let tx = conn.transaction().context("beginning sync transaction")?;

        {
            let mut stmt = tx
                .prepare_cached("UPDATE measurements SET synced = 1 WHERE id = ?1")
                .context("preparing sync update")?;
            for id in ids {
                stmt.execute(params![id])
                    .with_context(|| format!("marking measurement {id} as synced"))?;
            }
        }

        tx.commit().context("committing sync transaction")
    }

    /// Deletes synced measurements older than the retention window and
    /// compacts the database if anything was removed. Unsynced records
    /// are never deleted regardless of age.
    pub fn cleanup(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        let cutoff_str = format_timestamp(&cutoff);

        let conn = self.conn.lock().expect("store lock");
        let deleted = conn
            .execute(
                "DELETE FROM measurements WHERE synced = 1 AND timestamp < ?1",
                params![cutoff_str],
            )
            .context("deleting expired measurements")? as u64;

        if deleted > 0 {
            conn.execute_batch("VACUUM").context("compacting database")?;
        }

        Ok(deleted)
    }

    /// Flushes the WAL back into the main database file. The connection
    /// itself is released on drop.
    pub fn close(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .context("checkpointing WAL")
    }

    #[cfg(test)]
    fn count_all(&self) -> i64 {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row("SELECT COUNT(*) FROM measurements", [], |row| row.get(0))
            .expect("count query")
    }
}

const INSERT_SQL: &str = "INSERT INTO measurements (
        timestamp, probe_type, target, latency_min, latency_avg, latency_max,
        latency_p95, jitter, packet_loss, dns_time, bufferbloat
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

fn bind_insert(stmt: &mut rusqlite::CachedStatement<'_>, m: &Measurement) -> rusqlite::Result<usize> {
    stmt.execute(params![
        format_timestamp(&m.timestamp),
        m.probe_type.as_str(),
        m.target,
        m.latency_min,
        m.latency_avg,
        m.latency_max,
        m.latency_p95,
        m.jitter,
        m.packet_loss,
        m.dns_time,
        m.bufferbloat,
    ])
}

fn scan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<StoredMeasurement>> {
    let id: i64 = row.get(0)?;
    let timestamp: String = row.get(1)?;
    let probe_type: String = row.get(2)?;
    let target: String = row.get(3)?;
    let latency_min: Option<f64> = row.get(4)?;
    let latency_avg: Option<f64> = row.get(5)?;
    let latency_max: Option<f64> = row.get(6)?;
    let latency_p95: Option<f64> = row.get(7)?;
    let jitter: Option<f64> = row.get(8)?;
    let packet_loss: Option<f64> = row.get(9)?;
    let dns_time: Option<f64> = row.get(10)?;
    let bufferbloat: Option<f64> = row.get(11)?;
    let synced: i64 = row.get(12)?;

    Ok(build_stored(
        id,
        timestamp,
        probe_type,
        target,
        [
            latency_min,
            latency_avg,
            latency_max,
            latency_p95,
            jitter,
            packet_loss,
            dns_time,
            bufferbloat,
        ],
        synced != 0,
    ))
}

fn build_stored(
    id: i64,
    timestamp: String,
    probe_type: String,
    target: String,
    metrics: [Option<f64>; 8],
    synced: bool,
) -> Result<StoredMeasurement> {
    let timestamp = parse_timestamp(&timestamp)
        .with_context(|| format!("parsing stored timestamp {timestamp:?}"))?;
    let probe_type = ProbeType::parse(&probe_type)?;

    let [latency_min, latency_avg, latency_max, latency_p95, jitter, packet_loss, dns_time, bufferbloat] =
        metrics;

    Ok(StoredMeasurement {
        id,
        synced,
        measurement: Measurement {
            timestamp,
            probe_type,
            target,
            latency_min,
            latency_avg,
            latency_max,
            latency_p95,
            jitter,
            packet_loss,
            dns_time,
            bufferbloat,
        },
    })
}

/// Timestamps persist as RFC 3339 with nanoseconds, always UTC, so
/// lexicographic ordering in SQL matches chronological ordering.
pub(crate) fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
