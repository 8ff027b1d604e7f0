use anyhow::{Context, Result};
use rusqlite::{params, Connection};

pub(crate) const SCHEMA_VERSION: u32 = 1;

/// Idempotent schema statements, applied in order inside a single
/// transaction on every open.
static STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version    INTEGER PRIMARY KEY,
        applied_at TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE TABLE IF NOT EXISTS measurements (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp   TEXT NOT NULL,
        probe_type  TEXT NOT NULL,
        target      TEXT NOT NULL,
        latency_min REAL,
        latency_avg REAL,
        latency_max REAL,
        latency_p95 REAL,
        jitter      REAL,
        packet_loss REAL,
        dns_time    REAL,
        bufferbloat REAL,
        synced      INTEGER NOT NULL DEFAULT 0,
        created_at  TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_measurements_synced ON measurements(synced, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_measurements_timestamp ON measurements(timestamp)",
];

/// Applies all schema statements and upserts the version row.
pub(crate) fn apply(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction().context("beginning migration transaction")?;

    for stmt in STATEMENTS {
        tx.execute(stmt, [])
            .with_context(|| format!("executing migration statement: {}", statement_preview(stmt)))?;
    }

    let current: u32 = tx
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .context("querying schema version")?;

    if current < SCHEMA_VERSION {
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )
        .context("recording schema version")?;
    }

    tx.commit().context("committing migration transaction")
}

fn statement_preview(stmt: &str) -> String {
    stmt.split_whitespace().take(6).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_is_idempotent() {
        let mut conn = Connection::open_in_memory().expect("open");
        apply(&mut conn).expect("first apply");
        apply(&mut conn).expect("second apply");

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .expect("version query");
        assert_eq!(version, SCHEMA_VERSION);

        // Re-applying must not duplicate the version row.
        let rows: u32 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .expect("count query");
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_schema_has_expected_shape() {
        let mut conn = Connection::open_in_memory().expect("open");
        apply(&mut conn).expect("apply");

        let indexed: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'index' AND name LIKE 'idx_measurements_%'",
                [],
                |row| row.get(0),
            )
            .expect("index query");
        assert_eq!(indexed, 2);

        // synced defaults to 0 so fresh inserts are always unsynced.
        conn.execute(
            "INSERT INTO measurements (timestamp, probe_type, target)
             VALUES ('2024-01-01T00:00:00Z', 'ping', '1.1.1.1')",
            [],
        )
        .expect("insert");

        let synced: i64 = conn
            .query_row("SELECT synced FROM measurements", [], |row| row.get(0))
            .expect("synced query");
        assert_eq!(synced, 0);
    }
}
