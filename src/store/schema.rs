// src/store/schema.rs
//
// Table creation, index creation, and backward-compatible column
// migration: inspect `PRAGMA table_info`, `ALTER TABLE ADD COLUMN`
// anything missing, then backfill the new column from whatever legacy
// column/value makes sense.

use anyhow::Result;
use chrono::Utc;
use rusqlite::Connection;

pub fn init(conn: &Connection) -> Result<()> {
    migrate_legacy_columns(conn)?;
    create_tables(conn)?;
    create_indexes(conn)?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cases (
            case_id INTEGER PRIMARY KEY AUTOINCREMENT,
            case_path TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL,
            priority INTEGER NOT NULL DEFAULT 2,
            gpu_group TEXT,
            remote_task_id INTEGER,
            created_at TEXT NOT NULL,
            status_updated_at TEXT NOT NULL,
            completed_at TEXT,
            final_error TEXT
        );

        CREATE TABLE IF NOT EXISTS gpu_resources (
            group_name TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            assigned_case_id INTEGER,
            last_updated TEXT NOT NULL,
            FOREIGN KEY (assigned_case_id) REFERENCES cases (case_id)
        );

        CREATE TABLE IF NOT EXISTS workflow_steps (
            case_id INTEGER NOT NULL,
            step_name TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            error_message TEXT,
            PRIMARY KEY (case_id, step_name),
            FOREIGN KEY (case_id) REFERENCES cases (case_id)
        );
        ",
    )?;
    Ok(())
}

fn create_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_cases_status_priority
            ON cases (status, priority DESC, created_at ASC);
        CREATE INDEX IF NOT EXISTS idx_cases_status_updated
            ON cases (status, status_updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_gpu_resources_status
            ON gpu_resources (status);
        ",
    )?;
    Ok(())
}

/// Adds columns introduced after the schema's first release,
/// back-filling them so older databases keep working (§4.1 Schema
/// evolution). A no-op on a fresh database, since `create_tables` above
/// already creates these columns directly.
fn migrate_legacy_columns(conn: &Connection) -> Result<()> {
    if table_exists(conn, "cases")? {
        let columns = table_columns(conn, "cases")?;
        let now = Utc::now().to_rfc3339();

        if !columns.iter().any(|c| c == "priority") {
            conn.execute("ALTER TABLE cases ADD COLUMN priority INTEGER DEFAULT 2", [])?;
        }
        if !columns.iter().any(|c| c == "created_at") {
            conn.execute("ALTER TABLE cases ADD COLUMN created_at TEXT", [])?;
            conn.execute(
                "UPDATE cases SET created_at = COALESCE(submitted_at, ?1) WHERE created_at IS NULL",
                [&now],
            )
            .ok();
        }
    }

    if table_exists(conn, "gpu_resources")? {
        let columns = table_columns(conn, "gpu_resources")?;
        let now = Utc::now().to_rfc3339();

        if !columns.iter().any(|c| c == "last_updated") {
            conn.execute("ALTER TABLE gpu_resources ADD COLUMN last_updated TEXT", [])?;
            conn.execute(
                "UPDATE gpu_resources SET last_updated = ?1 WHERE last_updated IS NULL",
                [&now],
            )?;
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
