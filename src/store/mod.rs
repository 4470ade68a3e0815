// src/store/mod.rs
//
// The State Store (§4.1): the single durable source of
// truth for cases, GPU resources, and workflow steps. DELETE-mode
// journaling (avoids WAL's multi-file locking on shared HPC
// filesystems like Lustre/GPFS, since `state_db_path` is configurable
// and may sit on one), an atomic find-and-lock subquery for GPU
// assignment, and a migrate-then-create-tables startup sequence, built
// on rusqlite's synchronous API and opening a fresh `Connection` per
// call rather than holding one behind a mutex across awaits, since
// workers must each obtain a fresh store handle per §5's
// shared-resource policy.

mod schema;

use crate::model::{CasePriority, CaseStatus, GpuResource, GpuStatus, StepStatus, WorkflowStepRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a case already exists at path {0}")]
    DuplicatePath(String),
    #[error("not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// Opens (creating if needed) the SQLite-backed store at `db_path`
    /// and runs schema migration/creation once up front.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Self::connect(&db_path)?;
        schema::init(&conn).context("failed to initialize state store schema")?;
        Ok(Self { db_path })
    }

    fn connect(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open state store at {:?}", db_path))?;
        conn.busy_timeout(Duration::from_secs(10))?;
        // DELETE journal mode instead of WAL: WAL's extra `-wal`/`-shm`
        // files have locking problems on shared network filesystems
        // (Lustre/GPFS) that a deployment may point `state_db_path` at.
        conn.execute_batch(
            "
            PRAGMA journal_mode = DELETE;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        Ok(conn)
    }

    /// Every operation opens its own connection, so no handle is ever
    /// shared across an await point or across threads.
    fn conn(&self) -> Result<Connection> {
        Self::connect(&self.db_path).map_err(|e| StoreError::Unavailable(e.to_string()).into())
    }

    // ------------------------------------------------------------------
    // Case operations
    // ------------------------------------------------------------------

    pub fn add_case(&self, path: &str, priority: CasePriority) -> Result<i64> {
        let conn = self.conn()?;
        if self.get_case_by_path_conn(&conn, path)?.is_some() {
            return Err(StoreError::DuplicatePath(path.to_string()).into());
        }
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO cases
                (case_path, status, progress, priority, created_at, status_updated_at)
             VALUES (?1, 'submitted', 0, ?2, ?3, ?3)",
            rusqlite::params![path, priority.as_i64(), now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_case(&self, id: i64) -> Result<Option<Case>> {
        let conn = self.conn()?;
        self.get_case_by_id_conn(&conn, id)
    }

    pub fn get_case_by_path(&self, path: &str) -> Result<Option<Case>> {
        let conn = self.conn()?;
        self.get_case_by_path_conn(&conn, path)
    }

    fn get_case_by_id_conn(&self, conn: &Connection, id: i64) -> Result<Option<Case>> {
        conn.query_row("SELECT * FROM cases WHERE case_id = ?1", [id], row_to_case)
            .optional()
            .context("get_case failed")
    }

    fn get_case_by_path_conn(&self, conn: &Connection, path: &str) -> Result<Option<Case>> {
        conn.query_row(
            "SELECT * FROM cases WHERE case_path = ?1",
            [path],
            row_to_case,
        )
        .optional()
        .context("get_case_by_path failed")
    }

    pub fn list_cases_by_status(&self, status: CaseStatus, limit: Option<i64>) -> Result<Vec<Case>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM cases WHERE status = ?1
             ORDER BY priority DESC, created_at ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![status.as_str(), limit.unwrap_or(i64::MAX)],
            row_to_case,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn update_case_status(&self, id: i64, status: CaseStatus, progress: i64) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE cases SET status = ?1, progress = ?2, status_updated_at = ?3
             WHERE case_id = ?4",
            rusqlite::params![status.as_str(), progress, now, id],
        )?;
        Ok(())
    }

    /// `terminal_status` must be `Completed` or `Failed`. Preserves
    /// `gpu_group` and `remote_task_id` — it touches only status,
    /// progress, and the two completion timestamps (§8 "Historical
    /// preservation" property).
    pub fn update_case_completion(&self, id: i64, terminal_status: CaseStatus) -> Result<()> {
        anyhow::ensure!(
            terminal_status.is_terminal(),
            "update_case_completion requires a terminal status, got {terminal_status}"
        );
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE cases SET status = ?1, progress = 100, completed_at = ?2, status_updated_at = ?2
             WHERE case_id = ?3",
            rusqlite::params![terminal_status.as_str(), now, id],
        )?;
        Ok(())
    }

    pub fn set_case_error(&self, id: i64, message: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE cases SET final_error = ?1 WHERE case_id = ?2",
            rusqlite::params![message, id],
        )?;
        Ok(())
    }

    pub fn set_case_remote_task_id(&self, id: i64, remote_task_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE cases SET remote_task_id = ?1 WHERE case_id = ?2",
            rusqlite::params![remote_task_id, id],
        )?;
        Ok(())
    }

    pub fn set_case_gpu_group(&self, id: i64, gpu_group: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE cases SET gpu_group = ?1 WHERE case_id = ?2",
            rusqlite::params![gpu_group, id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // GPU resource operations
    // ------------------------------------------------------------------

    /// The atomic cornerstone of the resource-locking invariant
    /// (§4.1). Runs inside `BEGIN IMMEDIATE` so the write lock is taken
    /// up front, preventing the classic upgrade-deadlock where two
    /// readers both try to promote to a writer at once.
    pub fn find_and_lock_any_available_gpu(&self, case_id: i64) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .context("failed to begin immediate transaction")?;

        let changed = tx.execute(
            "UPDATE gpu_resources
             SET status = 'assigned', assigned_case_id = ?1, last_updated = ?2
             WHERE group_name = (
                 SELECT group_name FROM gpu_resources
                 WHERE status = 'available'
                 ORDER BY group_name
                 LIMIT 1
             )",
            rusqlite::params![case_id, Utc::now().to_rfc3339()],
        )?;

        let locked = if changed > 0 {
            tx.query_row(
                "SELECT group_name FROM gpu_resources WHERE assigned_case_id = ?1",
                [case_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        } else {
            None
        };

        tx.commit()?;
        Ok(locked)
    }

    /// Atomically locks a *specific* group for `case_id` if it is still
    /// `available` (§4.7 "ChooseOptimal" hands the Supervisor Loop a
    /// preferred group; this turns that preference into a lock without
    /// losing the exclusivity guarantee `find_and_lock_any_available_gpu`
    /// provides — another dispatch racing for the same group loses the
    /// `UPDATE` and gets back `false`, not a double-assignment).
    pub fn try_lock_gpu(&self, case_id: i64, group: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .context("failed to begin immediate transaction")?;

        let changed = tx.execute(
            "UPDATE gpu_resources
             SET status = 'assigned', assigned_case_id = ?1, last_updated = ?2
             WHERE group_name = ?3 AND status = 'available'",
            rusqlite::params![case_id, Utc::now().to_rfc3339(), group],
        )?;

        tx.commit()?;
        Ok(changed > 0)
    }

    /// Idempotent: releasing a case with no assigned GPU is a no-op.
    pub fn release_gpu(&self, case_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE gpu_resources
             SET status = 'available', assigned_case_id = NULL, last_updated = ?1
             WHERE assigned_case_id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), case_id],
        )?;
        Ok(())
    }

    pub fn set_gpu_status(&self, group: &str, status: GpuStatus, case_id: Option<i64>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE gpu_resources SET status = ?1, assigned_case_id = ?2, last_updated = ?3
             WHERE group_name = ?4",
            rusqlite::params![status.as_str(), case_id, Utc::now().to_rfc3339(), group],
        )?;
        Ok(())
    }

    pub fn ensure_gpu_exists(&self, group: &str) -> Result<()> {
        let conn = self.conn()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM gpu_resources WHERE group_name = ?1",
                [group],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            conn.execute(
                "INSERT INTO gpu_resources (group_name, status, last_updated)
                 VALUES (?1, 'available', ?2)",
                rusqlite::params![group, Utc::now().to_rfc3339()],
            )?;
        }
        Ok(())
    }

    pub fn get_gpu(&self, group: &str) -> Result<Option<GpuResource>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM gpu_resources WHERE group_name = ?1",
            [group],
            row_to_gpu,
        )
        .optional()
        .context("get_gpu failed")
    }

    pub fn get_gpu_by_case(&self, case_id: i64) -> Result<Option<GpuResource>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM gpu_resources WHERE assigned_case_id = ?1",
            [case_id],
            row_to_gpu,
        )
        .optional()
        .context("get_gpu_by_case failed")
    }

    pub fn list_gpu_resources(&self) -> Result<Vec<GpuResource>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM gpu_resources ORDER BY group_name")?;
        let rows = stmt.query_map([], row_to_gpu)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_gpu_resources_by_status(&self, status: GpuStatus) -> Result<Vec<GpuResource>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM gpu_resources WHERE status = ?1 ORDER BY group_name")?;
        let rows = stmt.query_map([status.as_str()], row_to_gpu)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Workflow step operations
    // ------------------------------------------------------------------

    pub fn record_workflow_step(
        &self,
        case_id: i64,
        step_name: &str,
        status: StepStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let completed_at = if status == StepStatus::Started {
            None
        } else {
            Some(now.clone())
        };
        conn.execute(
            "INSERT INTO workflow_steps (case_id, step_name, status, started_at, completed_at, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(case_id, step_name) DO UPDATE SET
                status = excluded.status,
                completed_at = excluded.completed_at,
                error_message = excluded.error_message",
            rusqlite::params![case_id, step_name, status.as_str(), now, completed_at, error],
        )?;
        Ok(())
    }

    pub fn list_workflow_steps(&self, case_id: i64) -> Result<Vec<WorkflowStepRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT case_id, step_name, status, started_at, completed_at, error_message
             FROM workflow_steps WHERE case_id = ?1 ORDER BY started_at ASC",
        )?;
        let rows = stmt.query_map([case_id], row_to_step)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

pub use crate::model::Case;

fn row_to_case(row: &rusqlite::Row) -> rusqlite::Result<Case> {
    let status: String = row.get("status")?;
    let priority: i64 = row.get("priority")?;
    let created_at: String = row.get("created_at")?;
    let status_updated_at: String = row.get("status_updated_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;

    Ok(Case {
        id: row.get("case_id")?,
        path: row.get("case_path")?,
        status: status.parse().unwrap_or(CaseStatus::Submitted),
        progress: row.get("progress")?,
        priority: CasePriority::from_i64(priority),
        gpu_group: row.get("gpu_group")?,
        remote_task_id: row.get("remote_task_id")?,
        created_at: parse_ts(&created_at),
        status_updated_at: parse_ts(&status_updated_at),
        completed_at: completed_at.map(|s| parse_ts(&s)),
        final_error: row.get("final_error")?,
    })
}

fn row_to_gpu(row: &rusqlite::Row) -> rusqlite::Result<GpuResource> {
    let status: String = row.get("status")?;
    let last_updated: String = row.get("last_updated")?;
    Ok(GpuResource {
        group_name: row.get("group_name")?,
        status: status.parse().unwrap_or(GpuStatus::Available),
        assigned_case_id: row.get("assigned_case_id")?,
        last_updated: parse_ts(&last_updated),
    })
}

fn row_to_step(row: &rusqlite::Row) -> rusqlite::Result<WorkflowStepRecord> {
    let status: String = row.get("status")?;
    let started_at: String = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    Ok(WorkflowStepRecord {
        case_id: row.get("case_id")?,
        step_name: row.get("step_name")?,
        status: status.parse().unwrap_or(StepStatus::Started),
        started_at: parse_ts(&started_at),
        completed_at: completed_at.map(|s| parse_ts(&s)),
        error_message: row.get("error_message")?,
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
