use crate::catalogue::{now_ms, NodeId};
use crate::db::{self, OptionalRowExt};
use crate::operation::{CommitStatus, OperationKind, OperationSummary};
use crate::paths::AppPaths;
use crate::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_CANCELLED: &str = "cancelled";
pub const STATUS_COMMIT_FAILED: &str = "commit_failed";
pub const STATUS_INTERRUPTED: &str = "interrupted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub targets_json: String,
    pub options_json: Option<String>,
    pub created_at_ms: i64,
    pub finished_at_ms: Option<i64>,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
    pub stopped_early: i64,
    pub cancelled: i64,
    pub commit_status: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResultRecord {
    pub job_id: String,
    pub operation_id: String,
    pub node_id: Option<NodeId>,
    pub url: Option<String>,
    pub mode: String,
    pub state: String,
    pub attempts: u32,
    pub failure_kind: Option<String>,
    pub message: Option<String>,
    pub finished_at_ms: i64,
}

/// Operation and job outcomes, kept in SQLite next to the catalogue.
pub struct History {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for History {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("History").finish_non_exhaustive()
    }
}

const OPERATION_COLUMNS: &str = "id, kind, status, targets_json, options_json, created_at_ms, finished_at_ms, \
succeeded, failed, skipped, stopped_early, cancelled, commit_status, error";

fn operation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OperationRecord> {
    Ok(OperationRecord {
        id: row.get(0)?,
        kind: row.get(1)?,
        status: row.get(2)?,
        targets_json: row.get(3)?,
        options_json: row.get(4)?,
        created_at_ms: row.get(5)?,
        finished_at_ms: row.get(6)?,
        succeeded: row.get(7)?,
        failed: row.get(8)?,
        skipped: row.get(9)?,
        stopped_early: row.get(10)?,
        cancelled: row.get(11)?,
        commit_status: row.get(12)?,
        error: row.get(13)?,
    })
}

impl History {
    pub fn open(paths: &AppPaths) -> Result<Self> {
        let conn = db::open(paths)?;
        db::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs still marked running belong to a process that died.
    pub fn mark_interrupted_runs(&self) -> Result<usize> {
        let updated = self.conn().execute(
            "UPDATE operation_run SET status=?1, finished_at_ms=?2 WHERE status=?3",
            params![STATUS_INTERRUPTED, now_ms(), STATUS_RUNNING],
        )?;
        Ok(updated)
    }

    pub fn record_started(
        &self,
        id: &str,
        kind: OperationKind,
        targets_json: &str,
        options_json: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            r#"
INSERT INTO operation_run (id, kind, status, targets_json, options_json, created_at_ms)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
            params![id, kind.as_str(), STATUS_RUNNING, targets_json, options_json, now_ms()],
        )?;
        Ok(())
    }

    pub fn record_job(&self, record: &JobResultRecord) -> Result<()> {
        self.conn().execute(
            r#"
INSERT INTO job_result (
  job_id, operation_id, node_id, url, mode, state, attempts, failure_kind, message, finished_at_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
ON CONFLICT(job_id) DO UPDATE SET
  state=excluded.state,
  attempts=excluded.attempts,
  failure_kind=excluded.failure_kind,
  message=excluded.message,
  finished_at_ms=excluded.finished_at_ms
"#,
            params![
                record.job_id,
                record.operation_id,
                record.node_id.map(|id| id as i64),
                record.url,
                record.mode,
                record.state,
                record.attempts,
                record.failure_kind,
                record.message,
                record.finished_at_ms
            ],
        )?;
        Ok(())
    }

    pub fn record_finished(&self, summary: &OperationSummary) -> Result<()> {
        let (status, error) = match &summary.commit {
            CommitStatus::Failed { reason } => (STATUS_COMMIT_FAILED, Some(reason.clone())),
            _ if summary.cancelled => (STATUS_CANCELLED, None),
            _ => (STATUS_COMPLETED, None),
        };
        let counts = &summary.counts;
        self.conn().execute(
            r#"
UPDATE operation_run SET
  status=?1, finished_at_ms=?2, succeeded=?3, failed=?4, skipped=?5,
  stopped_early=?6, cancelled=?7, commit_status=?8, error=?9
WHERE id=?10
"#,
            params![
                status,
                summary.finished_at_ms,
                counts.succeeded,
                counts.failed,
                counts.skipped,
                counts.stopped_early,
                counts.cancelled,
                summary.commit.as_str(),
                error,
                summary.operation_id
            ],
        )?;
        Ok(())
    }

    /// A retried commit succeeded after the run had been recorded as failed.
    pub fn mark_committed(&self, ids: &[String]) -> Result<()> {
        let conn = self.conn();
        for id in ids {
            conn.execute(
                "UPDATE operation_run SET status=?1, commit_status=?2, error=NULL WHERE id=?3 AND status=?4",
                params![STATUS_COMPLETED, "committed", id, STATUS_COMMIT_FAILED],
            )?;
        }
        Ok(())
    }

    pub fn list_operations(&self, limit: usize, offset: usize) -> Result<Vec<OperationRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operation_run ORDER BY created_at_ms DESC, rowid DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], operation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {OPERATION_COLUMNS} FROM operation_run WHERE id=?1"),
                params![id],
                operation_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_job_results(&self, operation_id: &str) -> Result<Vec<JobResultRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
SELECT job_id, operation_id, node_id, url, mode, state, attempts, failure_kind, message, finished_at_ms
FROM job_result
WHERE operation_id=?1
ORDER BY finished_at_ms ASC, rowid ASC
"#,
        )?;
        let rows = stmt
            .query_map(params![operation_id], |row| {
                let node_id: Option<i64> = row.get(2)?;
                Ok(JobResultRecord {
                    job_id: row.get(0)?,
                    operation_id: row.get(1)?,
                    node_id: node_id.map(|id| id as NodeId),
                    url: row.get(3)?,
                    mode: row.get(4)?,
                    state: row.get(5)?,
                    attempts: row.get(6)?,
                    failure_kind: row.get(7)?,
                    message: row.get(8)?,
                    finished_at_ms: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Keeps the newest `keep` runs; job rows go with their run.
    pub fn prune(&self, keep: usize) -> Result<usize> {
        let removed = self.conn().execute(
            r#"
DELETE FROM operation_run
WHERE id NOT IN (
  SELECT id FROM operation_run ORDER BY created_at_ms DESC, rowid DESC LIMIT ?1
)
"#,
            params![keep as i64],
        )?;
        Ok(removed)
    }
}
