use crate::paths::AppPaths;
use crate::Result;
use rusqlite::{Connection, OpenFlags};
use std::time::Duration;

const SCHEMA_VERSION: i64 = 2;

pub fn open(paths: &AppPaths) -> Result<Connection> {
    std::fs::create_dir_all(paths.db_dir())?;

    let conn = Connection::open_with_flags(
        paths.history_db_path(),
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    )?;

    conn.busy_timeout(Duration::from_secs(10))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS operation_run (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  status TEXT NOT NULL,
  targets_json TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  finished_at_ms INTEGER,
  succeeded INTEGER NOT NULL DEFAULT 0,
  failed INTEGER NOT NULL DEFAULT 0,
  skipped INTEGER NOT NULL DEFAULT 0,
  stopped_early INTEGER NOT NULL DEFAULT 0,
  cancelled INTEGER NOT NULL DEFAULT 0,
  commit_status TEXT,
  error TEXT
);

CREATE TABLE IF NOT EXISTS job_result (
  job_id TEXT PRIMARY KEY,
  operation_id TEXT NOT NULL,
  node_id INTEGER,
  url TEXT,
  mode TEXT NOT NULL,
  state TEXT NOT NULL,
  attempts INTEGER NOT NULL,
  failure_kind TEXT,
  message TEXT,
  finished_at_ms INTEGER NOT NULL,
  FOREIGN KEY (operation_id) REFERENCES operation_run(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_operation_run_created ON operation_run(created_at_ms);
CREATE INDEX IF NOT EXISTS idx_job_result_operation ON job_result(operation_id);
"#,
    )?;

    // Version 1 files predate the per-operation options override.
    if !has_column(conn, "operation_run", "options_json")? {
        conn.execute("ALTER TABLE operation_run ADD COLUMN options_json TEXT", [])?;
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(v) if v == SCHEMA_VERSION.to_string() => {}
        _ => {
            conn.execute(
                "INSERT INTO meta(key, value) VALUES('schema_version', ?)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                [SCHEMA_VERSION.to_string()],
            )?;
        }
    }

    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(crate) trait OptionalRowExt<T> {
    fn optional(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalRowExt<T> for rusqlite::Result<T> {
    fn optional(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_adds_options_column_for_version_one_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.db_dir()).expect("db dir");

        {
            let conn = Connection::open(paths.history_db_path()).expect("open");
            conn.execute_batch(
                r#"
CREATE TABLE operation_run (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  status TEXT NOT NULL,
  targets_json TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  finished_at_ms INTEGER,
  succeeded INTEGER NOT NULL DEFAULT 0,
  failed INTEGER NOT NULL DEFAULT 0,
  skipped INTEGER NOT NULL DEFAULT 0,
  stopped_early INTEGER NOT NULL DEFAULT 0,
  cancelled INTEGER NOT NULL DEFAULT 0,
  commit_status TEXT,
  error TEXT
);
"#,
            )
            .expect("create version one table");
        }

        let conn = open(&paths).expect("open migrated");
        migrate(&conn).expect("migrate");
        assert!(has_column(&conn, "operation_run", "options_json").expect("table_info"));

        let version: String = conn
            .query_row("SELECT value FROM meta WHERE key='schema_version'", [], |row| row.get(0))
            .expect("schema version");
        assert_eq!(version, SCHEMA_VERSION.to_string());

        // Running it again is a no-op.
        migrate(&conn).expect("migrate again");
    }
}
