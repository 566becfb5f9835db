use crate::engine::RunSummary;
use crate::paths::AppPaths;
use crate::Result;
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub sources_checked: i64,
    pub sources_unreachable: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
    pub pending: i64,
    pub total_bytes: i64,
    pub retention_deleted: i64,
    pub canceled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub run_id: String,
    pub finished_at_ms: i64,
    pub source_id: String,
    pub item_id: String,
    pub error: Option<String>,
}

/// SQLite journal of past cycles and their per-item attempts.
#[derive(Debug)]
pub struct History {
    conn: Connection,
}

impl History {
    pub fn open(paths: &AppPaths) -> Result<Self> {
        paths.ensure_dirs()?;
        Self::open_at(&paths.history_db_path())
    }

    pub fn open_at(db_path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )?;

        conn.busy_timeout(Duration::from_secs(10))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;

        Ok(Self { conn })
    }

    pub fn record_run(&self, summary: &RunSummary) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            r#"
INSERT INTO run (
  id, started_at_ms, finished_at_ms, sources_checked, sources_unreachable,
  succeeded, failed, skipped, pending, total_bytes, retention_deleted, canceled
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
"#,
            params![
                summary.run_id,
                summary.started_at_ms,
                summary.finished_at_ms,
                summary.sources_checked as i64,
                summary.sources_unreachable as i64,
                summary.succeeded as i64,
                summary.failed as i64,
                summary.skipped as i64,
                summary.pending as i64,
                summary.total_bytes as i64,
                summary.retention_deleted as i64,
                summary.canceled,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                r#"
INSERT INTO attempt (run_id, source_id, item_id, state, error, file_path, elapsed_ms)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
"#,
            )?;
            for outcome in &summary.outcomes {
                stmt.execute(params![
                    summary.run_id,
                    outcome.source_id,
                    outcome.item_id,
                    outcome.state.as_str(),
                    outcome.error,
                    outcome.file.as_ref().map(|p| p.to_string_lossy().to_string()),
                    outcome.elapsed.as_millis() as i64,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Newest first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
SELECT id, started_at_ms, finished_at_ms, sources_checked, sources_unreachable,
       succeeded, failed, skipped, pending, total_bytes, retention_deleted, canceled
FROM run
ORDER BY started_at_ms DESC, rowid DESC
LIMIT ?1
"#,
        )?;

        let runs = stmt
            .query_map(params![limit as i64], |row| {
                Ok(RunRecord {
                    id: row.get(0)?,
                    started_at_ms: row.get(1)?,
                    finished_at_ms: row.get(2)?,
                    sources_checked: row.get(3)?,
                    sources_unreachable: row.get(4)?,
                    succeeded: row.get(5)?,
                    failed: row.get(6)?,
                    skipped: row.get(7)?,
                    pending: row.get(8)?,
                    total_bytes: row.get(9)?,
                    retention_deleted: row.get(10)?,
                    canceled: row.get(11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(runs)
    }

    pub fn recent_failures(&self, limit: usize) -> Result<Vec<FailureRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
SELECT a.run_id, r.finished_at_ms, a.source_id, a.item_id, a.error
FROM attempt a
JOIN run r ON r.id = a.run_id
WHERE a.state = 'failed'
ORDER BY r.finished_at_ms DESC, a.id DESC
LIMIT ?1
"#,
        )?;

        let failures = stmt
            .query_map(params![limit as i64], |row| {
                Ok(FailureRecord {
                    run_id: row.get(0)?,
                    finished_at_ms: row.get(1)?,
                    source_id: row.get(2)?,
                    item_id: row.get(3)?,
                    error: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(failures)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS run (
  id TEXT PRIMARY KEY,
  started_at_ms INTEGER NOT NULL,
  finished_at_ms INTEGER NOT NULL,
  sources_checked INTEGER NOT NULL,
  sources_unreachable INTEGER NOT NULL,
  succeeded INTEGER NOT NULL,
  failed INTEGER NOT NULL,
  skipped INTEGER NOT NULL,
  pending INTEGER NOT NULL,
  total_bytes INTEGER NOT NULL,
  retention_deleted INTEGER NOT NULL,
  canceled INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS attempt (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  source_id TEXT NOT NULL,
  item_id TEXT NOT NULL,
  state TEXT NOT NULL,
  error TEXT,
  file_path TEXT,
  elapsed_ms INTEGER NOT NULL,
  FOREIGN KEY (run_id) REFERENCES run(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_attempt_run_id ON attempt(run_id);
CREATE INDEX IF NOT EXISTS idx_run_started_at_ms ON run(started_at_ms);
"#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{DownloadOutcome, DownloadState, Item};

    fn summary(started_at_ms: i64, outcomes: Vec<DownloadOutcome>) -> RunSummary {
        RunSummary {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at_ms,
            finished_at_ms: started_at_ms + 10,
            sources_checked: 1,
            succeeded: outcomes
                .iter()
                .filter(|o| o.state == DownloadState::Succeeded)
                .count(),
            failed: outcomes
                .iter()
                .filter(|o| matches!(o.state, DownloadState::Failed(_)))
                .count(),
            outcomes,
            ..RunSummary::default()
        }
    }

    #[test]
    fn runs_and_failures_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let history = History::open(&paths).expect("open");

        let ok = DownloadOutcome::new(&Item::pending("@s", "a"), DownloadState::Succeeded);
        let bad = DownloadOutcome::new(
            &Item::pending("@s", "b"),
            DownloadState::Failed("ERROR: Video unavailable".to_string()),
        );
        history.record_run(&summary(1_000, vec![ok])).expect("record first");
        history.record_run(&summary(2_000, vec![bad])).expect("record second");

        let runs = history.recent_runs(10).expect("runs");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].started_at_ms, 2_000);
        assert_eq!(runs[0].failed, 1);
        assert_eq!(runs[1].succeeded, 1);
        assert!(!runs[0].canceled);

        let failures = history.recent_failures(10).expect("failures");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].item_id, "b");
        assert_eq!(failures[0].error.as_deref(), Some("ERROR: Video unavailable"));

        assert_eq!(history.recent_runs(1).expect("limited").len(), 1);
    }

    #[test]
    fn reopening_keeps_existing_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        {
            let history = History::open(&paths).expect("open");
            history.record_run(&summary(5, Vec::new())).expect("record");
        }
        let history = History::open(&paths).expect("reopen");
        assert_eq!(history.recent_runs(10).expect("runs").len(), 1);
    }
}
