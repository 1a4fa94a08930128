//! Run repository: run lifecycle rows, checkpoints, progress audit, and
//! orphan discovery.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::{parse_datetime, OptionalExt, Result};
use crate::models::{Checkpoint, Run, RunStatus};

/// One persisted progress emission, kept for reconnect replay and audit.
#[derive(Debug, Clone)]
pub struct ProgressRecord {
    pub run_id: String,
    pub document_id: String,
    pub step_key: String,
    pub percent: u8,
    pub description: String,
    /// Set when the emission came from the force-restart path.
    pub manual: bool,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed repository for runs and checkpoints.
#[derive(Clone)]
pub struct RunRepository {
    db_path: PathBuf,
}

impl RunRepository {
    /// Create a new run repository.
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        super::connect(&self.db_path)
    }

    /// Path to the backing database.
    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                current_step TEXT,
                content_hmac TEXT,
                checkpoint_data TEXT NOT NULL DEFAULT '{}',
                progress_percent INTEGER NOT NULL DEFAULT 0,
                heartbeat_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                recovery_priority INTEGER NOT NULL DEFAULT 0,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_document_user
                ON runs(document_id, user_id);
            CREATE INDEX IF NOT EXISTS idx_runs_status_heartbeat
                ON runs(status, heartbeat_at);

            -- Immutable snapshots. Superseded by later rows, never updated.
            CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                checkpoint_name TEXT NOT NULL,
                progress_percent INTEGER NOT NULL,
                recoverable_data TEXT NOT NULL DEFAULT '{}',
                validity_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(run_id, checkpoint_name)
            );

            -- Accepted progress emissions, for reconnect replay and audit.
            CREATE TABLE IF NOT EXISTS progress_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                step_key TEXT NOT NULL,
                percent INTEGER NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                manual INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_progress_run
                ON progress_events(run_id, id);
            "#,
        )?;
        Ok(())
    }

    /// Insert a new run row.
    pub fn create(&self, run: &Run) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO runs
                (run_id, document_id, user_id, status, current_step, content_hmac,
                 checkpoint_data, progress_percent, heartbeat_at, retry_count,
                 recovery_priority, cancel_requested, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                run.run_id,
                run.document_id,
                run.user_id,
                run.status.as_str(),
                run.current_step,
                run.content_hmac,
                run.checkpoint_data.to_string(),
                run.progress_percent,
                run.heartbeat_at.to_rfc3339(),
                run.retry_count,
                run.recovery_priority,
                run.cancel_requested as i32,
                run.error,
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get a run by ID.
    pub fn get(&self, run_id: &str) -> Result<Option<Run>> {
        let conn = self.connect()?;
        let run = conn
            .query_row(
                "SELECT * FROM runs WHERE run_id = ?",
                params![run_id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// The most recent non-terminal run for a document+user pair, if any.
    pub fn active_for(&self, document_id: &str, user_id: &str) -> Result<Option<Run>> {
        let conn = self.connect()?;
        let run = conn
            .query_row(
                r#"
                SELECT * FROM runs
                WHERE document_id = ? AND user_id = ?
                  AND status NOT IN ('completed', 'failed', 'cancelled', 'partial')
                ORDER BY created_at DESC
                LIMIT 1
                "#,
                params![document_id, user_id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Update status; terminal transitions also clear the cancel flag.
    pub fn update_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE runs SET status = ?, updated_at = ?, heartbeat_at = ? WHERE run_id = ?",
            params![status.as_str(), now, now, run_id],
        )?;
        Ok(())
    }

    /// Record the step the run has reached and mirror its percent.
    pub fn set_step(&self, run_id: &str, step: &str, percent: u8) -> Result<()> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            UPDATE runs
            SET current_step = ?, progress_percent = ?, updated_at = ?, heartbeat_at = ?
            WHERE run_id = ?
            "#,
            params![step, percent, now, now, run_id],
        )?;
        Ok(())
    }

    /// Rewind the progress baseline. Only the force-restart path calls this.
    pub fn rewind_progress(&self, run_id: &str, percent: u8, step: Option<&str>) -> Result<()> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            UPDATE runs
            SET progress_percent = ?, current_step = ?, status = 'queued',
                error = NULL, updated_at = ?, heartbeat_at = ?
            WHERE run_id = ?
            "#,
            params![percent, step, now, now, run_id],
        )?;
        Ok(())
    }

    /// Stamp the content address once derived.
    pub fn set_content_hmac(&self, run_id: &str, content_hmac: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE runs SET content_hmac = ?, updated_at = ? WHERE run_id = ?",
            params![content_hmac, Utc::now().to_rfc3339(), run_id],
        )?;
        Ok(())
    }

    /// Mirror the latest resumable snapshot onto the run row.
    pub fn set_checkpoint_data(&self, run_id: &str, data: &serde_json::Value) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE runs SET checkpoint_data = ?, updated_at = ? WHERE run_id = ?",
            params![data.to_string(), Utc::now().to_rfc3339(), run_id],
        )?;
        Ok(())
    }

    /// Refresh the heartbeat so the run is not discovered as orphaned.
    pub fn touch_heartbeat(&self, run_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE runs SET heartbeat_at = ? WHERE run_id = ?",
            params![Utc::now().to_rfc3339(), run_id],
        )?;
        Ok(())
    }

    pub fn increment_retry(&self, run_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE runs SET retry_count = retry_count + 1, updated_at = ? WHERE run_id = ?",
            params![Utc::now().to_rfc3339(), run_id],
        )?;
        Ok(())
    }

    pub fn set_error(&self, run_id: &str, error: Option<&str>) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE runs SET error = ?, updated_at = ? WHERE run_id = ?",
            params![error, Utc::now().to_rfc3339(), run_id],
        )?;
        Ok(())
    }

    /// Flag a run for cooperative cancellation.
    pub fn request_cancel(&self, run_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE runs SET cancel_requested = 1, updated_at = ? WHERE run_id = ?",
            params![Utc::now().to_rfc3339(), run_id],
        )?;
        Ok(())
    }

    pub fn cancel_requested(&self, run_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let flag: i32 = conn.query_row(
            "SELECT cancel_requested FROM runs WHERE run_id = ?",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(flag != 0)
    }

    /// Insert a checkpoint row. Returns false when a row with the same name
    /// already exists (checkpoints are immutable once written).
    pub fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<bool> {
        let conn = self.connect()?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO checkpoints
                (run_id, checkpoint_name, progress_percent, recoverable_data,
                 validity_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                checkpoint.run_id,
                checkpoint.checkpoint_name,
                checkpoint.progress_percent,
                checkpoint.recoverable_data.to_string(),
                checkpoint.validity_hash,
                checkpoint.created_at.to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// The most recently written checkpoint for a run.
    pub fn latest_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.connect()?;
        let checkpoint = conn
            .query_row(
                "SELECT * FROM checkpoints WHERE run_id = ? ORDER BY id DESC LIMIT 1",
                params![run_id],
                row_to_checkpoint,
            )
            .optional()?;
        Ok(checkpoint)
    }

    /// All checkpoints for a run, oldest first.
    pub fn checkpoints(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT * FROM checkpoints WHERE run_id = ? ORDER BY id ASC")?;
        let checkpoints = stmt
            .query_map(params![run_id], row_to_checkpoint)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(checkpoints)
    }

    /// Runs whose heartbeat is older than the staleness threshold, in
    /// recovery order.
    pub fn discover_orphaned(&self, staleness: chrono::Duration) -> Result<Vec<Run>> {
        let conn = self.connect()?;
        let cutoff = (Utc::now() - staleness).to_rfc3339();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM runs
            WHERE status IN ('processing', 'checkpoint', 'partial', 'orphaned')
              AND heartbeat_at < ?
            ORDER BY recovery_priority DESC, updated_at ASC
            "#,
        )?;
        let runs = stmt
            .query_map(params![cutoff], row_to_run)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Atomically claim an orphaned run for recovery.
    ///
    /// Returns false when another sweeper already claimed it or the run has
    /// moved on since discovery.
    pub fn claim_for_recovery(&self, run_id: &str, staleness: chrono::Duration) -> Result<bool> {
        let conn = self.connect()?;
        let now = Utc::now();
        let cutoff = (now - staleness).to_rfc3339();

        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<bool> = (|| {
            let claimed = conn.execute(
                r#"
                UPDATE runs
                SET status = 'recovering', heartbeat_at = ?, updated_at = ?
                WHERE run_id = ?
                  AND status IN ('processing', 'checkpoint', 'partial', 'orphaned')
                  AND heartbeat_at < ?
                "#,
                params![now.to_rfc3339(), now.to_rfc3339(), run_id, cutoff],
            )?;
            Ok(claimed > 0)
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }

        result
    }

    /// A completed run for the same content address, other than this one.
    /// Used by resume validation to spot work a duplicate run already did.
    pub fn completed_duplicate(
        &self,
        content_hmac: &str,
        exclude_run_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.connect()?;
        let run_id = conn
            .query_row(
                r#"
                SELECT run_id FROM runs
                WHERE content_hmac = ? AND run_id != ? AND status = 'completed'
                ORDER BY updated_at DESC
                LIMIT 1
                "#,
                params![content_hmac, exclude_run_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(run_id)
    }

    /// Persist an accepted progress emission.
    pub fn insert_progress(&self, record: &ProgressRecord) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO progress_events
                (run_id, document_id, step_key, percent, description, manual, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.run_id,
                record.document_id,
                record.step_key,
                record.percent,
                record.description,
                record.manual as i32,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The last accepted emission for a run, replayed to new subscribers.
    pub fn latest_progress(&self, run_id: &str) -> Result<Option<ProgressRecord>> {
        let conn = self.connect()?;
        let record = conn
            .query_row(
                "SELECT * FROM progress_events WHERE run_id = ? ORDER BY id DESC LIMIT 1",
                params![run_id],
                row_to_progress,
            )
            .optional()?;
        Ok(record)
    }

    /// Full audit trail of accepted emissions, oldest first.
    pub fn progress_history(&self, run_id: &str) -> Result<Vec<ProgressRecord>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT * FROM progress_events WHERE run_id = ? ORDER BY id ASC")?;
        let records = stmt
            .query_map(params![run_id], row_to_progress)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn row_to_run(row: &Row) -> std::result::Result<Run, rusqlite::Error> {
    let status_str: String = row.get("status")?;
    let status = RunStatus::from_str(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown run status: {status_str}").into(),
        )
    })?;
    let checkpoint_data: String = row.get("checkpoint_data")?;
    let heartbeat_at: String = row.get("heartbeat_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Run {
        run_id: row.get("run_id")?,
        document_id: row.get("document_id")?,
        user_id: row.get("user_id")?,
        status,
        current_step: row.get("current_step")?,
        content_hmac: row.get("content_hmac")?,
        checkpoint_data: serde_json::from_str(&checkpoint_data)
            .unwrap_or(serde_json::Value::Null),
        progress_percent: row.get("progress_percent")?,
        heartbeat_at: parse_datetime(&heartbeat_at),
        retry_count: row.get("retry_count")?,
        recovery_priority: row.get("recovery_priority")?,
        cancel_requested: row.get::<_, i32>("cancel_requested")? != 0,
        error: row.get("error")?,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn row_to_checkpoint(row: &Row) -> std::result::Result<Checkpoint, rusqlite::Error> {
    let recoverable_data: String = row.get("recoverable_data")?;
    let created_at: String = row.get("created_at")?;
    Ok(Checkpoint {
        run_id: row.get("run_id")?,
        checkpoint_name: row.get("checkpoint_name")?,
        progress_percent: row.get("progress_percent")?,
        recoverable_data: serde_json::from_str(&recoverable_data)
            .unwrap_or(serde_json::Value::Null),
        validity_hash: row.get("validity_hash")?,
        created_at: parse_datetime(&created_at),
    })
}

fn row_to_progress(row: &Row) -> std::result::Result<ProgressRecord, rusqlite::Error> {
    let created_at: String = row.get("created_at")?;
    Ok(ProgressRecord {
        run_id: row.get("run_id")?,
        document_id: row.get("document_id")?,
        step_key: row.get("step_key")?,
        percent: row.get("percent")?,
        description: row.get("description")?,
        manual: row.get::<_, i32>("manual")? != 0,
        created_at: parse_datetime(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn repo() -> (tempfile::TempDir, RunRepository) {
        let dir = tempdir().unwrap();
        let repo = RunRepository::new(&dir.path().join("test.db")).unwrap();
        (dir, repo)
    }

    fn stale(repo: &RunRepository, run_id: &str, age_secs: i64) {
        let conn = repo.connect().unwrap();
        let old = (Utc::now() - Duration::seconds(age_secs)).to_rfc3339();
        conn.execute(
            "UPDATE runs SET heartbeat_at = ? WHERE run_id = ?",
            params![old, run_id],
        )
        .unwrap();
    }

    #[test]
    fn test_create_and_get_round_trip() {
        let (_dir, repo) = repo();
        let run = Run::new("doc-1", "user-1");
        repo.create(&run).unwrap();
        let loaded = repo.get(&run.run_id).unwrap().unwrap();
        assert_eq!(loaded.document_id, "doc-1");
        assert_eq!(loaded.status, RunStatus::Queued);
        assert!(!loaded.cancel_requested);
    }

    #[test]
    fn test_active_for_skips_terminal() {
        let (_dir, repo) = repo();
        let run = Run::new("doc-1", "user-1");
        repo.create(&run).unwrap();
        assert!(repo.active_for("doc-1", "user-1").unwrap().is_some());

        repo.update_status(&run.run_id, RunStatus::Completed).unwrap();
        assert!(repo.active_for("doc-1", "user-1").unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_immutable_once_written() {
        let (_dir, repo) = repo();
        let run = Run::new("doc-1", "user-1");
        repo.create(&run).unwrap();

        let cp = Checkpoint::new(&run.run_id, "phase_foundation", 35, serde_json::json!({"a": 1}));
        assert!(repo.insert_checkpoint(&cp).unwrap());

        let dup = Checkpoint::new(&run.run_id, "phase_foundation", 99, serde_json::json!({"a": 2}));
        assert!(!repo.insert_checkpoint(&dup).unwrap());

        let stored = repo.latest_checkpoint(&run.run_id).unwrap().unwrap();
        assert_eq!(stored.progress_percent, 35);
        assert!(stored.is_valid());
    }

    #[test]
    fn test_discover_orphaned_ordering() {
        let (_dir, repo) = repo();
        let mut low = Run::new("doc-1", "user-1");
        low.status = RunStatus::Processing;
        let mut high = Run::new("doc-2", "user-1");
        high.status = RunStatus::Processing;
        high.recovery_priority = 5;
        repo.create(&low).unwrap();
        repo.create(&high).unwrap();
        stale(&repo, &low.run_id, 600);
        stale(&repo, &high.run_id, 600);

        // A fresh run must not be discovered.
        let mut fresh = Run::new("doc-3", "user-1");
        fresh.status = RunStatus::Processing;
        repo.create(&fresh).unwrap();

        let orphans = repo.discover_orphaned(Duration::seconds(300)).unwrap();
        assert_eq!(orphans.len(), 2);
        assert_eq!(orphans[0].run_id, high.run_id);
        assert_eq!(orphans[1].run_id, low.run_id);
    }

    #[test]
    fn test_claim_for_recovery_once() {
        let (_dir, repo) = repo();
        let mut run = Run::new("doc-1", "user-1");
        run.status = RunStatus::Processing;
        repo.create(&run).unwrap();
        stale(&repo, &run.run_id, 600);

        assert!(repo
            .claim_for_recovery(&run.run_id, Duration::seconds(300))
            .unwrap());
        // Second claim sees the refreshed heartbeat and recovering status.
        assert!(!repo
            .claim_for_recovery(&run.run_id, Duration::seconds(300))
            .unwrap());

        let claimed = repo.get(&run.run_id).unwrap().unwrap();
        assert_eq!(claimed.status, RunStatus::Recovering);
    }

    #[test]
    fn test_completed_duplicate_lookup() {
        let (_dir, repo) = repo();
        let mut first = Run::new("doc-1", "user-a");
        first.content_hmac = Some("abc".into());
        repo.create(&first).unwrap();
        repo.update_status(&first.run_id, RunStatus::Completed).unwrap();

        let mut second = Run::new("doc-2", "user-b");
        second.content_hmac = Some("abc".into());
        repo.create(&second).unwrap();

        let dup = repo.completed_duplicate("abc", &second.run_id).unwrap();
        assert_eq!(dup, Some(first.run_id.clone()));
        assert_eq!(repo.completed_duplicate("abc", &first.run_id).unwrap(), None);
    }

    #[test]
    fn test_progress_history_and_latest() {
        let (_dir, repo) = repo();
        let run = Run::new("doc-1", "user-1");
        repo.create(&run).unwrap();

        for (step, percent) in [("received", 2u8), ("address_derived", 5u8)] {
            repo.insert_progress(&ProgressRecord {
                run_id: run.run_id.clone(),
                document_id: run.document_id.clone(),
                step_key: step.into(),
                percent,
                description: String::new(),
                manual: false,
                created_at: Utc::now(),
            })
            .unwrap();
        }

        let latest = repo.latest_progress(&run.run_id).unwrap().unwrap();
        assert_eq!(latest.step_key, "address_derived");
        assert_eq!(latest.percent, 5);
        assert_eq!(repo.progress_history(&run.run_id).unwrap().len(), 2);
    }
}
