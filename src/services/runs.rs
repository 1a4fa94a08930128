//! Run and checkpoint registry.
//!
//! Tracks the lifecycle of processing runs, guards checkpoint ordering, and
//! owns the only path by which progress may move backward: an explicit
//! force-restart.

use std::sync::Arc;

use crate::analysis::step_percent;
use crate::error::EngineError;
use crate::models::{Checkpoint, Run, RunStatus};
use crate::repository::RunRepository;
use crate::services::progress::ProgressSequencer;

/// Result of checking whether a run can be resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeValidation {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ResumeValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn invalid(reason: &str) -> Self {
        Self {
            valid: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Registry for runs and checkpoints.
pub struct RunRegistry {
    repo: RunRepository,
    progress: Arc<ProgressSequencer>,
    staleness: chrono::Duration,
}

impl RunRegistry {
    pub fn new(
        repo: RunRepository,
        progress: Arc<ProgressSequencer>,
        staleness: chrono::Duration,
    ) -> Self {
        Self {
            repo,
            progress,
            staleness,
        }
    }

    pub fn repo(&self) -> &RunRepository {
        &self.repo
    }

    pub fn get(&self, run_id: &str) -> Result<Option<Run>, EngineError> {
        Ok(self.repo.get(run_id)?)
    }

    /// Start a run for a document, or return the one already in flight.
    ///
    /// Submission is idempotent: an existing non-terminal run for the same
    /// document+user is returned unchanged unless `force_restart` is set.
    /// A force restart rewinds the existing run's progress baseline to the
    /// percentage of `restart_from_step` (or to the very beginning) and
    /// grants the sequencer its one-time regression.
    pub fn start_or_resume(
        &self,
        document_id: &str,
        user_id: &str,
        force_restart: bool,
        restart_from_step: Option<&str>,
    ) -> Result<Run, EngineError> {
        if let Some(existing) = self.repo.active_for(document_id, user_id)? {
            if !force_restart {
                tracing::info!(
                    run_id = %existing.run_id,
                    document_id,
                    "duplicate submission, returning active run"
                );
                return Ok(existing);
            }

            // Unrecognized steps rewind to the very beginning rather than
            // guessing.
            let baseline = restart_from_step.and_then(step_percent).unwrap_or(0);
            tracing::info!(
                run_id = %existing.run_id,
                baseline,
                step = restart_from_step.unwrap_or("start"),
                "force restart requested, rewinding progress baseline"
            );
            self.repo
                .rewind_progress(&existing.run_id, baseline, restart_from_step)?;
            self.progress.grant_regress(&existing.run_id);

            // Anchor the new baseline so later checkpoints are guarded
            // against it instead of the pre-restart high-water mark.
            let restart_name = format!(
                "restart_{}",
                self.repo.checkpoints(&existing.run_id)?.len()
            );
            self.record_checkpoint(
                &existing.run_id,
                &restart_name,
                baseline,
                serde_json::json!({"restart_from": restart_from_step}),
                true,
            )?;

            let run = self
                .repo
                .get(&existing.run_id)?
                .ok_or_else(|| EngineError::FatalConfig("run vanished during restart".into()))?;
            return Ok(run);
        }

        let run = Run::new(document_id, user_id);
        self.repo.create(&run)?;
        tracing::info!(run_id = %run.run_id, document_id, user_id, "run created");
        Ok(run)
    }

    /// Record a checkpoint.
    ///
    /// Rejected (logged no-op) when `progress_percent` is not strictly
    /// greater than the latest recorded checkpoint, unless `force` is set
    /// by the force-restart path. Returns whether the row was written.
    pub fn record_checkpoint(
        &self,
        run_id: &str,
        name: &str,
        progress_percent: u8,
        recoverable_data: serde_json::Value,
        force: bool,
    ) -> Result<bool, EngineError> {
        if !force {
            if let Some(latest) = self.repo.latest_checkpoint(run_id)? {
                if progress_percent <= latest.progress_percent {
                    tracing::warn!(
                        run_id,
                        name,
                        progress_percent,
                        latest = latest.progress_percent,
                        "checkpoint rejected: percent not strictly increasing"
                    );
                    return Ok(false);
                }
            }
        }

        let checkpoint = Checkpoint::new(run_id, name, progress_percent, recoverable_data);
        let inserted = self.repo.insert_checkpoint(&checkpoint)?;
        if !inserted {
            tracing::warn!(run_id, name, "checkpoint rejected: name already written");
            return Ok(false);
        }
        self.repo
            .set_checkpoint_data(run_id, &checkpoint.recoverable_data)?;
        self.repo.update_status(run_id, RunStatus::Checkpoint)?;
        Ok(true)
    }

    /// Runs that look abandoned: recoverable status and a heartbeat older
    /// than the staleness threshold, in recovery priority order.
    pub fn discover_orphaned(&self) -> Result<Vec<Run>, EngineError> {
        Ok(self.repo.discover_orphaned(self.staleness)?)
    }

    /// Atomically claim a discovered run for recovery.
    pub fn claim_for_recovery(&self, run_id: &str) -> Result<bool, EngineError> {
        Ok(self.repo.claim_for_recovery(run_id, self.staleness)?)
    }

    /// Check whether replaying a run is still worthwhile.
    ///
    /// Resume is invalid when a duplicate run for the same content address
    /// already completed, or when the run's latest checkpoint fails its
    /// integrity check.
    pub fn validate_resume(&self, run_id: &str) -> Result<ResumeValidation, EngineError> {
        let run = self
            .repo
            .get(run_id)?
            .ok_or_else(|| EngineError::Validation(format!("unknown run: {run_id}")))?;

        if run.status == RunStatus::Completed {
            return Ok(ResumeValidation::invalid("already_completed"));
        }
        if run.status.is_terminal() {
            return Ok(ResumeValidation::invalid("terminal"));
        }

        if let Some(content_hmac) = &run.content_hmac {
            if let Some(winner) = self.repo.completed_duplicate(content_hmac, run_id)? {
                tracing::info!(
                    run_id,
                    winner = %winner,
                    "resume unnecessary: duplicate run already completed"
                );
                return Ok(ResumeValidation::invalid("already_completed"));
            }
        }

        if let Some(checkpoint) = self.repo.latest_checkpoint(run_id)? {
            if !checkpoint.is_valid() {
                return Ok(ResumeValidation::invalid("checkpoint_corrupt"));
            }
        }

        Ok(ResumeValidation::ok())
    }

    /// Flag a run for cooperative cancellation. In-flight phase units finish;
    /// no further phases are dispatched.
    pub fn request_cancel(&self, run_id: &str) -> Result<(), EngineError> {
        self.repo.request_cancel(run_id)?;
        Ok(())
    }

    pub fn cancel_requested(&self, run_id: &str) -> Result<bool, EngineError> {
        Ok(self.repo.cancel_requested(run_id)?)
    }

    pub fn touch_heartbeat(&self, run_id: &str) -> Result<(), EngineError> {
        Ok(self.repo.touch_heartbeat(run_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry() -> (tempfile::TempDir, RunRegistry) {
        let dir = tempdir().unwrap();
        let repo = RunRepository::new(&dir.path().join("test.db")).unwrap();
        let progress = Arc::new(ProgressSequencer::new(repo.clone()));
        let registry = RunRegistry::new(repo, progress, chrono::Duration::seconds(300));
        (dir, registry)
    }

    #[test]
    fn test_idempotent_submission() {
        let (_dir, registry) = registry();
        let first = registry
            .start_or_resume("doc-1", "user-1", false, None)
            .unwrap();
        let second = registry
            .start_or_resume("doc-1", "user-1", false, None)
            .unwrap();
        assert_eq!(first.run_id, second.run_id);
    }

    #[test]
    fn test_distinct_users_get_distinct_runs() {
        let (_dir, registry) = registry();
        let a = registry
            .start_or_resume("doc-1", "user-a", false, None)
            .unwrap();
        let b = registry
            .start_or_resume("doc-1", "user-b", false, None)
            .unwrap();
        assert_ne!(a.run_id, b.run_id);
    }

    #[test]
    fn test_checkpoint_guard_strictly_increasing() {
        let (_dir, registry) = registry();
        let run = registry
            .start_or_resume("doc-1", "user-1", false, None)
            .unwrap();

        assert!(registry
            .record_checkpoint(&run.run_id, "address_derived", 5, serde_json::json!({}), false)
            .unwrap());
        assert!(registry
            .record_checkpoint(&run.run_id, "artifacts_resolved", 20, serde_json::json!({}), false)
            .unwrap());
        // Equal or lower percent is a logged no-op.
        assert!(!registry
            .record_checkpoint(&run.run_id, "stale", 20, serde_json::json!({}), false)
            .unwrap());
        assert!(!registry
            .record_checkpoint(&run.run_id, "staler", 4, serde_json::json!({}), false)
            .unwrap());
    }

    #[test]
    fn test_force_restart_rewinds_baseline() {
        let (_dir, registry) = registry();
        let run = registry
            .start_or_resume("doc-1", "user-1", false, None)
            .unwrap();
        registry
            .record_checkpoint(&run.run_id, "phase_conditions", 52, serde_json::json!({}), false)
            .unwrap();

        let rewound = registry
            .start_or_resume("doc-1", "user-1", true, Some("address_derived"))
            .unwrap();
        assert_eq!(rewound.run_id, run.run_id);
        assert_eq!(rewound.progress_percent, 5);
        assert_eq!(rewound.status, RunStatus::Checkpoint);

        // Checkpoints now guard against the restart baseline, not the
        // pre-restart high-water mark.
        assert!(registry
            .record_checkpoint(&run.run_id, "artifacts_resolved", 20, serde_json::json!({}), false)
            .unwrap());
    }

    #[test]
    fn test_force_restart_unknown_step_goes_to_start() {
        let (_dir, registry) = registry();
        let run = registry
            .start_or_resume("doc-1", "user-1", false, None)
            .unwrap();
        registry
            .record_checkpoint(&run.run_id, "phase_conditions", 52, serde_json::json!({}), false)
            .unwrap();

        let rewound = registry
            .start_or_resume("doc-1", "user-1", true, Some("not_a_step"))
            .unwrap();
        assert_eq!(rewound.progress_percent, 0);
    }

    #[test]
    fn test_validate_resume_detects_duplicate_winner() {
        let (_dir, registry) = registry();
        let winner = registry
            .start_or_resume("doc-a", "user-a", false, None)
            .unwrap();
        registry
            .repo()
            .set_content_hmac(&winner.run_id, "same-bytes")
            .unwrap();
        registry
            .repo()
            .update_status(&winner.run_id, RunStatus::Completed)
            .unwrap();

        let loser = registry
            .start_or_resume("doc-b", "user-b", false, None)
            .unwrap();
        registry
            .repo()
            .set_content_hmac(&loser.run_id, "same-bytes")
            .unwrap();

        let validation = registry.validate_resume(&loser.run_id).unwrap();
        assert!(!validation.valid);
        assert_eq!(validation.reason.as_deref(), Some("already_completed"));
    }

    #[test]
    fn test_validate_resume_ok_for_healthy_run() {
        let (_dir, registry) = registry();
        let run = registry
            .start_or_resume("doc-1", "user-1", false, None)
            .unwrap();
        registry
            .record_checkpoint(&run.run_id, "address_derived", 5, serde_json::json!({}), false)
            .unwrap();
        assert!(registry.validate_resume(&run.run_id).unwrap().valid);
    }
}
