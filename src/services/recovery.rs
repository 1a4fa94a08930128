//! Orphaned-run recovery sweep.
//!
//! A periodic sweep discovers runs whose heartbeat went stale, claims each
//! one (the claim is atomic, so two sweepers never recover the same run),
//! and hands claimed runs to a resumer for replay from the last valid
//! checkpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::models::{Run, RunStatus};
use crate::services::runs::RunRegistry;

/// Replays a claimed run. Implemented by the processing pipeline.
#[async_trait]
pub trait RunResumer: Send + Sync {
    async fn resume(&self, run: Run) -> Result<(), EngineError>;
}

/// Periodic sweep over abandoned runs.
pub struct RecoverySweeper {
    registry: Arc<RunRegistry>,
    interval: Duration,
}

impl RecoverySweeper {
    pub fn new(registry: Arc<RunRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// One sweep: discover, validate, claim. Returns the claimed runs.
    ///
    /// Runs whose output a duplicate already completed are finalized here
    /// instead of being replayed.
    pub fn sweep_once(&self) -> Result<Vec<Run>, EngineError> {
        let orphans = self.registry.discover_orphaned()?;
        let mut claimed = Vec::new();

        for run in orphans {
            let validation = self.registry.validate_resume(&run.run_id)?;
            if !validation.valid {
                if validation.reason.as_deref() == Some("already_completed") {
                    tracing::info!(
                        run_id = %run.run_id,
                        "orphan superseded by completed duplicate, finalizing"
                    );
                    self.registry
                        .repo()
                        .update_status(&run.run_id, RunStatus::Completed)?;
                } else {
                    tracing::warn!(
                        run_id = %run.run_id,
                        reason = validation.reason.as_deref().unwrap_or("unknown"),
                        "orphan not resumable"
                    );
                    self.registry.repo().set_error(
                        &run.run_id,
                        validation.reason.as_deref(),
                    )?;
                    self.registry
                        .repo()
                        .update_status(&run.run_id, RunStatus::Failed)?;
                }
                continue;
            }

            if self.registry.claim_for_recovery(&run.run_id)? {
                tracing::info!(run_id = %run.run_id, "claimed orphaned run for recovery");
                claimed.push(run);
            }
        }

        Ok(claimed)
    }

    /// Sweep forever, resuming every claimed run.
    pub async fn run(&self, resumer: Arc<dyn RunResumer>) {
        loop {
            match self.sweep_once() {
                Ok(claimed) => {
                    for run in claimed {
                        let run_id = run.run_id.clone();
                        if let Err(e) = resumer.resume(run).await {
                            tracing::warn!(run_id = %run_id, "recovery resume failed: {e}");
                        }
                    }
                }
                Err(e) => tracing::warn!("recovery sweep failed: {e}"),
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
