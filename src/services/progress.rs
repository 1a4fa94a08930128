//! Progress sequencing.
//!
//! Maps phase transitions to a strictly increasing percentage stream per
//! run. Automatic emissions that would move backward are rejected, so a
//! retry can never make the UI regress. The one sanctioned exception is a
//! force-restart, which grants exactly one lower-baseline emission; after
//! that, monotonicity is enforced from the new baseline. Accepted emissions
//! are persisted before broadcast so a client that (re)subscribes mid-run
//! immediately sees the current state.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::EngineError;
use crate::repository::{ProgressRecord, RunRepository};

const CHANNEL_CAPACITY: usize = 64;

/// One progress update on the authoritative per-run channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: String,
    pub document_id: String,
    pub step_key: String,
    pub percent: u8,
    pub description: String,
    /// True when the emission came from the force-restart path.
    pub manual: bool,
    pub emitted_at: DateTime<Utc>,
}

impl From<ProgressRecord> for ProgressEvent {
    fn from(record: ProgressRecord) -> Self {
        Self {
            run_id: record.run_id,
            document_id: record.document_id,
            step_key: record.step_key,
            percent: record.percent,
            description: record.description,
            manual: record.manual,
            emitted_at: record.created_at,
        }
    }
}

/// Per-run monotonic progress stream with persistence and replay.
pub struct ProgressSequencer {
    repo: RunRepository,
    channels: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
    /// Runs holding an unconsumed permission to move backward once.
    regress_grants: Mutex<HashSet<String>>,
}

impl ProgressSequencer {
    pub fn new(repo: RunRepository) -> Self {
        Self {
            repo,
            channels: Mutex::new(HashMap::new()),
            regress_grants: Mutex::new(HashSet::new()),
        }
    }

    /// Permit the next lower-than-baseline emission for this run. Called
    /// only by the force-restart path; consumed by the first emission it
    /// unblocks.
    pub fn grant_regress(&self, run_id: &str) {
        self.regress_grants
            .lock()
            .expect("grant set poisoned")
            .insert(run_id.to_string());
    }

    fn take_regress_grant(&self, run_id: &str) -> bool {
        self.regress_grants
            .lock()
            .expect("grant set poisoned")
            .remove(run_id)
    }

    /// Emit a progress update.
    ///
    /// Returns false when the update was rejected for not being strictly
    /// greater than the last accepted percent (and no restart grant was
    /// pending). Rejected updates are neither persisted nor broadcast.
    pub fn emit(
        &self,
        run_id: &str,
        step_key: &str,
        percent: u8,
        description: &str,
    ) -> Result<bool, EngineError> {
        let run = self
            .repo
            .get(run_id)?
            .ok_or_else(|| EngineError::Validation(format!("unknown run: {run_id}")))?;

        let last = self.repo.latest_progress(run_id)?.map(|r| r.percent);
        let mut manual = false;
        if let Some(last) = last {
            if percent <= last {
                if self.take_regress_grant(run_id) {
                    manual = true;
                } else {
                    tracing::debug!(
                        run_id,
                        step_key,
                        percent,
                        last,
                        "rejected non-monotonic progress emission"
                    );
                    return Ok(false);
                }
            }
        }

        let record = ProgressRecord {
            run_id: run_id.to_string(),
            document_id: run.document_id.clone(),
            step_key: step_key.to_string(),
            percent,
            description: description.to_string(),
            manual,
            created_at: Utc::now(),
        };
        self.repo.insert_progress(&record)?;
        self.repo.set_step(run_id, step_key, percent)?;

        let event = ProgressEvent::from(record);
        let channels = self.channels.lock().expect("channel map poisoned");
        if let Some(sender) = channels.get(run_id) {
            // Send only fails when no subscriber is listening.
            let _ = sender.send(event);
        }
        Ok(true)
    }

    /// Subscribe to a run's progress stream.
    ///
    /// The last persisted event is returned alongside the receiver so a
    /// client connecting mid-run sees correct state without waiting for the
    /// next natural emission.
    pub fn subscribe(
        &self,
        run_id: &str,
    ) -> Result<(broadcast::Receiver<ProgressEvent>, Option<ProgressEvent>), EngineError> {
        let receiver = {
            let mut channels = self.channels.lock().expect("channel map poisoned");
            channels
                .entry(run_id.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        let replay = self.repo.latest_progress(run_id)?.map(ProgressEvent::from);
        Ok((receiver, replay))
    }

    /// Drop a finished run's channel.
    pub fn close(&self, run_id: &str) {
        self.channels
            .lock()
            .expect("channel map poisoned")
            .remove(run_id);
    }
}
