//! Named, ordered snapshots of resumable run state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A snapshot recorded at a step boundary. Immutable once written; later
/// checkpoints in the same run supersede earlier ones without touching them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub checkpoint_name: String,
    pub progress_percent: u8,
    /// State the recovery path needs to skip completed work.
    pub recoverable_data: serde_json::Value,
    /// Integrity hash over the row, verified before resume.
    pub validity_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        run_id: &str,
        checkpoint_name: &str,
        progress_percent: u8,
        recoverable_data: serde_json::Value,
    ) -> Self {
        let validity_hash = Self::compute_validity_hash(run_id, checkpoint_name, &recoverable_data);
        Self {
            run_id: run_id.to_string(),
            checkpoint_name: checkpoint_name.to_string(),
            progress_percent,
            recoverable_data,
            validity_hash,
            created_at: Utc::now(),
        }
    }

    /// Hash binding the snapshot to its run and name, so a corrupted or
    /// cross-wired row is rejected instead of replayed.
    pub fn compute_validity_hash(
        run_id: &str,
        checkpoint_name: &str,
        recoverable_data: &serde_json::Value,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(run_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(checkpoint_name.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(recoverable_data.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_valid(&self) -> bool {
        self.validity_hash
            == Self::compute_validity_hash(
                &self.run_id,
                &self.checkpoint_name,
                &self.recoverable_data,
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_checkpoint_is_valid() {
        let cp = Checkpoint::new("r1", "phase_foundation", 35, serde_json::json!({"x": 1}));
        assert!(cp.is_valid());
    }

    #[test]
    fn test_tampered_data_is_invalid() {
        let mut cp = Checkpoint::new("r1", "phase_foundation", 35, serde_json::json!({"x": 1}));
        cp.recoverable_data = serde_json::json!({"x": 2});
        assert!(!cp.is_valid());
    }

    #[test]
    fn test_cross_wired_run_is_invalid() {
        let mut cp = Checkpoint::new("r1", "phase_foundation", 35, serde_json::json!({}));
        cp.run_id = "r2".to_string();
        assert!(!cp.is_valid());
    }
}
