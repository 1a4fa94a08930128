//! Run lifecycle model.
//!
//! A run is one processing attempt for one user-visible document. Status is
//! an explicit persisted state machine; there is no process-global "current
//! status" anywhere in the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Started,
    Processing,
    Checkpoint,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Recovering,
    Partial,
    Orphaned,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Processing => "processing",
            Self::Checkpoint => "checkpoint",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Recovering => "recovering",
            Self::Partial => "partial",
            Self::Orphaned => "orphaned",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "started" => Some(Self::Started),
            "processing" => Some(Self::Processing),
            "checkpoint" => Some(Self::Checkpoint),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "recovering" => Some(Self::Recovering),
            "partial" => Some(Self::Partial),
            "orphaned" => Some(Self::Orphaned),
            _ => None,
        }
    }

    /// Terminal states are retained for audit and duplicate short-circuiting
    /// but never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Partial
        )
    }

    /// States eligible for stale-heartbeat orphan discovery.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Processing | Self::Checkpoint | Self::Partial | Self::Orphaned
        )
    }
}

/// One processing attempt for one user document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub document_id: String,
    pub user_id: String,
    pub status: RunStatus,
    /// Step key last reached, from the fixed step table.
    pub current_step: Option<String>,
    /// Content HMAC once the address has been derived; used by resume
    /// validation to spot a duplicate run that already finished.
    pub content_hmac: Option<String>,
    /// Resumable state snapshot mirrored from the latest checkpoint.
    pub checkpoint_data: serde_json::Value,
    /// Last accepted progress percentage.
    pub progress_percent: u8,
    pub heartbeat_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Higher values are recovered first.
    pub recovery_priority: i32,
    /// Cooperative cancellation flag checked between phases.
    pub cancel_requested: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Create a freshly queued run.
    pub fn new(document_id: &str, user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            status: RunStatus::Queued,
            current_step: None,
            content_hmac: None,
            checkpoint_data: serde_json::json!({}),
            progress_percent: 0,
            heartbeat_at: now,
            retry_count: 0,
            recovery_priority: 0,
            cancel_requested: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            RunStatus::Queued,
            RunStatus::Started,
            RunStatus::Processing,
            RunStatus::Checkpoint,
            RunStatus::Paused,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Recovering,
            RunStatus::Partial,
            RunStatus::Orphaned,
        ] {
            assert_eq!(RunStatus::from_str(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Partial.is_terminal());
        assert!(!RunStatus::Processing.is_terminal());
        assert!(!RunStatus::Recovering.is_terminal());
    }

    #[test]
    fn test_recoverable_states() {
        assert!(RunStatus::Processing.is_recoverable());
        assert!(RunStatus::Orphaned.is_recoverable());
        assert!(!RunStatus::Completed.is_recoverable());
        assert!(!RunStatus::Queued.is_recoverable());
    }
}
