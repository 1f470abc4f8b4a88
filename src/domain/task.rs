use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

use crate::error::OrchestratorError;

use super::Id;

/// Lifecycle status shared by `TaskRun` and `TaskStep` (spec.md §3,
/// §4.10).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Received,
    Started,
    Progress,
    Success,
    Failure,
    Retry,
    Revoked,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancelled | TaskStatus::Revoked
        )
    }

    /// spec.md §4.10: only PENDING/RECEIVED/STARTED/PROGRESS tasks may
    /// be cancelled.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Received | TaskStatus::Started | TaskStatus::Progress
        )
    }

    /// spec.md §4.10: only FAILURE/CANCELLED/REVOKED tasks may be
    /// retried.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            TaskStatus::Failure | TaskStatus::Cancelled | TaskStatus::Revoked
        )
    }

    /// Validates a lifecycle transition against spec.md §4.10's state
    /// diagram. `RETRY` does not transition the current run in place —
    /// it spawns a new one (`TaskOrchestrator::retry`) — so it is not a
    /// valid target here.
    pub fn validate_transition(self, to: TaskStatus) -> Result<(), OrchestratorError> {
        let allowed = match self {
            TaskStatus::Pending => matches!(to, TaskStatus::Received | TaskStatus::Cancelled),
            TaskStatus::Received => matches!(to, TaskStatus::Started | TaskStatus::Cancelled),
            TaskStatus::Started => matches!(
                to,
                TaskStatus::Progress
                    | TaskStatus::Success
                    | TaskStatus::Failure
                    | TaskStatus::Cancelled
                    | TaskStatus::Revoked
            ),
            TaskStatus::Progress => matches!(
                to,
                TaskStatus::Progress
                    | TaskStatus::Success
                    | TaskStatus::Failure
                    | TaskStatus::Cancelled
                    | TaskStatus::Revoked
            ),
            TaskStatus::Success
            | TaskStatus::Failure
            | TaskStatus::Cancelled
            | TaskStatus::Revoked
            | TaskStatus::Retry => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(OrchestratorError::IllegalTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

/// Durable record of one long-running job execution (spec.md §3
/// TaskRun, §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Id,
    /// Opaque id from whatever executes the job (spec.md §9: the
    /// source's Celery task id; this crate's own worker pool assigns
    /// one equally opaque string).
    pub external_task_id: String,
    pub task_name: String,
    pub task_type: String,
    pub title: String,
    pub status: TaskStatus,
    pub progress_percentage: u8,
    pub current_message: Option<String>,
    pub current_step: Option<i32>,
    pub total_steps: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_seconds: Option<i64>,
    pub retry_count: i32,
    pub input_parameters: Value,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
    pub error_category: Option<String>,
    pub actor_id: Option<String>,
    /// Links a retry-spawned run back to the run it retries
    /// (spec.md §4.10: "retry creates a NEW TaskRun linked by a note in
    /// `description`, preserving input_parameters").
    pub retry_of: Option<Id>,
    pub description: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    /// spec.md §5: a heartbeat older than 5 minutes marks the run
    /// FAILURE with `error_category = "lost_heartbeat"`.
    pub const HEARTBEAT_STALE_AFTER_SECS: i64 = 300;

    pub fn new(task_type: impl Into<String>, task_name: impl Into<String>, title: impl Into<String>, input_parameters: Value) -> Self {
        let now = Utc::now();
        TaskRun {
            id: Id::new_v4(),
            external_task_id: Id::new_v4().to_string(),
            task_name: task_name.into(),
            task_type: task_type.into(),
            title: title.into(),
            status: TaskStatus::Pending,
            progress_percentage: 0,
            current_message: None,
            current_step: None,
            total_steps: None,
            started_at: None,
            completed_at: None,
            execution_time_seconds: None,
            retry_count: 0,
            input_parameters,
            result_data: None,
            error_message: None,
            error_traceback: None,
            error_category: None,
            actor_id: None,
            retry_of: None,
            description: None,
            last_heartbeat_at: Some(now),
        }
    }

    pub fn is_heartbeat_stale(&self, now: DateTime<Utc>) -> bool {
        match self.last_heartbeat_at {
            Some(last) => (now - last).num_seconds() > Self::HEARTBEAT_STALE_AFTER_SECS,
            None => false,
        }
    }
}

/// A major phase within a `TaskRun` (spec.md §3 TaskStep). Append-only:
/// `step_order` is assigned monotonically on first creation;
/// re-creating the same `step_name` is an update, not a new row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub task_run_id: Id,
    pub step_name: String,
    pub step_order: i32,
    pub title: String,
    pub status: TaskStatus,
    pub result_data: Option<Value>,
}

/// An append-only log line attached to a `TaskRun` (spec.md §3
/// TaskLog).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub task_run_id: Id,
    pub created_at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub extra_data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_only_allowed_from_non_terminal_states() {
        assert!(TaskStatus::Started.is_cancellable());
        assert!(!TaskStatus::Success.is_cancellable());
    }

    #[test]
    fn retry_only_allowed_from_terminal_failure_states() {
        assert!(TaskStatus::Failure.is_retryable());
        assert!(TaskStatus::Cancelled.is_retryable());
        assert!(!TaskStatus::Success.is_retryable());
        assert!(!TaskStatus::Started.is_retryable());
    }

    #[test]
    fn transition_table_matches_state_diagram() {
        assert!(TaskStatus::Pending.validate_transition(TaskStatus::Received).is_ok());
        assert!(TaskStatus::Started.validate_transition(TaskStatus::Progress).is_ok());
        assert!(TaskStatus::Progress.validate_transition(TaskStatus::Success).is_ok());
        assert!(TaskStatus::Success.validate_transition(TaskStatus::Started).is_err());
        assert!(TaskStatus::Pending.validate_transition(TaskStatus::Success).is_err());
    }

    #[test]
    fn heartbeat_staleness() {
        let mut run = TaskRun::new("ohlcv_historical", "backfill", "Historical backfill", serde_json::json!({}));
        let now = Utc::now();
        run.last_heartbeat_at = Some(now - chrono::Duration::seconds(301));
        assert!(run.is_heartbeat_stale(now));
        run.last_heartbeat_at = Some(now - chrono::Duration::seconds(10));
        assert!(!run.is_heartbeat_stale(now));
    }
}
