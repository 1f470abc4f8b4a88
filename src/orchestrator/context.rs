//! `TaskContext`: the explicit capability interface spec.md §9 uses in
//! place of the source's `BaseTask → DatabaseTask` inheritance chain.
//! Job functions (`orchestrator::jobs`) receive one of these instead of
//! subclassing a base task type.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;

use crate::db;
use crate::domain::{Id, LogLevel, TaskLog, TaskStatus};
use crate::fetcher::CancelSignal;
use crate::IngestResult;

/// Progress/logging/step/cancellation access, passed explicitly to
/// every registered job instead of being inherited.
#[async_trait]
pub trait TaskContext: Send + Sync {
    fn task_run_id(&self) -> Id;

    /// Checked at chunk boundaries and rate-limit acquisitions by the
    /// components a job drives (spec.md §5 "cooperative" cancellation).
    fn is_cancelled(&self) -> bool;

    /// Atomically updates `progress_percentage`/`current_message` and
    /// mirrors a TaskLog at INFO only on a 10%-boundary crossing or
    /// completion (spec.md §4.10).
    async fn progress(&self, current: u64, total: u64, message: &str) -> IngestResult<()>;

    /// Same milestone logging as [`TaskContext::progress`], but for
    /// callers that only have a percentage and no step count to
    /// report — leaves `current_step`/`total_steps` untouched rather
    /// than overloading them with the percentage.
    async fn set_progress(&self, percentage: u8, message: &str) -> IngestResult<()>;

    async fn log(&self, level: LogLevel, message: &str, extra: Option<Value>) -> IngestResult<()>;

    /// Creates or updates a step (spec.md §4.10: re-creating the same
    /// `step_name` is an update, not a new row).
    async fn step(
        &self,
        step_name: &str,
        title: &str,
        status: TaskStatus,
        result_data: Option<Value>,
    ) -> IngestResult<()>;
}

/// Production `TaskContext`, writing through to `task_runs`/
/// `task_steps`/`task_logs`.
pub struct DbTaskContext {
    pool: PgPool,
    task_run_id: Id,
    cancel_flag: Arc<AtomicBool>,
    last_progress_decile: AtomicU8,
}

impl DbTaskContext {
    pub fn new(pool: PgPool, task_run_id: Id, cancel_flag: Arc<AtomicBool>) -> Self {
        DbTaskContext {
            pool,
            task_run_id,
            cancel_flag,
            last_progress_decile: AtomicU8::new(0),
        }
    }

    /// Mirrors a TaskLog at INFO only on a 10%-boundary crossing or
    /// completion (spec.md §4.10), shared by the step-aware and
    /// percentage-only progress paths.
    async fn log_progress_milestone(&self, pct: u8, message: &str) -> IngestResult<()> {
        let decile = pct / 10;
        let previous = self.last_progress_decile.swap(decile, Ordering::SeqCst);
        if decile != previous || pct == 100 {
            self.log(LogLevel::Info, &format!("progress {pct}%: {message}"), None).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskContext for DbTaskContext {
    fn task_run_id(&self) -> Id {
        self.task_run_id
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    async fn progress(&self, current: u64, total: u64, message: &str) -> IngestResult<()> {
        let pct = if total == 0 {
            0
        } else {
            ((current as f64 / total as f64) * 100.0).round().clamp(0.0, 100.0) as u8
        };

        db::tasks::update_progress(
            &self.pool,
            self.task_run_id,
            pct,
            Some(message),
            current as i32,
            total as i32,
        )
        .await?;

        self.log_progress_milestone(pct, message).await
    }

    async fn set_progress(&self, percentage: u8, message: &str) -> IngestResult<()> {
        db::tasks::update_progress_percentage(&self.pool, self.task_run_id, percentage, Some(message)).await?;

        self.log_progress_milestone(percentage, message).await
    }

    async fn log(&self, level: LogLevel, message: &str, extra: Option<Value>) -> IngestResult<()> {
        let log = TaskLog {
            task_run_id: self.task_run_id,
            created_at: Utc::now(),
            level,
            message: message.to_string(),
            extra_data: extra,
        };
        db::tasks::append_log(&self.pool, &log).await?;
        Ok(())
    }

    async fn step(
        &self,
        step_name: &str,
        title: &str,
        status: TaskStatus,
        result_data: Option<Value>,
    ) -> IngestResult<()> {
        db::tasks::upsert_step(&self.pool, self.task_run_id, step_name, title, status, result_data.as_ref()).await?;
        Ok(())
    }
}

/// Adapts a [`TaskContext`] to [`CancelSignal`] so C6's fetcher can be
/// driven from the orchestrator without depending on it directly.
pub struct CancelBridge(pub Arc<dyn TaskContext>);

impl CancelSignal for CancelBridge {
    fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Adapts a [`TaskContext`] to [`crate::fetcher::ProgressSink`]'s
/// synchronous callback shape. `ProgressSink::on_progress` cannot be
/// `async`, so the bridge steps out to the current Tokio runtime via
/// `block_in_place` + `Handle::block_on` to await the durable write —
/// safe here because every caller runs on a multi-threaded runtime
/// (spec.md §5's worker-pool model), never `current_thread`.
pub struct ProgressBridge {
    ctx: Arc<dyn TaskContext>,
}

impl ProgressBridge {
    pub fn new(ctx: Arc<dyn TaskContext>) -> Self {
        ProgressBridge { ctx }
    }
}

impl crate::fetcher::ProgressSink for ProgressBridge {
    fn on_progress(&self, percentage: u8, message: &str) {
        let ctx = Arc::clone(&self.ctx);
        let message = message.to_string();
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                if let Err(e) = ctx.set_progress(percentage, &message).await {
                    tracing::warn!(error = %e, "failed to persist progress update");
                }
            });
        });
    }
}
