//! Job orchestrator (C10, spec.md §4.10, §5, §9): owns the `TaskRun`
//! lifecycle, the static job registry, and the per-run cooperative
//! cancellation flags. Replaces the source's Celery worker pool + task
//! base-class hierarchy with an in-process Tokio task set driven by
//! explicit [`TaskContext`] capability objects (spec.md §9 REDESIGN
//! FLAGS).

pub mod context;
pub mod jobs;
pub mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;

pub use context::TaskContext;
use context::DbTaskContext;

use crate::config::Settings;
use crate::db;
use crate::domain::{Id, TaskRun, TaskStatus};
use crate::error::OrchestratorError;
use crate::rate_limiter::RateLimiter;
use crate::upstream::UpstreamClient;
use crate::IngestResult;

/// Everything a job function needs to do its work, shared read-only
/// across every run (spec.md §9: replaces constructor injection into a
/// `DatabaseTask` base class with one struct passed by reference).
pub struct JobResources {
    pub pool: PgPool,
    pub upstream: Box<dyn UpstreamClient>,
    pub limiter: RateLimiter,
    pub settings: Settings,
}

/// In-process flags for cooperative cancellation, keyed by
/// `task_run_id` (spec.md §4.10, §5). A run only appears here while
/// it's actually executing on this process; a cancel request against a
/// run this process isn't running just updates the database.
#[derive(Default, Clone)]
struct CancelRegistry {
    flags: Arc<Mutex<HashMap<Id, Arc<AtomicBool>>>>,
}

impl CancelRegistry {
    fn register(&self, task_run_id: Id) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.flags
            .lock()
            .expect("cancel registry mutex poisoned")
            .insert(task_run_id, Arc::clone(&flag));
        flag
    }

    /// Signals cancellation for a task run currently registered, if
    /// any. Returns `true` if a live flag was found and flipped.
    fn revoke(&self, task_run_id: Id) -> bool {
        match self.flags.lock().expect("cancel registry mutex poisoned").get(&task_run_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn clear(&self, task_run_id: Id) {
        self.flags.lock().expect("cancel registry mutex poisoned").remove(&task_run_id);
    }
}

/// Owns the lifecycle of every `TaskRun` submitted through it (spec.md
/// §4.10's state diagram, §9's static dispatch redesign).
pub struct TaskOrchestrator {
    resources: Arc<JobResources>,
    cancels: CancelRegistry,
}

impl TaskOrchestrator {
    pub fn new(resources: Arc<JobResources>) -> Self {
        TaskOrchestrator {
            resources,
            cancels: CancelRegistry::default(),
        }
    }

    /// Validates `task_type` against the static registry and creates
    /// the run PENDING (spec.md §4.10 "submission creates the row
    /// before any work starts").
    pub async fn submit(
        &self,
        task_type: &str,
        task_name: &str,
        title: &str,
        input_parameters: Value,
        actor_id: Option<&str>,
    ) -> IngestResult<TaskRun> {
        if registry::lookup(task_type).is_none() {
            return Err(OrchestratorError::UnknownTaskType(task_type.to_string()).into());
        }

        let mut run = TaskRun::new(task_type, task_name, title, input_parameters);
        run.actor_id = actor_id.map(str::to_string);
        let created = db::tasks::create(&self.resources.pool, &run).await?;
        Ok(created)
    }

    /// Drives one submitted run end to end: PENDING → RECEIVED →
    /// STARTED, executes the registered job function, then finishes
    /// with SUCCESS/FAILURE/CANCELLED (spec.md §4.10).
    pub async fn run(&self, task_run_id: Id) -> IngestResult<TaskRun> {
        let pool = &self.resources.pool;

        let run = db::tasks::find(pool, task_run_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(task_run_id.to_string()))?;

        let job_fn = registry::lookup(&run.task_type)
            .ok_or_else(|| OrchestratorError::UnknownTaskType(run.task_type.clone()))?;

        self.transition(task_run_id, run.status, TaskStatus::Received, Some(Utc::now()))
            .await?;
        self.transition(task_run_id, TaskStatus::Received, TaskStatus::Started, None)
            .await?;

        let cancel_flag = self.cancels.register(task_run_id);
        let ctx: Arc<dyn TaskContext> = Arc::new(DbTaskContext::new(pool.clone(), task_run_id, Arc::clone(&cancel_flag)));

        let started = Utc::now();
        let outcome = job_fn(Arc::clone(&self.resources), Arc::clone(&ctx), run.input_parameters.clone()).await;
        let completed = Utc::now();
        let execution_time = (completed - started).num_seconds();

        self.cancels.clear(task_run_id);

        let (status, result_data, error_message, error_category) = if cancel_flag.load(Ordering::SeqCst) {
            (TaskStatus::Cancelled, None, None, Some("cancelled".to_string()))
        } else {
            match &outcome {
                Ok(value) => (TaskStatus::Success, Some(value.clone()), None, None),
                Err(e) => (
                    TaskStatus::Failure,
                    None,
                    Some(e.to_string()),
                    Some(e.error_category().to_string()),
                ),
            }
        };

        if status == TaskStatus::Failure {
            db::tasks::fail_open_steps(pool, task_run_id).await?;
        }

        db::tasks::finish(
            pool,
            task_run_id,
            status,
            completed,
            execution_time,
            result_data.as_ref(),
            error_message.as_deref(),
            None,
            error_category.as_deref(),
        )
        .await?;

        tracing::info!(
            task_run_id = %task_run_id,
            status = %status,
            duration = %humantime::format_duration(std::time::Duration::from_secs(execution_time.max(0) as u64)),
            "task run finished"
        );

        outcome?;

        db::tasks::find(pool, task_run_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(task_run_id.to_string()).into())
    }

    /// Requests cancellation of a run (spec.md §4.10 "cancellation is
    /// cooperative": flips the in-process flag if the run is executing
    /// here, and records the transition regardless).
    pub async fn request_cancel(&self, task_run_id: Id) -> IngestResult<()> {
        let pool = &self.resources.pool;
        let run = db::tasks::find(pool, task_run_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(task_run_id.to_string()))?;

        run.status.validate_transition(TaskStatus::Cancelled)?;
        db::tasks::update_status(pool, task_run_id, TaskStatus::Cancelled, None, Some(Utc::now()), None).await?;
        self.cancels.revoke(task_run_id);
        Ok(())
    }

    /// Creates a new `TaskRun` linked back to `task_run_id` via
    /// `retry_of`, preserving its type/parameters/actor (spec.md §4.10
    /// "retry never mutates the original run").
    pub async fn retry(&self, task_run_id: Id) -> IngestResult<TaskRun> {
        let pool = &self.resources.pool;
        let original = db::tasks::find(pool, task_run_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(task_run_id.to_string()))?;

        if !original.status.is_retryable() {
            return Err(OrchestratorError::IllegalTransition {
                from: original.status.to_string(),
                to: TaskStatus::Retry.to_string(),
            }
            .into());
        }

        let mut retry_run = TaskRun::new(
            original.task_type.clone(),
            original.task_name.clone(),
            original.title.clone(),
            original.input_parameters.clone(),
        );
        retry_run.actor_id = original.actor_id.clone();
        retry_run.retry_of = Some(original.id);
        retry_run.retry_count = original.retry_count + 1;
        retry_run.description = Some(format!(
            "retry of task run {} (attempt {})",
            original.id, retry_run.retry_count
        ));

        let created = db::tasks::create(pool, &retry_run).await?;
        Ok(created)
    }

    /// Sweeps runs whose heartbeat has gone stale, forcing their open
    /// steps and the run itself to FAILURE (spec.md §5's watchdog;
    /// grounded on `db::tasks::find_stale_running`).
    pub async fn sweep_stale_heartbeats(&self) -> IngestResult<usize> {
        let pool = &self.resources.pool;
        let stale = db::tasks::find_stale_running(pool).await?;

        for run in &stale {
            db::tasks::fail_open_steps(pool, run.id).await?;
            db::tasks::finish(
                pool,
                run.id,
                TaskStatus::Failure,
                Utc::now(),
                run.last_heartbeat_at
                    .map(|h| (Utc::now() - h).num_seconds())
                    .unwrap_or(0),
                None,
                Some("heartbeat went stale"),
                None,
                Some("lost_heartbeat"),
            )
            .await?;
            self.cancels.clear(run.id);
        }

        Ok(stale.len())
    }

    async fn transition(
        &self,
        task_run_id: Id,
        from: TaskStatus,
        to: TaskStatus,
        started_at: Option<chrono::DateTime<Utc>>,
    ) -> IngestResult<()> {
        from.validate_transition(to)?;
        db::tasks::update_status(&self.resources.pool, task_run_id, to, started_at, None, None).await?;
        Ok(())
    }
}
