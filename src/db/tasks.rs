use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::domain::{Id, LogLevel, TaskLog, TaskRun, TaskStatus, TaskStep};
use crate::error::StoreError;

#[derive(sqlx::FromRow)]
struct TaskRunRow {
    id: Id,
    external_task_id: String,
    task_name: String,
    task_type: String,
    title: String,
    status: String,
    progress_percentage: i16,
    current_message: Option<String>,
    current_step: Option<i32>,
    total_steps: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    execution_time_seconds: Option<i64>,
    retry_count: i32,
    input_parameters: Value,
    result_data: Option<Value>,
    error_message: Option<String>,
    error_traceback: Option<String>,
    error_category: Option<String>,
    actor_id: Option<String>,
    retry_of: Option<Id>,
    description: Option<String>,
    last_heartbeat_at: Option<DateTime<Utc>>,
}

impl From<TaskRunRow> for TaskRun {
    fn from(r: TaskRunRow) -> Self {
        TaskRun {
            id: r.id,
            external_task_id: r.external_task_id,
            task_name: r.task_name,
            task_type: r.task_type,
            title: r.title,
            status: TaskStatus::from_str(&r.status).unwrap_or(TaskStatus::Pending),
            progress_percentage: r.progress_percentage.clamp(0, 100) as u8,
            current_message: r.current_message,
            current_step: r.current_step,
            total_steps: r.total_steps,
            started_at: r.started_at,
            completed_at: r.completed_at,
            execution_time_seconds: r.execution_time_seconds,
            retry_count: r.retry_count,
            input_parameters: r.input_parameters,
            result_data: r.result_data,
            error_message: r.error_message,
            error_traceback: r.error_traceback,
            error_category: r.error_category,
            actor_id: r.actor_id,
            retry_of: r.retry_of,
            description: r.description,
            last_heartbeat_at: r.last_heartbeat_at,
        }
    }
}

pub async fn create(pool: &PgPool, run: &TaskRun) -> Result<TaskRun, StoreError> {
    let row = sqlx::query_as::<_, TaskRunRow>(
        r#"
        INSERT INTO task_runs (
            id, external_task_id, task_name, task_type, title, status, progress_percentage,
            current_message, current_step, total_steps, started_at, completed_at,
            execution_time_seconds, retry_count, input_parameters, result_data,
            error_message, error_traceback, error_category, actor_id, retry_of, description,
            last_heartbeat_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
        RETURNING *
        "#,
    )
    .bind(run.id)
    .bind(&run.external_task_id)
    .bind(&run.task_name)
    .bind(&run.task_type)
    .bind(&run.title)
    .bind(run.status.to_string())
    .bind(run.progress_percentage as i16)
    .bind(&run.current_message)
    .bind(run.current_step)
    .bind(run.total_steps)
    .bind(run.started_at)
    .bind(run.completed_at)
    .bind(run.execution_time_seconds)
    .bind(run.retry_count)
    .bind(&run.input_parameters)
    .bind(&run.result_data)
    .bind(&run.error_message)
    .bind(&run.error_traceback)
    .bind(&run.error_category)
    .bind(&run.actor_id)
    .bind(run.retry_of)
    .bind(&run.description)
    .bind(run.last_heartbeat_at)
    .fetch_one(pool)
    .await?;

    Ok(row.into())
}

pub async fn find(pool: &PgPool, id: Id) -> Result<Option<TaskRun>, StoreError> {
    let row = sqlx::query_as::<_, TaskRunRow>("SELECT * FROM task_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Into::into))
}

/// Applies a validated status transition plus whatever fields change
/// alongside it (spec.md §4.10). Callers validate the transition via
/// [`TaskStatus::validate_transition`] before calling this.
pub async fn update_status(
    pool: &PgPool,
    id: Id,
    status: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    execution_time_seconds: Option<i64>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE task_runs SET
            status = $2,
            started_at = COALESCE($3, started_at),
            completed_at = COALESCE($4, completed_at),
            execution_time_seconds = COALESCE($5, execution_time_seconds)
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status.to_string())
    .bind(started_at)
    .bind(completed_at)
    .bind(execution_time_seconds)
    .execute(pool)
    .await?;

    Ok(())
}

/// Atomically updates progress fields and the heartbeat (spec.md §4.10
/// progress propagation, §5 job heartbeat).
pub async fn update_progress(
    pool: &PgPool,
    id: Id,
    progress_percentage: u8,
    current_message: Option<&str>,
    current_step: i32,
    total_steps: i32,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE task_runs SET
            progress_percentage = $2,
            current_message = $3,
            current_step = $4,
            total_steps = $5,
            status = 'PROGRESS',
            last_heartbeat_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(progress_percentage as i16)
    .bind(current_message)
    .bind(current_step)
    .bind(total_steps)
    .execute(pool)
    .await?;

    Ok(())
}

/// Updates `progress_percentage`/`current_message` and the heartbeat
/// only, leaving `current_step`/`total_steps` untouched — for callers
/// that have a percentage but no step count to report (C6's fetcher
/// path, bridged through `ProgressBridge`).
pub async fn update_progress_percentage(
    pool: &PgPool,
    id: Id,
    progress_percentage: u8,
    current_message: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE task_runs SET
            progress_percentage = $2,
            current_message = $3,
            status = 'PROGRESS',
            last_heartbeat_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(progress_percentage as i16)
    .bind(current_message)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn heartbeat(pool: &PgPool, id: Id) -> Result<(), StoreError> {
    sqlx::query("UPDATE task_runs SET last_heartbeat_at = now() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn finish(
    pool: &PgPool,
    id: Id,
    status: TaskStatus,
    completed_at: DateTime<Utc>,
    execution_time_seconds: i64,
    result_data: Option<&Value>,
    error_message: Option<&str>,
    error_traceback: Option<&str>,
    error_category: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE task_runs SET
            status = $2, completed_at = $3, execution_time_seconds = $4,
            result_data = $5, error_message = $6, error_traceback = $7, error_category = $8
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status.to_string())
    .bind(completed_at)
    .bind(execution_time_seconds)
    .bind(result_data)
    .bind(error_message)
    .bind(error_traceback)
    .bind(error_category)
    .execute(pool)
    .await?;

    Ok(())
}

/// Finds `TaskRun`s whose heartbeat has gone stale (spec.md §5) and are
/// still in a non-terminal state — the orchestrator's sweep target.
pub async fn find_stale_running(pool: &PgPool) -> Result<Vec<TaskRun>, StoreError> {
    let rows = sqlx::query_as::<_, TaskRunRow>(
        r#"
        SELECT * FROM task_runs
        WHERE status IN ('PENDING', 'RECEIVED', 'STARTED', 'PROGRESS')
        AND last_heartbeat_at < now() - interval '5 minutes'
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

#[derive(sqlx::FromRow)]
struct TaskStepRow {
    task_run_id: Id,
    step_name: String,
    step_order: i32,
    title: String,
    status: String,
    result_data: Option<Value>,
}

impl From<TaskStepRow> for TaskStep {
    fn from(r: TaskStepRow) -> Self {
        TaskStep {
            task_run_id: r.task_run_id,
            step_name: r.step_name,
            step_order: r.step_order,
            title: r.title,
            status: TaskStatus::from_str(&r.status).unwrap_or(TaskStatus::Pending),
            result_data: r.result_data,
        }
    }
}

/// Creates or updates a step (spec.md §4.10 "re-creating the same
/// `step_name` within a task is an update"). `step_order` is assigned
/// monotonically only on first creation.
pub async fn upsert_step(
    pool: &PgPool,
    task_run_id: Id,
    step_name: &str,
    title: &str,
    status: TaskStatus,
    result_data: Option<&Value>,
) -> Result<TaskStep, StoreError> {
    let next_order: (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(step_order), 0) + 1 FROM task_steps WHERE task_run_id = $1",
    )
    .bind(task_run_id)
    .fetch_one(pool)
    .await?;

    let row = sqlx::query_as::<_, TaskStepRow>(
        r#"
        INSERT INTO task_steps (task_run_id, step_name, step_order, title, status, result_data)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (task_run_id, step_name) DO UPDATE SET
            title = EXCLUDED.title,
            status = EXCLUDED.status,
            result_data = EXCLUDED.result_data
        RETURNING *
        "#,
    )
    .bind(task_run_id)
    .bind(step_name)
    .bind(next_order.0 as i32)
    .bind(title)
    .bind(status.to_string())
    .bind(result_data)
    .fetch_one(pool)
    .await?;

    Ok(row.into())
}

/// Forces every non-terminal step of `task_run_id` to FAILURE (spec.md
/// §4.10 "On task FAILURE, the current non-terminal step is forced to
/// FAILURE").
pub async fn fail_open_steps(pool: &PgPool, task_run_id: Id) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE task_steps SET status = 'FAILURE'
        WHERE task_run_id = $1 AND status NOT IN ('SUCCESS', 'FAILURE', 'CANCELLED', 'REVOKED')
        "#,
    )
    .bind(task_run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn list_steps(pool: &PgPool, task_run_id: Id) -> Result<Vec<TaskStep>, StoreError> {
    let rows = sqlx::query_as::<_, TaskStepRow>(
        "SELECT * FROM task_steps WHERE task_run_id = $1 ORDER BY step_order ASC",
    )
    .bind(task_run_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Appends a log line (spec.md §3 TaskLog, §4.10 "bounded log volume").
pub async fn append_log(pool: &PgPool, log: &TaskLog) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO task_logs (task_run_id, created_at, level, message, extra_data)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(log.task_run_id)
    .bind(log.created_at)
    .bind(log.level.to_string())
    .bind(&log.message)
    .bind(&log.extra_data)
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(sqlx::FromRow)]
struct TaskLogRow {
    task_run_id: Id,
    created_at: DateTime<Utc>,
    level: String,
    message: String,
    extra_data: Option<Value>,
}

impl From<TaskLogRow> for TaskLog {
    fn from(r: TaskLogRow) -> Self {
        TaskLog {
            task_run_id: r.task_run_id,
            created_at: r.created_at,
            level: LogLevel::from_str(&r.level).unwrap_or(LogLevel::Info),
            message: r.message,
            extra_data: r.extra_data,
        }
    }
}

pub async fn list_logs(pool: &PgPool, task_run_id: Id) -> Result<Vec<TaskLog>, StoreError> {
    let rows = sqlx::query_as::<_, TaskLogRow>(
        "SELECT * FROM task_logs WHERE task_run_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_run_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}
