//! PostgreSQL-backed [`ClaimStore`] for the RPA orchestrator.
//!
//! Implements the durable claim protocol of spec §4.4 against the
//! three-table schema in `migrations/0001_job_queue.sql`: `job_queue`
//! (durable job rows), `job_claim` (one row per job currently leased to a
//! robot, generation-fenced), and `robots` (registry snapshot, mirrored
//! from the in-memory dispatcher for crash recovery).
//!
//! # Usage
//!
//! ```rust,ignore
//! use rpa_orchestrator_postgres::PgClaimStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/orchestrator").await?;
//! let store = PgClaimStore::new(pool);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rpa_orchestrator_core::claim::{ClaimStore, ClaimedJob, EnqueueRecord, LeaseGeneration};
use rpa_orchestrator_core::error::ClaimStoreError;
use rpa_orchestrator_core::job::{Job, JobId, JobPriority, JobStatus, RobotId};
use sqlx::{PgPool, Row};

fn to_transient(e: sqlx::Error) -> ClaimStoreError {
    ClaimStoreError::Transient(e.into())
}

fn priority_to_i16(priority: JobPriority) -> i16 {
    match priority {
        JobPriority::Low => 0,
        JobPriority::Normal => 1,
        JobPriority::High => 2,
        JobPriority::Critical => 3,
    }
}

fn priority_from_i16(value: i16) -> JobPriority {
    match value {
        0 => JobPriority::Low,
        2 => JobPriority::High,
        3 => JobPriority::Critical,
        _ => JobPriority::Normal,
    }
}

fn status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
        JobStatus::Timeout => "timeout",
    }
}

fn status_from_str(value: &str) -> Result<JobStatus, ClaimStoreError> {
    Ok(match value {
        "pending" => JobStatus::Pending,
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        "timeout" => JobStatus::Timeout,
        other => {
            return Err(ClaimStoreError::Transient(anyhow::anyhow!(
                "unrecognized job_queue.status value: {other}"
            )))
        }
    })
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, ClaimStoreError> {
    Ok(Job {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        workflow_name: row.get("workflow_name"),
        workflow_json: row.get("workflow_json"),
        priority: priority_from_i16(row.get("priority")),
        status: status_from_str(row.get("status"))?,
        robot_id: row.get::<Option<uuid::Uuid>, _>("robot_id"),
        environment: row.get::<Option<String>, _>("environment"),
        scheduled_time: Some(row.get("scheduled_time")),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        duration_ms: row.get("duration_ms"),
        progress: row.get::<i16, _>("progress") as u8,
        current_node: row.get("current_node"),
        result: row.get("result"),
        error_message: row.get("error_message"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        visibility_timeout_seconds: row.get::<i32, _>("visibility_timeout_seconds") as i64,
        dedup_fingerprint: row.get::<Option<String>, _>("dedup_fingerprint").unwrap_or_default(),
        cancel_requested: row.get("cancel_requested"),
    })
}

/// PostgreSQL implementation of the durable claim store.
#[derive(Clone)]
pub struct PgClaimStore {
    pool: PgPool,
}

impl PgClaimStore {
    pub fn new(pool: PgPool) -> Self {
        PgClaimStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ClaimStore for PgClaimStore {
    /// spec §4.1 `enqueue`, durable variant: the dedup partial unique
    /// index does the work the in-memory queue's `dedup_index` map does.
    async fn enqueue(&self, record: EnqueueRecord) -> Result<Job, ClaimStoreError> {
        let status = if record.scheduled_time > Utc::now() {
            JobStatus::Pending
        } else {
            JobStatus::Queued
        };

        let row = sqlx::query(
            r#"
            INSERT INTO job_queue (
                id, workflow_id, workflow_name, workflow_json, priority, status,
                environment, scheduled_time, visibility_timeout_seconds, dedup_fingerprint
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (dedup_fingerprint) WHERE dedup_fingerprint IS NOT NULL
                AND status IN ('pending', 'queued', 'running')
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(record.id)
        .bind(&record.workflow_id)
        .bind(&record.workflow_name)
        .bind(&record.workflow_json)
        .bind(priority_to_i16(record.priority))
        .bind(status_to_str(status))
        .bind(&record.environment)
        .bind(record.scheduled_time)
        .bind(record.visibility_timeout_seconds as i32)
        .bind(&record.dedup_fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(to_transient)?;

        match row {
            Some(row) => row_to_job(&row),
            None => {
                let fingerprint = record.dedup_fingerprint.unwrap_or_default();
                let existing = sqlx::query("SELECT id FROM job_queue WHERE dedup_fingerprint = $1 ORDER BY created_at DESC LIMIT 1")
                    .bind(&fingerprint)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(to_transient)?;
                let existing_job_id: JobId = existing
                    .map(|r| r.get("id"))
                    .unwrap_or(record.id);
                Err(ClaimStoreError::Transient(anyhow::anyhow!(
                    "duplicate job: fingerprint {fingerprint} already queued as {existing_job_id}"
                )))
            }
        }
    }

    /// `claim_job`: CTE-based `SELECT ... FOR UPDATE SKIP LOCKED` followed
    /// by the state transition and `job_claim` upsert, all in one
    /// statement so two robots never observe the same row as claimable
    /// (spec §4.4, "claim mutex").
    async fn claim_job(
        &self,
        robot_id: RobotId,
        eligible_workflow_ids: Option<&[String]>,
        environment: Option<&str>,
        now: DateTime<Utc>,
        batch: usize,
    ) -> Result<Vec<ClaimedJob>, ClaimStoreError> {
        if batch == 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await.map_err(to_transient)?;

        let candidates = sqlx::query(
            r#"
            SELECT id, visibility_timeout_seconds
            FROM job_queue
            WHERE status = 'queued'
              AND scheduled_time <= $1
              AND (robot_id IS NULL OR robot_id = $2)
              AND ($3::text[] IS NULL OR workflow_id = ANY($3))
              AND (environment IS NULL OR environment = $4)
            ORDER BY priority DESC, created_at ASC
            LIMIT $5
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(robot_id)
        .bind(eligible_workflow_ids)
        .bind(environment)
        .bind(batch as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(to_transient)?;

        if candidates.is_empty() {
            tx.commit().await.map_err(to_transient)?;
            return Ok(Vec::new());
        }

        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let job_id: JobId = candidate.get("id");
            let visibility_timeout_seconds: i32 = candidate.get("visibility_timeout_seconds");

            let row = sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'running', robot_id = $2, started_at = $3
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(job_id)
            .bind(robot_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(to_transient)?;

            let generation: (i64,) = sqlx::query_as("SELECT nextval('job_claim_lease_generation_seq')")
                .fetch_one(&mut *tx)
                .await
                .map_err(to_transient)?;
            let lease_generation = generation.0;
            let lease_expires_at = now + Duration::seconds(visibility_timeout_seconds as i64);

            sqlx::query(
                r#"
                INSERT INTO job_claim (job_id, robot_id, lease_generation, lease_expires_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(job_id)
            .bind(robot_id)
            .bind(lease_generation)
            .bind(lease_expires_at)
            .execute(&mut *tx)
            .await
            .map_err(to_transient)?;

            claimed.push(ClaimedJob {
                job: row_to_job(&row)?,
                lease_generation,
                lease_expires_at,
            });
        }

        tx.commit().await.map_err(to_transient)?;
        Ok(claimed)
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        robot_id: RobotId,
        lease_generation: LeaseGeneration,
        extension: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ClaimStoreError> {
        let new_expiry = now + extension;
        let result = sqlx::query(
            r#"
            UPDATE job_claim
            SET lease_expires_at = $1
            WHERE job_id = $2 AND robot_id = $3 AND lease_generation = $4
            "#,
        )
        .bind(new_expiry)
        .bind(job_id)
        .bind(robot_id)
        .bind(lease_generation)
        .execute(&self.pool)
        .await
        .map_err(to_transient)?;

        if result.rows_affected() == 0 {
            return Err(ClaimStoreError::LeaseLost { job_id, robot_id });
        }
        Ok(new_expiry)
    }

    async fn settle(
        &self,
        job_id: JobId,
        lease_generation: LeaseGeneration,
        terminal_status: JobStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Job, ClaimStoreError> {
        let mut tx = self.pool.begin().await.map_err(to_transient)?;

        let claim = sqlx::query("DELETE FROM job_claim WHERE job_id = $1 AND lease_generation = $2 RETURNING robot_id")
            .bind(job_id)
            .bind(lease_generation)
            .fetch_optional(&mut *tx)
            .await
            .map_err(to_transient)?;

        let Some(claim) = claim else {
            let robot_id = sqlx::query("SELECT robot_id FROM job_claim WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(to_transient)?
                .map(|r| r.get("robot_id"))
                .unwrap_or_default();
            return Err(ClaimStoreError::LeaseLost { job_id, robot_id });
        };
        let _robot_id: RobotId = claim.get("robot_id");

        let row = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = $2, result = $3, error_message = COALESCE($4, error_message),
                completed_at = $5,
                duration_ms = EXTRACT(EPOCH FROM ($5 - started_at)) * 1000
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(status_to_str(terminal_status))
        .bind(&result)
        .bind(&error_message)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(to_transient)?;

        tx.commit().await.map_err(to_transient)?;
        row_to_job(&row)
    }

    async fn release_job(&self, job_id: JobId, lease_generation: LeaseGeneration) -> Result<(), ClaimStoreError> {
        let mut tx = self.pool.begin().await.map_err(to_transient)?;

        let deleted = sqlx::query("DELETE FROM job_claim WHERE job_id = $1 AND lease_generation = $2")
            .bind(job_id)
            .bind(lease_generation)
            .execute(&mut *tx)
            .await
            .map_err(to_transient)?;

        if deleted.rows_affected() == 0 {
            return Err(ClaimStoreError::NotFound { kind: "job_claim", id: job_id.to_string() });
        }

        sqlx::query("UPDATE job_queue SET status = 'queued', robot_id = NULL, started_at = NULL WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(to_transient)?;

        tx.commit().await.map_err(to_transient)?;
        Ok(())
    }

    /// Sweeps leases past `lease_expires_at` back onto the queue
    /// (spec §4.4: "reclaimable once expired").
    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, ClaimStoreError> {
        let mut tx = self.pool.begin().await.map_err(to_transient)?;

        let expired = sqlx::query("DELETE FROM job_claim WHERE lease_expires_at < $1 RETURNING job_id")
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(to_transient)?;

        let ids: Vec<JobId> = expired.iter().map(|r| r.get("job_id")).collect();
        if !ids.is_empty() {
            sqlx::query("UPDATE job_queue SET status = 'queued', robot_id = NULL, started_at = NULL WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(to_transient)?;
        }

        tx.commit().await.map_err(to_transient)?;
        Ok(ids)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, ClaimStoreError> {
        let row = sqlx::query("SELECT * FROM job_queue WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_transient)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn cancel(&self, job_id: JobId, reason: Option<String>, now: DateTime<Utc>) -> Result<Job, ClaimStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = CASE WHEN status = 'running' THEN status ELSE 'cancelled' END,
                cancel_requested = CASE WHEN status = 'running' THEN TRUE ELSE cancel_requested END,
                completed_at = CASE WHEN status = 'running' THEN completed_at ELSE $3 END,
                error_message = COALESCE($2, error_message)
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled', 'timeout')
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(&reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(to_transient)?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(ClaimStoreError::NotFound { kind: "job", id: job_id.to_string() }),
        }
    }
}

/// Utility maintenance queries, carried over from the teacher's
/// `PgJobStore` (cleanup of old terminal rows) and extended with robot
/// registry persistence for crash recovery (spec §4.4, §8 "load existing
/// data").
impl PgClaimStore {
    pub async fn cleanup_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, ClaimStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_queue
            WHERE status IN ('completed', 'failed', 'cancelled', 'timeout')
              AND completed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(to_transient)?;

        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<QueueStats, ClaimStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'queued') as queued,
                COUNT(*) FILTER (WHERE status = 'running') as running,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM job_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(to_transient)?;

        Ok(QueueStats {
            pending: row.get("pending"),
            queued: row.get("queued"),
            running: row.get("running"),
            completed: row.get("completed"),
            failed: row.get("failed"),
        })
    }

    pub async fn upsert_robot(&self, robot: &rpa_orchestrator_core::robot::Robot) -> Result<(), ClaimStoreError> {
        sqlx::query(
            r#"
            INSERT INTO robots (id, name, environment, status, max_concurrent_jobs, current_jobs, last_heartbeat, last_seen)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                environment = EXCLUDED.environment,
                status = EXCLUDED.status,
                max_concurrent_jobs = EXCLUDED.max_concurrent_jobs,
                current_jobs = EXCLUDED.current_jobs,
                last_heartbeat = EXCLUDED.last_heartbeat,
                last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(robot.id)
        .bind(&robot.name)
        .bind(&robot.environment)
        .bind(robot_status_to_str(robot.status))
        .bind(robot.max_concurrent_jobs as i32)
        .bind(robot.current_jobs as i32)
        .bind(robot.last_heartbeat)
        .bind(robot.last_seen)
        .execute(&self.pool)
        .await
        .map_err(to_transient)?;
        Ok(())
    }

    /// Loads the robot registry snapshot at startup (spec §8 `_load_robots`).
    pub async fn load_robots(&self) -> Result<Vec<rpa_orchestrator_core::robot::Robot>, ClaimStoreError> {
        let rows = sqlx::query("SELECT * FROM robots").fetch_all(&self.pool).await.map_err(to_transient)?;
        rows.iter()
            .map(|row| {
                Ok(rpa_orchestrator_core::robot::Robot {
                    id: row.get("id"),
                    name: row.get("name"),
                    environment: row.get("environment"),
                    tags: Default::default(),
                    capabilities: Default::default(),
                    status: robot_status_from_str(row.get("status"))?,
                    max_concurrent_jobs: row.get::<i32, _>("max_concurrent_jobs") as u32,
                    current_jobs: row.get::<i32, _>("current_jobs") as u32,
                    last_heartbeat: row.get("last_heartbeat"),
                    last_seen: row.get("last_seen"),
                })
            })
            .collect()
    }
}

fn robot_status_to_str(status: rpa_orchestrator_core::robot::RobotStatus) -> &'static str {
    use rpa_orchestrator_core::robot::RobotStatus::*;
    match status {
        Online => "online",
        Busy => "busy",
        Offline => "offline",
        Error => "error",
    }
}

fn robot_status_from_str(value: &str) -> Result<rpa_orchestrator_core::robot::RobotStatus, ClaimStoreError> {
    use rpa_orchestrator_core::robot::RobotStatus::*;
    Ok(match value {
        "online" => Online,
        "busy" => Busy,
        "offline" => Offline,
        "error" => Error,
        other => {
            return Err(ClaimStoreError::Transient(anyhow::anyhow!("unrecognized robots.status value: {other}")))
        }
    })
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub pending: i64,
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}
