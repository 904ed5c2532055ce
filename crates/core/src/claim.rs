//! Durable claim protocol: the seam between the in-memory queue and a
//! durable backing store (spec §4.4). `PgClaimStore` in the `postgres`
//! crate and the in-memory fake in the `testing` crate both implement
//! this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::ClaimStoreError;
use crate::job::{Job, JobId, JobPriority, JobStatus, RobotId};

pub type LeaseGeneration = i64;

/// A job handed out by the store together with the lease bookkeeping the
/// holder must present back on extend/settle to prove it still owns the
/// lease (spec §4.4: "generation returned on claim, checked on extend").
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub lease_generation: LeaseGeneration,
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EnqueueRecord {
    pub id: JobId,
    pub workflow_id: String,
    pub workflow_name: String,
    pub workflow_json: Value,
    pub priority: JobPriority,
    pub environment: Option<String>,
    pub scheduled_time: DateTime<Utc>,
    pub visibility_timeout_seconds: u32,
    pub dedup_fingerprint: Option<String>,
}

/// Durable counterpart of the in-memory `JobQueue`. Implementations must
/// provide at-most-once delivery: `claim_job` makes a job invisible to
/// every other caller until its lease expires, is released, or is
/// settled (spec §4.4).
#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn enqueue(&self, record: EnqueueRecord) -> Result<Job, ClaimStoreError>;

    /// Atomically claim up to `batch` ready jobs for `robot_id` in a single
    /// transaction, honoring targeted-robot jobs, pool membership via
    /// `eligible_workflow_ids` (`None` means "no workflow restriction"), and
    /// `environment` (`None` means "no environment restriction") — spec
    /// §4.4's `claim_job(robot_id, env, now, batch)`.
    async fn claim_job(
        &self,
        robot_id: RobotId,
        eligible_workflow_ids: Option<&[String]>,
        environment: Option<&str>,
        now: DateTime<Utc>,
        batch: usize,
    ) -> Result<Vec<ClaimedJob>, ClaimStoreError>;

    /// `extend_lease(job_id, robot_id, extension)`: fails with `LeaseLost`
    /// if `lease_generation` no longer matches what the store holds —
    /// another claim cycle already reclaimed the job (spec §4.4).
    async fn extend_lease(
        &self,
        job_id: JobId,
        robot_id: RobotId,
        lease_generation: LeaseGeneration,
        extension: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ClaimStoreError>;

    /// `settle(job_id, terminal_status, payload)`: one transaction that
    /// sets `job_queue.status` to a terminal state, writes the payload,
    /// and deletes the `job_claim` row (spec §4.4).
    async fn settle(
        &self,
        job_id: JobId,
        lease_generation: LeaseGeneration,
        terminal_status: JobStatus,
        result: Option<Value>,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Job, ClaimStoreError>;

    /// `release_job(job_id)`: resets `status = QUEUED` and deletes the
    /// claim row without settling — used when a robot voluntarily gives
    /// up (e.g. a state-affinity mismatch, spec §4.4/§4.5.4).
    async fn release_job(&self, job_id: JobId, lease_generation: LeaseGeneration) -> Result<(), ClaimStoreError>;

    /// Sweep leases past `lease_expires_at` back onto the queue. Returns
    /// the ids reclaimed so callers can log/alert (spec §4.4).
    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, ClaimStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, ClaimStoreError>;

    async fn cancel(&self, job_id: JobId, reason: Option<String>, now: DateTime<Utc>) -> Result<Job, ClaimStoreError>;
}

pub type SharedClaimStore = std::sync::Arc<dyn ClaimStore>;
