//! In-memory [`ClaimStore`] and fixtures for exercising the orchestrator
//! without a database, grounded on `rpa_orchestrator_postgres::PgClaimStore`
//! (same method semantics, a `HashMap` instead of tables) so scenario tests
//! in `tests/scenarios.rs` and the robot/core test suites can run the real
//! claim protocol synchronously.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rpa_orchestrator_core::claim::{ClaimStore, ClaimedJob, EnqueueRecord, LeaseGeneration};
use rpa_orchestrator_core::error::ClaimStoreError;
use rpa_orchestrator_core::job::{Job, JobId, JobStatus, RobotId};
use tokio::sync::Mutex;
use uuid::Uuid;

struct ClaimEntry {
    robot_id: RobotId,
    lease_generation: LeaseGeneration,
    lease_expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    claims: HashMap<JobId, ClaimEntry>,
    dedup: HashMap<String, JobId>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Single-process stand-in for [`rpa_orchestrator_postgres::PgClaimStore`].
pub struct InMemoryClaimStore {
    inner: Mutex<Inner>,
    next_generation: AtomicI64,
}

impl InMemoryClaimStore {
    pub fn new() -> Self {
        InMemoryClaimStore { inner: Mutex::new(Inner::default()), next_generation: AtomicI64::new(1) }
    }

    pub async fn stats(&self) -> Stats {
        let inner = self.inner.lock().await;
        let mut stats = Stats::default();
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled | JobStatus::Timeout => stats.cancelled += 1,
            }
        }
        stats
    }
}

impl Default for InMemoryClaimStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClaimStore for InMemoryClaimStore {
    async fn enqueue(&self, record: EnqueueRecord) -> Result<Job, ClaimStoreError> {
        let mut inner = self.inner.lock().await;

        if let Some(fingerprint) = &record.dedup_fingerprint {
            if let Some(existing_id) = inner.dedup.get(fingerprint) {
                if let Some(existing) = inner.jobs.get(existing_id) {
                    if !existing.status.is_terminal() {
                        return Err(ClaimStoreError::Transient(anyhow::anyhow!(
                            "duplicate job: fingerprint {fingerprint} already queued as {existing_id}"
                        )));
                    }
                }
            }
        }

        let now = Utc::now();
        let status = if record.scheduled_time > now { JobStatus::Pending } else { JobStatus::Queued };
        let job = Job {
            id: record.id,
            workflow_id: record.workflow_id,
            workflow_name: record.workflow_name,
            workflow_json: record.workflow_json,
            priority: record.priority,
            status,
            robot_id: None,
            environment: record.environment,
            scheduled_time: Some(record.scheduled_time),
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            progress: 0,
            current_node: None,
            result: None,
            error_message: None,
            retry_count: 0,
            visibility_timeout_seconds: record.visibility_timeout_seconds as i64,
            dedup_fingerprint: record.dedup_fingerprint.clone().unwrap_or_default(),
            cancel_requested: false,
        };

        if let Some(fingerprint) = &record.dedup_fingerprint {
            inner.dedup.insert(fingerprint.clone(), job.id);
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_job(
        &self,
        robot_id: RobotId,
        eligible_workflow_ids: Option<&[String]>,
        environment: Option<&str>,
        now: DateTime<Utc>,
        batch: usize,
    ) -> Result<Vec<ClaimedJob>, ClaimStoreError> {
        let mut inner = self.inner.lock().await;

        let mut candidates: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Queued
                    && j.scheduled_time.map(|t| t <= now).unwrap_or(true)
                    && j.robot_id.map(|r| r == robot_id).unwrap_or(true)
                    && environment.map(|env| j.matches_environment(env)).unwrap_or(true)
                    && eligible_workflow_ids.map(|ids| ids.iter().any(|id| id == &j.workflow_id)).unwrap_or(true)
            })
            .map(|j| j.id)
            .collect();
        candidates.sort_by(|a, b| {
            let ja = &inner.jobs[a];
            let jb = &inner.jobs[b];
            jb.priority.cmp(&ja.priority).then_with(|| ja.created_at.cmp(&jb.created_at))
        });
        candidates.truncate(batch);

        let mut claimed = Vec::with_capacity(candidates.len());
        for job_id in candidates {
            let lease_generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
            let job = inner.jobs.get_mut(&job_id).expect("candidate vanished under lock");
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.robot_id = Some(robot_id);
            let lease_expires_at = now + Duration::seconds(job.visibility_timeout_seconds);
            let job = job.clone();

            inner.claims.insert(job_id, ClaimEntry { robot_id, lease_generation, lease_expires_at });
            claimed.push(ClaimedJob { job, lease_generation, lease_expires_at });
        }

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
        let mut inner = self.inner.lock().await;
        let entry = inner.claims.get_mut(&job_id).filter(|e| e.robot_id == robot_id && e.lease_generation == lease_generation);
        match entry {
            Some(entry) => {
                entry.lease_expires_at = now + extension;
                Ok(entry.lease_expires_at)
            }
            None => Err(ClaimStoreError::LeaseLost { job_id, robot_id }),
        }
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
        let mut inner = self.inner.lock().await;

        let claim = inner.claims.get(&job_id).filter(|e| e.lease_generation == lease_generation);
        if claim.is_none() {
            let robot_id = inner.claims.get(&job_id).map(|e| e.robot_id).unwrap_or(Uuid::nil());
            return Err(ClaimStoreError::LeaseLost { job_id, robot_id });
        }
        inner.claims.remove(&job_id);

        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| ClaimStoreError::NotFound { kind: "job", id: job_id.to_string() })?;
        job.status = terminal_status;
        job.completed_at = Some(now);
        job.duration_ms = job.started_at.map(|s| (now - s).num_milliseconds());
        job.result = result;
        if error_message.is_some() {
            job.error_message = error_message;
        }
        Ok(job.clone())
    }

    async fn release_job(&self, job_id: JobId, lease_generation: LeaseGeneration) -> Result<(), ClaimStoreError> {
        let mut inner = self.inner.lock().await;
        let matches = inner.claims.get(&job_id).map(|e| e.lease_generation == lease_generation).unwrap_or(false);
        if !matches {
            return Err(ClaimStoreError::NotFound { kind: "job_claim", id: job_id.to_string() });
        }
        inner.claims.remove(&job_id);

        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.status = JobStatus::Queued;
            job.robot_id = None;
            job.started_at = None;
        }
        Ok(())
    }

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, ClaimStoreError> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<JobId> =
            inner.claims.iter().filter(|(_, e)| e.lease_expires_at < now).map(|(id, _)| *id).collect();

        for id in &expired {
            inner.claims.remove(id);
            if let Some(job) = inner.jobs.get_mut(id) {
                job.status = JobStatus::Queued;
                job.robot_id = None;
                job.started_at = None;
            }
        }
        Ok(expired)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, ClaimStoreError> {
        Ok(self.inner.lock().await.jobs.get(&job_id).cloned())
    }

    async fn cancel(&self, job_id: JobId, reason: Option<String>, now: DateTime<Utc>) -> Result<Job, ClaimStoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| ClaimStoreError::NotFound { kind: "job", id: job_id.to_string() })?;

        if job.status.is_terminal() {
            return Err(ClaimStoreError::NotFound { kind: "job", id: job_id.to_string() });
        }

        if job.status == JobStatus::Running {
            job.cancel_requested = true;
            job.error_message = reason;
        } else {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(now);
            job.error_message = reason;
        }
        Ok(job.clone())
    }
}

/// Fixtures shared by scenario and unit tests.
pub mod fixtures {
    use chrono::{DateTime, Utc};
    use rpa_orchestrator_core::claim::EnqueueRecord;
    use rpa_orchestrator_core::job::JobPriority;
    use rpa_orchestrator_core::robot::Robot;
    use std::collections::HashSet;
    use uuid::Uuid;

    pub fn robot(name: &str, max_concurrent_jobs: u32) -> Robot {
        Robot::new(Uuid::new_v4(), name, "test", max_concurrent_jobs, HashSet::new(), Utc::now())
    }

    pub fn enqueue_record(workflow_id: &str, scheduled_time: DateTime<Utc>) -> EnqueueRecord {
        EnqueueRecord {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.to_string(),
            workflow_name: workflow_id.to_string(),
            workflow_json: serde_json::json!({}),
            priority: JobPriority::Normal,
            environment: None,
            scheduled_time,
            visibility_timeout_seconds: 30,
            dedup_fingerprint: None,
        }
    }
}
