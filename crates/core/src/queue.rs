//! In-memory priority queue + state machine (spec §4.1).
//!
//! Guarded by a single coarse `tokio::sync::Mutex` (spec §5: "operations hold
//! the mutex only for bookkeeping, never across I/O"). State-change
//! callbacks run synchronously while the lock is held but are never allowed
//! to panic the queue: a callback panic is caught and logged.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

use crate::error::OrchestratorError;
use crate::job::{Job, JobId, JobPriority, JobStatus, RobotId, SubmitJobRequest};
use crate::robot::Robot;

/// Default dedup window (spec §4.1).
pub const DEFAULT_DEDUP_WINDOW_SECONDS: i64 = 300;

type StateChangeCallback = dyn Fn(&Job) + Send + Sync;

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timeout: usize,
    pub depth_by_priority: [usize; 4],
}

/// Heap entry ordered by `(priority desc, created_at asc)` (spec §4.1
/// "Ordering rule").
#[derive(Debug, Clone)]
struct QueueEntry {
    priority: JobPriority,
    created_at: DateTime<Utc>,
    job_id: JobId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id
    }
}
impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want higher priority first, and among
        // equal priorities the earlier created_at first, so invert time.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Candidates still eligible to dispatch (QUEUED and ready). Jobs leave
    /// this heap on dequeue/cancel/timeout; stale entries for jobs that have
    /// already left QUEUED are skipped lazily on pop.
    heap: BinaryHeap<QueueEntry>,
    /// fingerprint -> job id, scoped to the dedup window.
    dedup_index: HashMap<String, (JobId, DateTime<Utc>)>,
    dedup_window: ChronoDuration,
}

pub struct JobQueue {
    inner: Mutex<Inner>,
    on_state_change: Option<Arc<StateChangeCallback>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_dedup_window(ChronoDuration::seconds(DEFAULT_DEDUP_WINDOW_SECONDS))
    }

    pub fn with_dedup_window(dedup_window: ChronoDuration) -> Self {
        JobQueue {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                heap: BinaryHeap::new(),
                dedup_index: HashMap::new(),
                dedup_window,
            }),
            on_state_change: None,
        }
    }

    pub fn set_on_state_change<F>(&mut self, callback: F)
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
    }

    fn fire_callback(&self, job: &Job) {
        if let Some(cb) = &self.on_state_change {
            let cb = cb.clone();
            let job = job.clone();
            // Never let a misbehaving callback corrupt or abort queue state.
            if catch_unwind(AssertUnwindSafe(|| cb(&job))).is_err() {
                tracing::error!(job_id = %job.id, "state-change callback panicked, swallowing");
            }
        }
    }

    /// spec §4.1 `enqueue`.
    pub async fn enqueue(&self, req: SubmitJobRequest, now: DateTime<Utc>) -> Result<Job, OrchestratorError> {
        let mut inner = self.inner.lock().await;

        if req.check_duplicate {
            inner.purge_expired_dedup(now);
            if let Some((existing_id, _)) = inner.dedup_index.get(&crate::job::dedup_fingerprint(&req.workflow_id, &req.params)) {
                if let Some(existing) = inner.jobs.get(existing_id) {
                    if !existing.status.is_terminal() {
                        return Err(OrchestratorError::Duplicate {
                            fingerprint: existing.dedup_fingerprint.clone(),
                            existing_job_id: existing.id,
                        });
                    }
                }
            }
        }

        let job = Job::from_request(&req, now);
        if job.status == JobStatus::Queued {
            inner.heap.push(QueueEntry {
                priority: job.priority,
                created_at: job.created_at,
                job_id: job.id,
            });
        }
        inner
            .dedup_index
            .insert(job.dedup_fingerprint.clone(), (job.id, job.created_at));
        inner.jobs.insert(job.id, job.clone());
        drop(inner);

        self.fire_callback(&job);
        Ok(job)
    }

    /// Moves PENDING jobs whose `scheduled_time` has arrived into QUEUED.
    /// Called by the engine's timeout/dispatch tick.
    pub async fn promote_scheduled(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        let ready: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.is_ready(now))
            .map(|j| j.id)
            .collect();
        for id in ready {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.status = JobStatus::Queued;
                let entry = QueueEntry {
                    priority: job.priority,
                    created_at: job.created_at,
                    job_id: job.id,
                };
                inner.heap.push(entry);
            }
        }
    }

    /// spec §4.1 `dequeue`: highest-priority QUEUED job matching `robot`.
    pub async fn dequeue(&self, robot: &Robot, now: DateTime<Utc>) -> Option<Job> {
        let mut inner = self.inner.lock().await;

        // Lazily drain stale heap entries (already dequeued/cancelled jobs),
        // and collect candidates we skip past because they don't match this
        // robot so they can be restored.
        let mut skipped = Vec::new();
        let mut selected = None;

        while let Some(entry) = inner.heap.pop() {
            let matches = inner
                .jobs
                .get(&entry.job_id)
                .map(|j| j.status == JobStatus::Queued && j.is_ready(now) && j.matches_robot(robot))
                .unwrap_or(false);

            let still_queued = inner
                .jobs
                .get(&entry.job_id)
                .map(|j| j.status == JobStatus::Queued)
                .unwrap_or(false);

            if matches {
                selected = Some(entry);
                break;
            } else if still_queued {
                skipped.push(entry);
            }
            // else: stale entry for a job no longer QUEUED, drop it.
        }

        for entry in skipped {
            inner.heap.push(entry);
        }

        let entry = selected?;
        let job = inner.jobs.get_mut(&entry.job_id)?;
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.robot_id = Some(robot.id);
        let result = job.clone();
        drop(inner);

        self.fire_callback(&result);
        Some(result)
    }

    /// spec §4.1 `cancel`.
    pub async fn cancel(&self, job_id: JobId, reason: &str, now: DateTime<Utc>) -> Result<Job, OrchestratorError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "job",
                id: job_id.to_string(),
            })?;

        if job.status.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                job_id,
                from: job.status,
                to: JobStatus::Cancelled,
            });
        }

        if job.status == JobStatus::Running {
            // Cooperative: the robot observes this flag and the queue
            // transitions to CANCELLED only after it acknowledges (spec §5).
            job.cancel_requested = true;
            job.error_message = Some(reason.to_string());
            let result = job.clone();
            drop(inner);
            self.fire_callback(&result);
            return Ok(result);
        }

        job.status = JobStatus::Cancelled;
        job.completed_at = Some(now);
        job.error_message = Some(reason.to_string());
        let result = job.clone();
        drop(inner);
        self.fire_callback(&result);
        Ok(result)
    }

    /// spec §4.1 `complete`.
    pub async fn complete(&self, job_id: JobId, result: serde_json::Value, now: DateTime<Utc>) -> Result<Job, OrchestratorError> {
        self.finalize(job_id, JobStatus::Completed, Some(result), None, now).await
    }

    /// spec §4.1 `fail`.
    pub async fn fail(&self, job_id: JobId, err: &str, now: DateTime<Utc>) -> Result<Job, OrchestratorError> {
        self.finalize(job_id, JobStatus::Failed, None, Some(err.to_string()), now).await
    }

    async fn finalize(
        &self,
        job_id: JobId,
        to: JobStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Job, OrchestratorError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "job",
                id: job_id.to_string(),
            })?;

        if job.status.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                job_id,
                from: job.status,
                to,
            });
        }

        job.status = to;
        job.completed_at = Some(now);
        job.duration_ms = job.started_at.map(|s| (now - s).num_milliseconds());
        job.result = result;
        if error_message.is_some() {
            job.error_message = error_message;
        }
        let out = job.clone();
        drop(inner);
        self.fire_callback(&out);
        Ok(out)
    }

    /// spec §4.1 `update_progress`: bounded, idempotent (last-writer-wins),
    /// never overwrites a terminal status.
    pub async fn update_progress(&self, job_id: JobId, progress: u8, current_node: Option<String>) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "job",
                id: job_id.to_string(),
            })?;

        if job.status.is_terminal() {
            // Terminal-status monotonicity (spec §5): progress updates that
            // race a terminal settle are silently dropped, not errors.
            return Ok(());
        }

        job.progress = progress.min(100);
        if current_node.is_some() {
            job.current_node = current_node;
        }
        Ok(())
    }

    /// spec §4.1 `check_timeouts`.
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut inner = self.inner.lock().await;
        let timed_out: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running
                    && j.started_at
                        .map(|s| now - s > ChronoDuration::seconds(j.visibility_timeout_seconds))
                        .unwrap_or(false)
            })
            .map(|j| j.id)
            .collect();

        for id in &timed_out {
            if let Some(job) = inner.jobs.get_mut(id) {
                job.status = JobStatus::Timeout;
                job.completed_at = Some(now);
                job.duration_ms = job.started_at.map(|s| (now - s).num_milliseconds());
            }
        }
        drop(inner);

        for id in &timed_out {
            if let Some(job) = self.get(*id).await {
                self.fire_callback(&job);
            }
        }
        timed_out
    }

    pub async fn get(&self, job_id: JobId) -> Option<Job> {
        self.inner.lock().await.jobs.get(&job_id).cloned()
    }

    /// spec §4.1 `get_queue_stats`.
    pub async fn get_queue_stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats::default();
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Queued => {
                    stats.queued += 1;
                    let idx = match job.priority {
                        JobPriority::Low => 0,
                        JobPriority::Normal => 1,
                        JobPriority::High => 2,
                        JobPriority::Critical => 3,
                    };
                    stats.depth_by_priority[idx] += 1;
                }
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Timeout => stats.timeout += 1,
            }
        }
        stats
    }
}

impl Inner {
    fn purge_expired_dedup(&mut self, now: DateTime<Utc>) {
        self.dedup_index.retain(|_, (_, created_at)| now - *created_at <= self.dedup_window);
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns `robot_id` this job should dispatch to, for callers that don't
/// want to reimplement `matches_robot`.
pub fn targeted_robot(job: &Job) -> Option<RobotId> {
    job.robot_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn robot(max: u32) -> Robot {
        Robot::new(uuid::Uuid::new_v4(), "r1", "default", max, HashSet::new(), now())
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_roundtrip() {
        let q = JobQueue::new();
        let req = SubmitJobRequest::new("wf", "wf-name", json!({}));
        let job = q.enqueue(req, now()).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let r = robot(1);
        let dequeued = q.dequeue(&r, now()).await.unwrap();
        assert_eq!(dequeued.id, job.id);
        assert_eq!(dequeued.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        let q = JobQueue::new();
        let t0 = now();
        let mut normal = SubmitJobRequest::new("wf", "n", json!({"n":1}));
        normal.priority = JobPriority::Normal;
        let mut high = SubmitJobRequest::new("wf", "h", json!({"n":2}));
        high.priority = JobPriority::High;
        let mut critical = SubmitJobRequest::new("wf", "c", json!({"n":3}));
        critical.priority = JobPriority::Critical;

        let ja = q.enqueue(normal, t0).await.unwrap();
        let jb = q.enqueue(high, t0 + ChronoDuration::milliseconds(1)).await.unwrap();
        let jc = q.enqueue(critical, t0 + ChronoDuration::milliseconds(2)).await.unwrap();

        let r = robot(1);
        let first = q.dequeue(&r, now()).await.unwrap();
        assert_eq!(first.id, jc.id);
        q.complete(first.id, json!({}), now()).await.unwrap();

        let second = q.dequeue(&r, now()).await.unwrap();
        assert_eq!(second.id, jb.id);
        q.complete(second.id, json!({}), now()).await.unwrap();

        let third = q.dequeue(&r, now()).await.unwrap();
        assert_eq!(third.id, ja.id);
    }

    #[tokio::test]
    async fn dedup_rejects_within_window_accepts_after_terminal() {
        let q = JobQueue::new();
        let req = || SubmitJobRequest::new("wf", "n", json!({"x": 1}));

        let j1 = q.enqueue(req(), now()).await.unwrap();
        let err = q.enqueue(req(), now()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Duplicate { .. }));

        q.complete(j1.id, json!({}), now()).await.unwrap();
        let j3 = q.enqueue(req(), now()).await.unwrap();
        assert_ne!(j3.id, j1.id);
    }

    #[tokio::test]
    async fn targeted_job_invisible_to_other_robots() {
        let q = JobQueue::new();
        let target = uuid::Uuid::new_v4();
        let mut req = SubmitJobRequest::new("wf", "n", json!({}));
        req.robot_id = Some(target);
        q.enqueue(req, now()).await.unwrap();

        let other = robot(1);
        assert!(q.dequeue(&other, now()).await.is_none());

        let mut targeted_robot = robot(1);
        targeted_robot.id = target;
        assert!(q.dequeue(&targeted_robot, now()).await.is_some());
    }

    #[tokio::test]
    async fn environment_scoped_job_invisible_to_other_environments() {
        let q = JobQueue::new();
        let mut req = SubmitJobRequest::new("wf", "n", json!({}));
        req.environment = Some("prod".to_string());
        q.enqueue(req, now()).await.unwrap();

        let mut staging = robot(1);
        staging.environment = "staging".to_string();
        assert!(q.dequeue(&staging, now()).await.is_none());

        let mut prod = robot(1);
        prod.environment = "prod".to_string();
        assert!(q.dequeue(&prod, now()).await.is_some());
    }

    #[tokio::test]
    async fn terminal_states_reject_further_transitions() {
        let q = JobQueue::new();
        let req = SubmitJobRequest::new("wf", "n", json!({}));
        let job = q.enqueue(req, now()).await.unwrap();
        q.complete(job.id, json!({}), now()).await.unwrap();

        let err = q.fail(job.id, "late failure", now()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn check_timeouts_marks_running_overdue_jobs() {
        let q = JobQueue::new();
        let mut req = SubmitJobRequest::new("wf", "n", json!({}));
        req.visibility_timeout_seconds = 1;
        q.enqueue(req, now()).await.unwrap();

        let r = robot(1);
        let started_at = now() - ChronoDuration::seconds(5);
        let job = q.dequeue(&r, now()).await.unwrap();
        // Force started_at into the past to simulate elapsed time.
        {
            let mut inner = q.inner.lock().await;
            inner.jobs.get_mut(&job.id).unwrap().started_at = Some(started_at);
        }

        let timed_out = q.check_timeouts(now()).await;
        assert_eq!(timed_out, vec![job.id]);
        assert_eq!(q.get(job.id).await.unwrap().status, JobStatus::Timeout);
    }

    #[tokio::test]
    async fn progress_update_is_idempotent_and_bounded() {
        let q = JobQueue::new();
        let req = SubmitJobRequest::new("wf", "n", json!({}));
        let job = q.enqueue(req, now()).await.unwrap();
        let r = robot(1);
        q.dequeue(&r, now()).await.unwrap();

        q.update_progress(job.id, 150, Some("node-a".into())).await.unwrap();
        assert_eq!(q.get(job.id).await.unwrap().progress, 100);

        q.update_progress(job.id, 50, Some("node-b".into())).await.unwrap();
        q.update_progress(job.id, 50, Some("node-b".into())).await.unwrap();
        assert_eq!(q.get(job.id).await.unwrap().progress, 50);
    }

    #[tokio::test]
    async fn progress_update_never_overwrites_terminal() {
        let q = JobQueue::new();
        let req = SubmitJobRequest::new("wf", "n", json!({}));
        let job = q.enqueue(req, now()).await.unwrap();
        q.complete(job.id, json!({"ok": true}), now()).await.unwrap();

        q.update_progress(job.id, 10, None).await.unwrap();
        assert_eq!(q.get(job.id).await.unwrap().status, JobStatus::Completed);
    }
}
