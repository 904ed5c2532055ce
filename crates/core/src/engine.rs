//! `OrchestratorEngine`: wires the queue, dispatcher, scheduler, claim
//! store and realtime channel into the single facade external callers
//! use (spec §8). Background loops (dispatch, timeout sweep, health
//! check, lease reap) are plain tokio tasks spawned from `start` and
//! stopped from `stop`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::claim::SharedClaimStore;
use crate::dispatcher::{Dispatcher, DispatcherConfig, SharedDispatcher};
use crate::error::OrchestratorError;
use crate::job::{Job, JobId, RobotId, SubmitJobRequest};
use crate::queue::JobQueue;
use crate::realtime::{RealtimeEvent, SharedRealtimeChannel};
use crate::robot::Robot;
use crate::scheduler::{Schedule, ScheduleId, Scheduler, SchedulerConfig};

pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub scheduler: SchedulerConfig,
    pub dispatch_interval: StdDuration,
    pub timeout_check_interval: StdDuration,
    pub scheduler_tick_interval: StdDuration,
    pub lease_reap_interval: StdDuration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            dispatcher: DispatcherConfig::default(),
            scheduler: SchedulerConfig::default(),
            dispatch_interval: StdDuration::from_secs(5),
            timeout_check_interval: StdDuration::from_secs(30),
            scheduler_tick_interval: StdDuration::from_secs(1),
            lease_reap_interval: StdDuration::from_secs(10),
        }
    }
}

/// The primary interface for job, robot, and schedule management
/// (spec §8: "OrchestratorEngine is the external API surface").
pub struct OrchestratorEngine {
    queue: Arc<JobQueue>,
    dispatcher: SharedDispatcher,
    scheduler: Arc<Scheduler>,
    claim_store: Option<SharedClaimStore>,
    realtime: Option<SharedRealtimeChannel>,
    config: EngineConfig,
    shutdown: Arc<Notify>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

pub struct EngineBuilder {
    claim_store: Option<SharedClaimStore>,
    realtime: Option<SharedRealtimeChannel>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder {
            claim_store: None,
            realtime: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_claim_store(mut self, store: SharedClaimStore) -> Self {
        self.claim_store = Some(store);
        self
    }

    pub fn with_realtime_channel(mut self, channel: SharedRealtimeChannel) -> Self {
        self.realtime = Some(channel);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> OrchestratorEngine {
        let realtime = self.realtime.clone();
        let mut queue = JobQueue::new();
        if let Some(channel) = realtime.clone() {
            queue.set_on_state_change(move |job| {
                let channel = channel.clone();
                let event = state_change_event(job);
                tokio::spawn(async move {
                    if let Err(e) = channel.publish(event).await {
                        tracing::warn!(error = %e, "failed to publish job state change");
                    }
                });
            });
        }
        let queue = Arc::new(queue);

        let mut scheduler = Scheduler::new(self.config.scheduler.clone());
        let trigger_queue = queue.clone();
        let trigger_claim_store = self.claim_store.clone();
        let trigger_realtime = realtime.clone();
        scheduler.set_on_trigger(move |schedule| {
            let queue = trigger_queue.clone();
            let claim_store = trigger_claim_store.clone();
            let realtime = trigger_realtime.clone();
            let request = SubmitJobRequest {
                priority: schedule.priority,
                check_duplicate: true,
                ..SubmitJobRequest::new(schedule.workflow_id.clone(), schedule.name.clone(), Value::Null)
            };
            tokio::spawn(async move {
                if let Err(e) = submit(&queue, claim_store.as_ref(), realtime.as_ref(), request).await {
                    tracing::warn!(schedule_id = %schedule.id, error = %e, "schedule trigger failed to submit job");
                }
            });
            Ok(())
        });

        OrchestratorEngine {
            queue,
            dispatcher: Arc::new(Dispatcher::new(self.config.dispatcher.clone())),
            scheduler: Arc::new(scheduler),
            claim_store: self.claim_store,
            realtime,
            config: self.config,
            shutdown: Arc::new(Notify::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn state_change_event(job: &Job) -> RealtimeEvent {
    use crate::job::JobStatus::*;
    match job.status {
        Queued => RealtimeEvent::JobQueued { job_id: job.id, workflow_id: job.workflow_id.clone() },
        Running => RealtimeEvent::JobAssigned {
            job_id: job.id,
            robot_id: job.robot_id.unwrap_or_default(),
        },
        Completed => RealtimeEvent::JobCompleted { job_id: job.id, result: job.result.clone() },
        Failed => RealtimeEvent::JobFailed {
            job_id: job.id,
            error_message: job.error_message.clone().unwrap_or_default(),
        },
        Cancelled => RealtimeEvent::JobCancelled { job_id: job.id, reason: job.error_message.clone() },
        Timeout => RealtimeEvent::JobFailed {
            job_id: job.id,
            error_message: "timed out".to_string(),
        },
        Pending => RealtimeEvent::JobQueued { job_id: job.id, workflow_id: job.workflow_id.clone() },
    }
}

impl OrchestratorEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn dispatcher(&self) -> &SharedDispatcher {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    // ==================== LIFECYCLE ====================

    /// Spawns the dispatch, timeout-sweep, scheduler-tick, health-check, and
    /// (when a claim store is configured) lease-reap background loops.
    pub async fn start(&self) {
        let mut tasks = Vec::new();

        tasks.push(self.spawn_dispatch_loop());
        tasks.push(self.spawn_timeout_loop());
        tasks.push(self.spawn_scheduler_loop());
        tasks.push(self.spawn_health_check_loop());
        if self.claim_store.is_some() {
            tasks.push(self.spawn_lease_reap_loop());
        }

        *self.tasks.lock().expect("tasks lock poisoned") = tasks;
        tracing::info!("orchestrator engine started");
    }

    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().expect("tasks lock poisoned"));
        for task in tasks {
            task.abort();
        }
        tracing::info!("orchestrator engine stopped");
    }

    fn spawn_dispatch_loop(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let dispatcher = self.dispatcher.clone();
        let interval = self.config.dispatch_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.notified() => break,
                }
                let now = Utc::now();
                queue.promote_scheduled(now).await;
                for robot in dispatcher.available_robots(now) {
                    if let Some(job) = queue.dequeue(&robot, now).await {
                        dispatcher.increment_current_jobs(robot.id);
                        tracing::debug!(job_id = %job.id, robot_id = %robot.id, "job dispatched in-memory");
                    }
                }
            }
        })
    }

    fn spawn_timeout_loop(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let interval = self.config.timeout_check_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.notified() => break,
                }
                let timed_out = queue.check_timeouts(Utc::now()).await;
                if !timed_out.is_empty() {
                    tracing::warn!(count = timed_out.len(), "jobs timed out");
                }
            }
        })
    }

    fn spawn_scheduler_loop(&self) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let interval = self.config.scheduler_tick_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.notified() => break,
                }
                if let Err(e) = scheduler.tick(Utc::now()).await {
                    tracing::error!(error = %e, "scheduler tick failed");
                }
            }
        })
    }

    /// spec §4.3 health-check loop: independent of the dispatch loop, marks
    /// robots with stale heartbeats OFFLINE and announces the change.
    fn spawn_health_check_loop(&self) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let realtime = self.realtime.clone();
        let interval = self.config.dispatcher.health_check_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.notified() => break,
                }
                let newly_offline = dispatcher.check_robot_health(Utc::now());
                for robot_id in newly_offline {
                    tracing::warn!(robot_id = %robot_id, "robot marked offline after stale heartbeat");
                    publish(realtime.as_ref(), RealtimeEvent::RobotOffline { robot_id }).await;
                }
            }
        })
    }

    fn spawn_lease_reap_loop(&self) -> JoinHandle<()> {
        let store = self.claim_store.clone().expect("lease reap loop requires a claim store");
        let interval = self.config.lease_reap_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.notified() => break,
                }
                match store.reap_expired_leases(Utc::now()).await {
                    Ok(reaped) if !reaped.is_empty() => {
                        tracing::warn!(count = reaped.len(), "reaped expired leases");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "lease reap failed"),
                }
            }
        })
    }

    // ==================== JOBS ====================

    pub async fn submit_job(&self, request: SubmitJobRequest) -> Result<Job, OrchestratorError> {
        submit(&self.queue, self.claim_store.as_ref(), self.realtime.as_ref(), request).await
    }

    pub async fn cancel_job(&self, job_id: JobId, reason: Option<String>) -> Result<Job, OrchestratorError> {
        let reason = reason.unwrap_or_else(|| "cancelled".to_string());
        let job = self.queue.cancel(job_id, &reason, Utc::now()).await?;
        if job.status.is_terminal() {
            if let Some(robot_id) = job.robot_id {
                self.dispatcher.decrement_current_jobs(robot_id);
            }
        }
        Ok(job)
    }

    pub async fn update_job_progress(
        &self,
        job_id: JobId,
        progress: u8,
        current_node: Option<String>,
    ) -> Result<(), OrchestratorError> {
        self.queue.update_progress(job_id, progress, current_node.clone()).await?;
        self.publish(RealtimeEvent::JobProgress { job_id, progress, current_node }).await;
        Ok(())
    }

    pub async fn complete_job(&self, job_id: JobId, result: Option<Value>) -> Result<Job, OrchestratorError> {
        let job = self.queue.complete(job_id, result.unwrap_or(Value::Null), Utc::now()).await?;
        if let Some(robot_id) = job.robot_id {
            self.dispatcher.decrement_current_jobs(robot_id);
            self.dispatcher.record_job_result(&job, true);
        }
        Ok(job)
    }

    pub async fn fail_job(&self, job_id: JobId, error_message: String) -> Result<Job, OrchestratorError> {
        let job = self.queue.fail(job_id, &error_message, Utc::now()).await?;
        if let Some(robot_id) = job.robot_id {
            self.dispatcher.decrement_current_jobs(robot_id);
            self.dispatcher.record_job_result(&job, false);
        }
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Option<Job> {
        self.queue.get(job_id).await
    }

    // ==================== ROBOTS ====================

    pub fn register_robot(&self, robot: Robot) {
        self.dispatcher.register_robot(robot);
    }

    pub fn robot_heartbeat(&self, robot_id: RobotId) {
        self.dispatcher.heartbeat(robot_id, Utc::now());
    }

    pub fn deregister_robot(&self, robot_id: RobotId) {
        self.dispatcher.unregister_robot(robot_id);
    }

    // ==================== SCHEDULES ====================

    pub async fn create_schedule(&self, schedule: Schedule) -> Result<Schedule, OrchestratorError> {
        self.scheduler.add(schedule, Utc::now()).await
    }

    pub async fn toggle_schedule(&self, schedule_id: ScheduleId, enabled: bool) -> Result<(), OrchestratorError> {
        self.scheduler.set_enabled(schedule_id, enabled).await
    }

    pub async fn delete_schedule(&self, schedule_id: ScheduleId) -> Option<Schedule> {
        self.scheduler.remove(schedule_id).await
    }

    async fn publish(&self, event: RealtimeEvent) {
        publish(self.realtime.as_ref(), event).await;
    }
}

async fn publish(realtime: Option<&SharedRealtimeChannel>, event: RealtimeEvent) {
    if let Some(channel) = realtime {
        if let Err(e) = channel.publish(event).await {
            tracing::warn!(error = %e, "failed to publish realtime event");
        }
    }
}

/// Shared by [`OrchestratorEngine::submit_job`] and the scheduler trigger
/// callback: routes through the claim store (with dedup fingerprinting)
/// when one is configured, otherwise the in-memory queue (spec §4.2/§4.4).
async fn submit(
    queue: &JobQueue,
    claim_store: Option<&SharedClaimStore>,
    realtime: Option<&SharedRealtimeChannel>,
    request: SubmitJobRequest,
) -> Result<Job, OrchestratorError> {
    let now = Utc::now();
    if let Some(store) = claim_store {
        let fingerprint = if request.check_duplicate {
            Some(crate::job::dedup_fingerprint(&request.workflow_id, &request.params))
        } else {
            None
        };
        let record = crate::claim::EnqueueRecord {
            id: uuid::Uuid::new_v4(),
            workflow_id: request.workflow_id.clone(),
            workflow_name: request.workflow_name.clone(),
            workflow_json: request.workflow_json.clone(),
            priority: request.priority,
            environment: request.environment.clone(),
            scheduled_time: request.scheduled_time.unwrap_or(now),
            visibility_timeout_seconds: request.visibility_timeout_seconds as u32,
            dedup_fingerprint: fingerprint,
        };
        let job = store.enqueue(record).await.map_err(|e| OrchestratorError::ConfigurationError(e.to_string()))?;
        publish(realtime, RealtimeEvent::JobQueued { job_id: job.id, workflow_id: job.workflow_id.clone() }).await;
        return Ok(job);
    }

    queue.enqueue(request, now).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::{RealtimeChannel, Subscription};
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    struct RecordingChannel {
        tx: mpsc::UnboundedSender<RealtimeEvent>,
    }

    struct RecordingSubscription {
        rx: mpsc::UnboundedReceiver<RealtimeEvent>,
    }

    #[async_trait::async_trait]
    impl Subscription for RecordingSubscription {
        async fn recv(&mut self) -> Result<RealtimeEvent, crate::error::RealtimeError> {
            self.rx.recv().await.ok_or(crate::error::RealtimeError::Closed)
        }
    }

    #[async_trait::async_trait]
    impl RealtimeChannel for RecordingChannel {
        async fn publish(&self, event: RealtimeEvent) -> Result<(), crate::error::RealtimeError> {
            let _ = self.tx.send(event);
            Ok(())
        }

        async fn subscribe(&self, _topic: &str) -> Result<Box<dyn Subscription>, crate::error::RealtimeError> {
            unimplemented!("tests only publish through this fake")
        }
    }

    fn make_robot(max_jobs: u32) -> Robot {
        Robot::new(uuid::Uuid::new_v4(), "r1", "prod", max_jobs, HashSet::new(), Utc::now())
    }

    #[tokio::test]
    async fn submit_job_publishes_queued_event_via_queue_callback() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel: SharedRealtimeChannel = Arc::new(RecordingChannel { tx });
        let engine = OrchestratorEngine::builder().with_realtime_channel(channel).build();

        let job = engine
            .submit_job(SubmitJobRequest::new("wf-1", "Invoice", serde_json::json!({})))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        match event {
            RealtimeEvent::JobQueued { job_id, .. } => assert_eq!(job_id, job.id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_job_releases_dispatcher_capacity() {
        let engine = OrchestratorEngine::builder().build();
        let robot = make_robot(1);
        engine.register_robot(robot.clone());

        let job = engine
            .submit_job(SubmitJobRequest::new("wf-1", "Invoice", serde_json::json!({})))
            .await
            .unwrap();
        let claimed = engine.queue().dequeue(&robot, Utc::now()).await.unwrap();
        engine.dispatcher().increment_current_jobs(robot.id);
        assert_eq!(engine.dispatcher().get_robot(robot.id).unwrap().current_jobs, 1);

        engine.complete_job(claimed.id, Some(serde_json::json!({"ok": true}))).await.unwrap();
        assert_eq!(engine.dispatcher().get_robot(robot.id).unwrap().current_jobs, 0);
        let job = engine.get_job(job.id).await.unwrap();
        assert_eq!(job.status, crate::job::JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_job_is_idempotent_against_terminal_state() {
        let engine = OrchestratorEngine::builder().build();
        let job = engine
            .submit_job(SubmitJobRequest::new("wf-1", "Invoice", serde_json::json!({})))
            .await
            .unwrap();

        let cancelled = engine.cancel_job(job.id, Some("no longer needed".to_string())).await.unwrap();
        assert_eq!(cancelled.status, crate::job::JobStatus::Cancelled);
        assert!(engine.cancel_job(job.id, None).await.is_err());
    }
}

