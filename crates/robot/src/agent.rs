//! The per-worker process owning a set of in-flight jobs (spec §4.5),
//! grounded on `robot_agent.py`/`distributed_agent.py` for the lifecycle and
//! loop shapes, and on the `Notify`-gated tick loop already used by
//! `rpa_orchestrator_core::engine::OrchestratorEngine` for the idiomatic
//! Rust async-loop structure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rpa_orchestrator_core::claim::{ClaimedJob, LeaseGeneration, SharedClaimStore};
use rpa_orchestrator_core::error::{claim_loop_backoff, ClaimStoreError};
use rpa_orchestrator_core::job::{Job, JobId, JobStatus};
use rpa_orchestrator_core::realtime::{recv_with_timeout, RealtimeEvent, SharedRealtimeChannel, Subscription};
use rpa_orchestrator_core::robot::{Robot, RobotStatus};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::affinity::AffinityTable;
use crate::config::RobotAgentConfig;
use crate::executor::{CancelFlag, Executor, ExecutorError, ProgressTick};
use crate::registry::RobotRegistry;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

struct InFlightJob {
    lease_generation: LeaseGeneration,
    visibility_timeout: ChronoDuration,
    cancel: CancelFlag,
}

pub struct RobotAgentBuilder {
    config: RobotAgentConfig,
    claim_store: SharedClaimStore,
    executor: Arc<dyn Executor>,
    realtime: Option<SharedRealtimeChannel>,
    registry: Option<Arc<dyn RobotRegistry>>,
}

impl RobotAgentBuilder {
    pub fn new(config: RobotAgentConfig, claim_store: SharedClaimStore, executor: Arc<dyn Executor>) -> Self {
        RobotAgentBuilder { config, claim_store, executor, realtime: None, registry: None }
    }

    pub fn with_realtime_channel(mut self, channel: SharedRealtimeChannel) -> Self {
        self.realtime = Some(channel);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn RobotRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<RobotAgent, AgentError> {
        self.config.validate()?;
        Ok(RobotAgent {
            config: self.config,
            claim_store: self.claim_store,
            executor: self.executor,
            realtime: self.realtime,
            registry: self.registry,
            state: Arc::new(AsyncMutex::new(AgentState::Stopped)),
            in_flight: Arc::new(AsyncMutex::new(HashMap::new())),
            affinity: Arc::new(AffinityTable::new()),
            current_jobs: Arc::new(AtomicU32::new(0)),
            shutdown: Arc::new(Notify::new()),
            tasks: AsyncMutex::new(Vec::new()),
        })
    }
}

/// Owns the claim/heartbeat/presence loops for one robot. Construct via
/// [`RobotAgentBuilder`].
pub struct RobotAgent {
    config: RobotAgentConfig,
    claim_store: SharedClaimStore,
    executor: Arc<dyn Executor>,
    realtime: Option<SharedRealtimeChannel>,
    registry: Option<Arc<dyn RobotRegistry>>,
    state: Arc<AsyncMutex<AgentState>>,
    in_flight: Arc<AsyncMutex<HashMap<JobId, InFlightJob>>>,
    affinity: Arc<AffinityTable>,
    current_jobs: Arc<AtomicU32>,
    shutdown: Arc<Notify>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl RobotAgent {
    pub fn config(&self) -> &RobotAgentConfig {
        &self.config
    }

    pub fn affinity(&self) -> &Arc<AffinityTable> {
        &self.affinity
    }

    pub async fn state(&self) -> AgentState {
        *self.state.lock().await
    }

    fn snapshot(&self, status: RobotStatus, now: chrono::DateTime<Utc>) -> Robot {
        Robot {
            id: self.config.robot_id,
            name: self.config.robot_name.clone(),
            environment: self.config.environment.clone(),
            tags: self.config.tags.clone(),
            capabilities: Default::default(),
            status,
            max_concurrent_jobs: self.config.max_concurrent_jobs,
            current_jobs: self.current_jobs.load(Ordering::SeqCst),
            last_heartbeat: now,
            last_seen: now,
        }
    }

    /// Startup sequence (spec §4.5): validate config (done at build time),
    /// upsert the robots row, connect to realtime best-effort, spawn the
    /// claim/heartbeat/presence loops, transition to RUNNING. Signal
    /// handling is left to [`RobotAgent::run_until_shutdown`] so `start`
    /// stays usable from tests without installing process-wide handlers.
    pub async fn start(&self) -> Result<(), AgentError> {
        {
            let mut state = self.state.lock().await;
            if *state != AgentState::Stopped {
                return Err(AgentError::AlreadyRunning);
            }
            *state = AgentState::Starting;
        }

        let now = Utc::now();
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.register(&self.snapshot(RobotStatus::Online, now)).await {
                tracing::warn!(error = %e, "failed to register robot at startup, continuing");
            }
        }

        let jobs_subscription = match &self.realtime {
            Some(channel) => match channel.subscribe("jobs").await {
                Ok(sub) => Some(sub),
                Err(e) => {
                    tracing::warn!(error = %e, "realtime unavailable at startup, continuing in poll-only mode");
                    None
                }
            },
            None => None,
        };

        let mut tasks = Vec::new();
        tasks.push(self.spawn_claim_loop(jobs_subscription));
        tasks.push(self.spawn_heartbeat_loop());
        tasks.push(self.spawn_presence_loop());
        *self.tasks.lock().await = tasks;

        *self.state.lock().await = AgentState::Running;
        tracing::info!(robot_id = %self.config.robot_id, "robot agent started");
        Ok(())
    }

    /// Blocks until SIGINT/SIGTERM, then runs graceful shutdown.
    #[cfg(unix)]
    pub async fn run_until_shutdown(&self) {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        self.stop().await;
    }

    #[cfg(not(unix))]
    pub async fn run_until_shutdown(&self) {
        let _ = tokio::signal::ctrl_c().await;
        self.stop().await;
    }

    /// Graceful shutdown (spec §4.5.5): stop accepting new claims, wait up
    /// to `graceful_shutdown` for in-flight executions to finish naturally,
    /// then abandon whatever is left (their leases expire for reclaim).
    pub async fn stop(&self) {
        *self.state.lock().await = AgentState::ShuttingDown;
        self.shutdown.notify_waiters();

        let deadline = tokio::time::Instant::now() + self.config.graceful_shutdown;
        loop {
            if self.in_flight.lock().await.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let remaining = self.in_flight.lock().await.len();
                tracing::warn!(remaining, "graceful shutdown deadline hit, abandoning in-flight jobs");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            task.abort();
        }

        let now = Utc::now();
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.touch_presence(self.config.robot_id, RobotStatus::Offline, 0, now).await {
                tracing::warn!(error = %e, "failed to mark robot offline on shutdown");
            }
        }

        *self.state.lock().await = AgentState::Stopped;
        tracing::info!(robot_id = %self.config.robot_id, "robot agent stopped");
    }

    fn spawn_claim_loop(&self, mut jobs_subscription: Option<Box<dyn Subscription>>) -> JoinHandle<()> {
        let claim_store = self.claim_store.clone();
        let executor = self.executor.clone();
        let in_flight = self.in_flight.clone();
        let affinity = self.affinity.clone();
        let current_jobs = self.current_jobs.clone();
        let realtime = self.realtime.clone();
        let shutdown = self.shutdown.clone();
        let config = self.config.clone();
        let robot_id = config.robot_id;

        tokio::spawn(async move {
            let mut backoff = claim_loop_backoff(config.poll_interval);
            loop {
                if current_jobs.load(Ordering::SeqCst) >= config.max_concurrent_jobs {
                    tokio::select! {
                        _ = tokio::time::sleep(config.poll_interval) => {}
                        _ = shutdown.notified() => break,
                    }
                    continue;
                }

                let notified = match jobs_subscription.as_mut() {
                    Some(sub) => {
                        match recv_with_timeout(sub.as_mut(), config.subscribe_timeout).await {
                            Some(RealtimeEvent::JobCancelled { job_id, .. }) => {
                                if let Some(entry) = in_flight.lock().await.get(&job_id) {
                                    entry.cancel.set();
                                }
                                true
                            }
                            Some(_) => true,
                            None => false,
                        }
                    }
                    None => {
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        false
                    }
                };

                let now = Utc::now();
                let batch = config.max_concurrent_jobs.saturating_sub(current_jobs.load(Ordering::SeqCst)) as usize;
                match claim_store.claim_job(robot_id, None, Some(config.environment.as_str()), now, batch).await {
                    Ok(claimed_jobs) if !claimed_jobs.is_empty() => {
                        backoff.reset();
                        for claimed in claimed_jobs {
                            if affinity.conflicts(&claimed.job.workflow_id, robot_id, now) {
                                tracing::debug!(job_id = %claimed.job.id, "releasing job: affinitied to another robot");
                                if let Err(e) = claim_store.release_job(claimed.job.id, claimed.lease_generation).await {
                                    tracing::warn!(error = %e, "failed to release affinitied job");
                                }
                                continue;
                            }
                            current_jobs.fetch_add(1, Ordering::SeqCst);
                            spawn_execution(
                                claimed,
                                claim_store.clone(),
                                executor.clone(),
                                in_flight.clone(),
                                current_jobs.clone(),
                                realtime.clone(),
                                config.job_timeout,
                            );
                        }
                    }
                    Ok(_) => {
                        if !notified {
                            tokio::select! {
                                _ = tokio::time::sleep(backoff.next_delay()) => {}
                                _ = shutdown.notified() => break,
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "claim_job failed, backing off");
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        })
    }

    fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let claim_store = self.claim_store.clone();
        let in_flight = self.in_flight.clone();
        let current_jobs = self.current_jobs.clone();
        let interval = self.config.heartbeat_interval;
        let robot_id = self.config.robot_id;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.notified() => break,
                }

                let snapshot: Vec<(JobId, LeaseGeneration, ChronoDuration)> = in_flight
                    .lock()
                    .await
                    .iter()
                    .map(|(id, job)| (*id, job.lease_generation, job.visibility_timeout))
                    .collect();

                let now = Utc::now();
                for (job_id, lease_generation, visibility_timeout) in snapshot {
                    match claim_store.extend_lease(job_id, robot_id, lease_generation, visibility_timeout, now).await
                    {
                        Ok(_) => {}
                        Err(ClaimStoreError::LeaseLost { .. }) => {
                            if let Some(entry) = in_flight.lock().await.remove(&job_id) {
                                entry.cancel.set();
                                current_jobs.fetch_sub(1, Ordering::SeqCst);
                            }
                            tracing::warn!(job_id = %job_id, job_lost = true, "lease lost, abandoning job");
                        }
                        Err(e) => {
                            tracing::warn!(job_id = %job_id, error = %e, "failed to extend lease, will retry");
                        }
                    }
                }
            }
        })
    }

    fn spawn_presence_loop(&self) -> JoinHandle<()> {
        let realtime = self.realtime.clone();
        let registry = self.registry.clone();
        let current_jobs = self.current_jobs.clone();
        let max_jobs = self.config.max_concurrent_jobs;
        let robot_id = self.config.robot_id;
        let interval = self.config.presence_interval;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.notified() => break,
                }

                let jobs = current_jobs.load(Ordering::SeqCst);
                let status = if jobs >= max_jobs { RobotStatus::Busy } else { RobotStatus::Online };
                let now = Utc::now();

                if let Some(channel) = &realtime {
                    let event = RealtimeEvent::RobotPresence { robot_id, status, current_jobs: jobs };
                    if let Err(e) = channel.publish(event).await {
                        tracing::debug!(error = %e, "presence publish failed");
                    }
                }
                if let Some(registry) = &registry {
                    if let Err(e) = registry.touch_presence(robot_id, status, jobs, now).await {
                        tracing::debug!(error = %e, "presence persist failed");
                    }
                }
            }
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_execution(
    claimed: ClaimedJob,
    claim_store: SharedClaimStore,
    executor: Arc<dyn Executor>,
    in_flight: Arc<AsyncMutex<HashMap<JobId, InFlightJob>>>,
    current_jobs: Arc<AtomicU32>,
    realtime: Option<SharedRealtimeChannel>,
    job_timeout: std::time::Duration,
) -> JoinHandle<()> {
    let ClaimedJob { job, lease_generation, .. } = claimed;
    let Job { id: job_id, workflow_json, visibility_timeout_seconds, .. } = job;
    let cancel = CancelFlag::new();

    tokio::spawn(async move {
        in_flight.lock().await.insert(
            job_id,
            InFlightJob {
                lease_generation,
                visibility_timeout: ChronoDuration::seconds(visibility_timeout_seconds),
                cancel: cancel.clone(),
            },
        );

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressTick>();
        let progress_realtime = realtime.clone();
        let progress_task = tokio::spawn(async move {
            while let Some(tick) = progress_rx.recv().await {
                if let Some(channel) = &progress_realtime {
                    let event = RealtimeEvent::JobProgress {
                        job_id: tick.job_id,
                        progress: tick.progress,
                        current_node: tick.current_node,
                    };
                    let _ = channel.publish(event).await;
                }
            }
        });

        let outcome = tokio::time::timeout(job_timeout, executor.execute(job_id, workflow_json, progress_tx, cancel))
            .await;
        drop(progress_task);

        // Lease already lost (heartbeat loop abandoned it): never settle.
        let Some(_) = in_flight.lock().await.remove(&job_id) else {
            return;
        };
        current_jobs.fetch_sub(1, Ordering::SeqCst);

        let now = Utc::now();
        let (status, result, error_message) = match outcome {
            Ok(Ok(job_outcome)) => (JobStatus::Completed, job_outcome.result, None),
            Ok(Err(ExecutorError::Cancelled)) => (JobStatus::Cancelled, None, None),
            Ok(Err(e)) => (JobStatus::Failed, None, Some(e.to_string())),
            Err(_) => (JobStatus::Timeout, None, Some("execution exceeded job_timeout".to_string())),
        };

        if let Err(e) = claim_store.settle(job_id, lease_generation, status, result, error_message, now).await {
            tracing::error!(job_id = %job_id, error = %e, "failed to settle job");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::JobOutcome;
    use async_trait::async_trait;
    use rpa_orchestrator_core::claim::{ClaimStore, EnqueueRecord};
    use rpa_orchestrator_testing::InMemoryClaimStore;

    struct ImmediateSuccess;

    #[async_trait]
    impl Executor for ImmediateSuccess {
        async fn execute(
            &self,
            _job_id: JobId,
            _workflow_json: serde_json::Value,
            _progress: mpsc::UnboundedSender<ProgressTick>,
            _cancel: CancelFlag,
        ) -> Result<JobOutcome, ExecutorError> {
            Ok(JobOutcome { result: Some(serde_json::json!({"ok": true})) })
        }
    }

    fn test_config() -> RobotAgentConfig {
        let mut config = RobotAgentConfig::new("test-robot");
        config.poll_interval = std::time::Duration::from_millis(20);
        config.heartbeat_interval = std::time::Duration::from_millis(50);
        config.presence_interval = std::time::Duration::from_millis(50);
        config.subscribe_timeout = std::time::Duration::from_millis(20);
        config.graceful_shutdown = std::time::Duration::from_millis(200);
        config
    }

    #[tokio::test]
    async fn claims_and_completes_a_queued_job() {
        let store = Arc::new(InMemoryClaimStore::new());
        let config = test_config();
        let agent = RobotAgentBuilder::new(config, store.clone(), Arc::new(ImmediateSuccess)).build().unwrap();

        let now = Utc::now();
        store
            .enqueue(EnqueueRecord {
                id: uuid::Uuid::new_v4(),
                workflow_id: "wf-1".to_string(),
                workflow_name: "Invoice".to_string(),
                workflow_json: serde_json::json!({}),
                priority: rpa_orchestrator_core::job::JobPriority::Normal,
                environment: None,
                scheduled_time: now,
                visibility_timeout_seconds: 30,
                dedup_fingerprint: None,
            })
            .await
            .unwrap();

        agent.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        agent.stop().await;

        let stats = store.stats().await;
        assert_eq!(stats.completed, 1);
    }
}
