//! # rpa-orchestrator-core
//!
//! The distributed job orchestration core for an RPA platform: a priority
//! job queue with a small state machine, a robot dispatcher with
//! pluggable load-balancing strategies, a cron/interval scheduler, and the
//! seams (`ClaimStore`, `RealtimeChannel`) that let a durable backend and
//! a pub/sub transport plug in without this crate knowing about Postgres
//! or websockets directly.
//!
//! [`engine::OrchestratorEngine`] is the façade that wires these pieces
//! together; most callers only need that and [`job::SubmitJobRequest`].

pub mod claim;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod job;
pub mod queue;
pub mod realtime;
pub mod robot;
pub mod scheduler;
pub mod wire;

pub use claim::{ClaimStore, ClaimedJob, EnqueueRecord, LeaseGeneration, SharedClaimStore};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats, LoadBalancingStrategy, RobotPool, SharedDispatcher};
pub use engine::{EngineBuilder, EngineConfig, OrchestratorEngine};
pub use error::{backoff, ClaimStoreError, OrchestratorError, RealtimeError};
pub use job::{dedup_fingerprint, Job, JobId, JobPriority, JobStatus, RobotId, SubmitJobRequest};
pub use queue::{targeted_robot, JobQueue, QueueStats};
pub use realtime::{recv_with_timeout, RealtimeChannel, RealtimeEvent, SharedRealtimeChannel, Subscription};
pub use robot::{Robot, RobotCapabilities, RobotStatus};
pub use scheduler::{next_run_after, Schedule, ScheduleFrequency, ScheduleId, Scheduler, SchedulerConfig};
pub use wire::{OrchestratorToRobot, RobotToOrchestrator};
