//! Realtime pub/sub seam (spec §7): lets the engine push job/robot events
//! to subscribers without them polling. `InProcessChannel` (broadcast) and
//! `PgListenChannel` (LISTEN/NOTIFY) live in the `realtime` crate; this
//! trait is what both implement and what the engine/robot code depends on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RealtimeError;
use crate::job::{JobId, RobotId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    JobQueued { job_id: JobId, workflow_id: String },
    JobAssigned { job_id: JobId, robot_id: RobotId },
    JobProgress { job_id: JobId, progress: u8, current_node: Option<String> },
    JobCompleted { job_id: JobId, result: Option<Value> },
    JobFailed { job_id: JobId, error_message: String },
    JobCancelled { job_id: JobId, reason: Option<String> },
    RobotOnline { robot_id: RobotId },
    RobotOffline { robot_id: RobotId },
    RobotPresence { robot_id: RobotId, status: crate::robot::RobotStatus, current_jobs: u32 },
}

impl RealtimeEvent {
    /// Channel/topic name events of this kind are published under
    /// (spec §7.1: "jobs", "robots" topics).
    pub fn topic(&self) -> &'static str {
        match self {
            RealtimeEvent::JobQueued { .. }
            | RealtimeEvent::JobAssigned { .. }
            | RealtimeEvent::JobProgress { .. }
            | RealtimeEvent::JobCompleted { .. }
            | RealtimeEvent::JobFailed { .. }
            | RealtimeEvent::JobCancelled { .. } => "jobs",
            RealtimeEvent::RobotOnline { .. }
            | RealtimeEvent::RobotOffline { .. }
            | RealtimeEvent::RobotPresence { .. } => "robots",
        }
    }
}

/// A live subscription. Implementations are expected to buffer a bounded
/// number of events and drop the oldest on overflow (spec §7.2) rather
/// than block the publisher.
#[async_trait]
pub trait Subscription: Send {
    async fn recv(&mut self) -> Result<RealtimeEvent, RealtimeError>;
}

#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn publish(&self, event: RealtimeEvent) -> Result<(), RealtimeError>;

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, RealtimeError>;
}

pub type SharedRealtimeChannel = std::sync::Arc<dyn RealtimeChannel>;

/// Blocks on a subscription until an event arrives or `timeout` elapses;
/// used by the robot agent's hybrid poll+push claim loop (spec §6.3).
pub async fn recv_with_timeout(
    subscription: &mut dyn Subscription,
    timeout: std::time::Duration,
) -> Option<RealtimeEvent> {
    match tokio::time::timeout(timeout, subscription.recv()).await {
        Ok(Ok(event)) => Some(event),
        Ok(Err(_)) | Err(_) => None,
    }
}

