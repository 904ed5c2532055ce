//! Robot entity: registry-side view of a worker process (spec §3).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::RobotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotStatus {
    Online,
    Busy,
    Offline,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RobotCapabilities {
    pub platform: String,
    pub browser_engines: Vec<String>,
    pub desktop: bool,
    pub cpu_cores: u32,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Robot {
    pub id: RobotId,
    pub name: String,
    pub environment: String,
    pub tags: HashSet<String>,
    pub capabilities: RobotCapabilities,
    pub status: RobotStatus,
    pub max_concurrent_jobs: u32,
    pub current_jobs: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Robot {
    pub fn new(
        id: RobotId,
        name: impl Into<String>,
        environment: impl Into<String>,
        max_concurrent_jobs: u32,
        tags: HashSet<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Robot {
            id,
            name: name.into(),
            environment: environment.into(),
            tags,
            capabilities: RobotCapabilities::default(),
            status: RobotStatus::Online,
            max_concurrent_jobs,
            current_jobs: 0,
            last_heartbeat: now,
            last_seen: now,
        }
    }

    /// A candidate is "available" per spec §4.3 iff status is Online/Busy
    /// and it has spare capacity. Heartbeat staleness and pool constraints
    /// are evaluated by the dispatcher, which has the stale-timeout policy.
    pub fn has_capacity(&self) -> bool {
        matches!(self.status, RobotStatus::Online | RobotStatus::Busy)
            && self.current_jobs < self.max_concurrent_jobs
    }

    pub fn utilization(&self) -> f64 {
        if self.max_concurrent_jobs == 0 {
            return 1.0;
        }
        self.current_jobs as f64 / self.max_concurrent_jobs as f64
    }

    pub fn touch_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        self.last_seen = now;
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat > stale_timeout
    }
}
