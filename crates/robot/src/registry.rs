//! Seam for persisting this robot's own status, mirroring the startup/
//! presence writes spec §4.5 describes (`upsert robots row`, `update
//! robots.last_seen, robots.status`). Grounded on the same read/write-seam
//! pattern as `rpa_orchestrator_persistence::RobotSource`: the robot crate
//! never depends on `rpa-orchestrator-postgres` directly, it only defines
//! the trait a durable store adapter can satisfy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rpa_orchestrator_core::job::RobotId;
use rpa_orchestrator_core::robot::{Robot, RobotStatus};

#[async_trait]
pub trait RobotRegistry: Send + Sync {
    /// Startup sequence step 2: "upsert robots row with status idle".
    async fn register(&self, robot: &Robot) -> Result<(), anyhow::Error>;

    /// Presence loop (spec §4.5.4): "update robots.last_seen, robots.status".
    async fn touch_presence(
        &self,
        robot_id: RobotId,
        status: RobotStatus,
        current_jobs: u32,
        now: DateTime<Utc>,
    ) -> Result<(), anyhow::Error>;
}
