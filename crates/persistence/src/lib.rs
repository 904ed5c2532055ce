//! Startup rehydration: persisted state is the source of truth across
//! restarts, in-memory engine state is a fast cache rebuilt on start
//! (spec §5). `robots` is mutated by the core (via `ClaimStore`'s robot
//! helpers); `workflows`/`schedules` are read-only inputs supplied by
//! whatever system owns workflow authoring, so this crate only defines
//! the seams (`RobotSource`, `ScheduleSource`) and the rehydration
//! routine — not a concrete schedule store.

use async_trait::async_trait;
use rpa_orchestrator_core::engine::OrchestratorEngine;
use rpa_orchestrator_core::robot::Robot;
use rpa_orchestrator_core::scheduler::Schedule;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to load robots: {0}")]
    RobotLoad(#[source] anyhow::Error),

    #[error("failed to load schedules: {0}")]
    ScheduleLoad(#[source] anyhow::Error),
}

#[async_trait]
pub trait RobotSource: Send + Sync {
    async fn get_robots(&self) -> Result<Vec<Robot>, PersistenceError>;
}

#[async_trait]
pub trait ScheduleSource: Send + Sync {
    /// `enabled_only = true` mirrors spec §5's `get_schedules(enabled_only)`.
    async fn get_schedules(&self, enabled_only: bool) -> Result<Vec<Schedule>, PersistenceError>;
}

#[derive(Debug, Default)]
pub struct RehydrationReport {
    pub robots_loaded: usize,
    pub schedules_loaded: usize,
}

/// Loads robots and enabled schedules into `engine`'s in-memory caches
/// (spec §8 `_load_robots` / `_load_schedules`), run once during
/// `OrchestratorEngine::start`.
pub async fn rehydrate(
    engine: &OrchestratorEngine,
    robots: &dyn RobotSource,
    schedules: &dyn ScheduleSource,
) -> Result<RehydrationReport, PersistenceError> {
    let mut report = RehydrationReport::default();

    for robot in robots.get_robots().await? {
        tracing::info!(robot_id = %robot.id, name = %robot.name, "rehydrated robot");
        engine.register_robot(robot);
        report.robots_loaded += 1;
    }

    for schedule in schedules.get_schedules(true).await? {
        tracing::info!(schedule_id = %schedule.id, name = %schedule.name, "rehydrated schedule");
        if let Err(e) = engine.create_schedule(schedule).await {
            tracing::warn!(error = %e, "failed to rehydrate schedule, skipping");
            continue;
        }
        report.schedules_loaded += 1;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpa_orchestrator_core::robot::RobotStatus;
    use std::collections::HashSet;
    use uuid::Uuid;

    struct StaticRobots(Vec<Robot>);
    struct StaticSchedules(Vec<Schedule>);

    #[async_trait]
    impl RobotSource for StaticRobots {
        async fn get_robots(&self) -> Result<Vec<Robot>, PersistenceError> {
            Ok(self.0.clone())
        }
    }

    #[async_trait]
    impl ScheduleSource for StaticSchedules {
        async fn get_schedules(&self, _enabled_only: bool) -> Result<Vec<Schedule>, PersistenceError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn rehydrate_registers_robots_and_schedules_with_engine() {
        let engine = OrchestratorEngine::builder().build();
        let now = chrono::Utc::now();
        let mut robot = Robot::new(Uuid::new_v4(), "r1", "prod", 2, HashSet::new(), now);
        robot.status = RobotStatus::Online;

        let schedule = Schedule::new("nightly", "wf-1", rpa_orchestrator_core::scheduler::ScheduleFrequency::Daily);

        let robots = StaticRobots(vec![robot.clone()]);
        let schedules = StaticSchedules(vec![schedule]);

        let report = rehydrate(&engine, &robots, &schedules).await.unwrap();
        assert_eq!(report.robots_loaded, 1);
        assert_eq!(report.schedules_loaded, 1);
        assert!(engine.dispatcher().get_robot(robot.id).is_some());
    }
}
