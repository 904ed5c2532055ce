//! Robot registry, pools, and selection strategies (spec §4.3).

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::job::{Job, RobotId};
use crate::robot::{Robot, RobotStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastLoaded,
    Random,
    Affinity,
}

/// A group of robots with shared configuration (spec §4.3).
pub struct RobotPool {
    pub name: String,
    pub tags: HashSet<String>,
    pub max_concurrent_jobs: Option<u32>,
    pub allowed_workflows: Option<HashSet<String>>,
}

impl RobotPool {
    pub fn new(name: impl Into<String>) -> Self {
        RobotPool {
            name: name.into(),
            tags: HashSet::new(),
            max_concurrent_jobs: None,
            allowed_workflows: None,
        }
    }

    /// `pool.tags ⊆ robot.tags` (spec §3 invariant).
    pub fn admits(&self, robot: &Robot) -> bool {
        self.tags.is_subset(&robot.tags)
    }

    pub fn allows_workflow(&self, workflow_id: &str) -> bool {
        self.allowed_workflows
            .as_ref()
            .map(|set| set.contains(workflow_id))
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub strategy: LoadBalancingStrategy,
    pub dispatch_interval: std::time::Duration,
    pub health_check_interval: std::time::Duration,
    pub stale_robot_timeout: ChronoDuration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            strategy: LoadBalancingStrategy::LeastLoaded,
            dispatch_interval: std::time::Duration::from_secs(5),
            health_check_interval: std::time::Duration::from_secs(30),
            stale_robot_timeout: ChronoDuration::seconds(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    pub total_robots: usize,
    pub online: usize,
    pub busy: usize,
    pub offline: usize,
    pub error: usize,
    pub total_capacity: u32,
    pub current_load: u32,
}

/// Robot registry + pools + selection strategy + health checking.
///
/// Guarded by `DashMap` for the registry (fine-grained, never held across
/// `.await`) following the teacher's own choice of `dashmap` for
/// affinity/registry-shaped state.
pub struct Dispatcher {
    config: DispatcherConfig,
    robots: DashMap<RobotId, Robot>,
    pools: DashMap<String, RobotPool>,
    /// workflow_id -> robot_id -> success count (spec §4.3 affinity record).
    affinity: DashMap<String, DashMap<RobotId, u32>>,
    rr_index: AtomicUsize,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let pools = DashMap::new();
        pools.insert("default".to_string(), RobotPool::new("default"));
        Dispatcher {
            config,
            robots: DashMap::new(),
            pools,
            affinity: DashMap::new(),
            rr_index: AtomicUsize::new(0),
        }
    }

    pub fn register_robot(&self, robot: Robot) {
        tracing::info!(robot_id = %robot.id, name = %robot.name, "robot registered");
        self.robots.insert(robot.id, robot);
    }

    pub fn unregister_robot(&self, robot_id: RobotId) {
        self.robots.remove(&robot_id);
    }

    pub fn get_robot(&self, robot_id: RobotId) -> Option<Robot> {
        self.robots.get(&robot_id).map(|r| r.clone())
    }

    pub fn update_robot_status(&self, robot_id: RobotId, status: RobotStatus) {
        if let Some(mut r) = self.robots.get_mut(&robot_id) {
            r.status = status;
        }
    }

    pub fn heartbeat(&self, robot_id: RobotId, now: DateTime<Utc>) {
        if let Some(mut r) = self.robots.get_mut(&robot_id) {
            r.touch_heartbeat(now);
        }
    }

    pub fn increment_current_jobs(&self, robot_id: RobotId) {
        if let Some(mut r) = self.robots.get_mut(&robot_id) {
            r.current_jobs = r.current_jobs.saturating_add(1);
        }
    }

    pub fn decrement_current_jobs(&self, robot_id: RobotId) {
        if let Some(mut r) = self.robots.get_mut(&robot_id) {
            r.current_jobs = r.current_jobs.saturating_sub(1);
        }
    }

    pub fn create_pool(&self, pool: RobotPool) {
        self.pools.insert(pool.name.clone(), pool);
    }

    pub fn all_robots(&self) -> Vec<Robot> {
        self.robots.iter().map(|e| e.value().clone()).collect()
    }

    /// A candidate is "available" per spec §4.3, extended by spec §4.4's
    /// `environment = env (or unset)` claim filter: `environment` is the
    /// job's required environment, `None` meaning any robot qualifies.
    fn is_available(&self, robot: &Robot, now: DateTime<Utc>, environment: Option<&str>) -> bool {
        robot.has_capacity()
            && !robot.is_stale(now, self.config.stale_robot_timeout)
            && environment.map(|env| robot.environment == env).unwrap_or(true)
    }

    pub fn available_robots(&self, now: DateTime<Utc>) -> Vec<Robot> {
        self.available_robots_for(now, None)
    }

    fn available_robots_for(&self, now: DateTime<Utc>, environment: Option<&str>) -> Vec<Robot> {
        self.robots
            .iter()
            .filter(|e| self.is_available(e.value(), now, environment))
            .map(|e| e.value().clone())
            .collect()
    }

    fn available_in_pool(&self, pool_name: &str, now: DateTime<Utc>, environment: Option<&str>) -> Vec<Robot> {
        let Some(pool) = self.pools.get(pool_name) else {
            return Vec::new();
        };
        self.robots
            .iter()
            .filter(|e| self.is_available(e.value(), now, environment) && pool.admits(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    /// spec §4.3 `select_robot`.
    pub fn select_robot(&self, job: &Job, pool_name: Option<&str>, now: DateTime<Utc>) -> Option<Robot> {
        let environment = job.environment.as_deref();
        let candidates = match pool_name {
            Some(name) => self.available_in_pool(name, now, environment),
            None => self.available_robots_for(now, environment),
        };
        if candidates.is_empty() {
            return None;
        }

        // A targeted job only ever considers its target robot; if it's
        // unavailable the job simply waits (spec §4.3).
        if let Some(target) = crate::queue::targeted_robot(job) {
            return candidates.into_iter().find(|r| r.id == target);
        }

        match self.config.strategy {
            LoadBalancingStrategy::RoundRobin => self.select_round_robin(&candidates),
            LoadBalancingStrategy::LeastLoaded => self.select_least_loaded(&candidates),
            LoadBalancingStrategy::Random => self.select_random(&candidates),
            LoadBalancingStrategy::Affinity => self.select_affinity(job, &candidates),
        }
    }

    fn select_round_robin(&self, candidates: &[Robot]) -> Option<Robot> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.rr_index.fetch_add(1, AtomicOrdering::Relaxed) % candidates.len();
        candidates.get(idx).cloned()
    }

    fn select_least_loaded(&self, candidates: &[Robot]) -> Option<Robot> {
        candidates
            .iter()
            .min_by(|a, b| a.utilization().partial_cmp(&b.utilization()).unwrap())
            .cloned()
    }

    fn select_random(&self, candidates: &[Robot]) -> Option<Robot> {
        if candidates.is_empty() {
            return None;
        }
        let idx = fastrand::usize(..candidates.len());
        candidates.get(idx).cloned()
    }

    fn select_affinity(&self, job: &Job, candidates: &[Robot]) -> Option<Robot> {
        let Some(workflow_affinity) = self.affinity.get(&job.workflow_id) else {
            return self.select_least_loaded(candidates);
        };

        let mut best: Option<(RobotId, u32)> = None;
        for robot in candidates {
            let score = workflow_affinity.get(&robot.id).map(|v| *v).unwrap_or(0);
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((robot.id, score));
            }
        }

        match best {
            Some((id, score)) if score > 0 => candidates.iter().find(|r| r.id == id).cloned(),
            _ => self.select_least_loaded(candidates),
        }
    }

    /// spec §4.3 `record_job_result`.
    pub fn record_job_result(&self, job: &Job, success: bool) {
        if success {
            if let Some(robot_id) = job.robot_id {
                let entry = self.affinity.entry(job.workflow_id.clone()).or_default();
                *entry.entry(robot_id).or_insert(0) += 1;
            }
        }
    }

    /// spec §4.3 health loop: robots with stale heartbeats go OFFLINE.
    pub fn check_robot_health(&self, now: DateTime<Utc>) -> Vec<RobotId> {
        let mut newly_offline = Vec::new();
        for mut entry in self.robots.iter_mut() {
            if entry.status == RobotStatus::Offline {
                continue;
            }
            if entry.is_stale(now, self.config.stale_robot_timeout) {
                entry.status = RobotStatus::Offline;
                newly_offline.push(entry.id);
            }
        }
        newly_offline
    }

    pub fn stats(&self) -> DispatcherStats {
        let mut stats = DispatcherStats::default();
        for entry in self.robots.iter() {
            stats.total_robots += 1;
            stats.total_capacity += entry.max_concurrent_jobs;
            stats.current_load += entry.current_jobs;
            match entry.status {
                RobotStatus::Online => stats.online += 1,
                RobotStatus::Busy => stats.busy += 1,
                RobotStatus::Offline => stats.offline += 1,
                RobotStatus::Error => stats.error += 1,
            }
        }
        stats
    }
}

pub type SharedDispatcher = Arc<Dispatcher>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobPriority, JobStatus, SubmitJobRequest};
    use uuid::Uuid;

    fn robot(id: Uuid, max: u32, now: DateTime<Utc>) -> Robot {
        Robot::new(id, "r", "default", max, HashSet::new(), now)
    }

    fn job_for(workflow: &str) -> Job {
        let req = SubmitJobRequest::new(workflow, "n", serde_json::json!({}));
        Job::from_request(&req, Utc::now())
    }

    #[test]
    fn targeted_job_only_considers_target() {
        let d = Dispatcher::new(DispatcherConfig::default());
        let now = Utc::now();
        let r1 = Uuid::new_v4();
        let r2 = Uuid::new_v4();
        d.register_robot(robot(r1, 1, now));
        d.register_robot(robot(r2, 1, now));

        let mut job = job_for("wf");
        job.robot_id = Some(r2);
        let selected = d.select_robot(&job, None, now).unwrap();
        assert_eq!(selected.id, r2);
    }

    #[test]
    fn least_loaded_prefers_lower_utilization() {
        let d = Dispatcher::new(DispatcherConfig {
            strategy: LoadBalancingStrategy::LeastLoaded,
            ..DispatcherConfig::default()
        });
        let now = Utc::now();
        let busy = Uuid::new_v4();
        let idle = Uuid::new_v4();
        let mut busy_robot = robot(busy, 2, now);
        busy_robot.current_jobs = 1;
        d.register_robot(busy_robot);
        d.register_robot(robot(idle, 2, now));

        let job = job_for("wf");
        let selected = d.select_robot(&job, None, now).unwrap();
        assert_eq!(selected.id, idle);
    }

    #[test]
    fn affinity_falls_back_to_least_loaded_without_history() {
        let d = Dispatcher::new(DispatcherConfig {
            strategy: LoadBalancingStrategy::Affinity,
            ..DispatcherConfig::default()
        });
        let now = Utc::now();
        let r1 = Uuid::new_v4();
        d.register_robot(robot(r1, 1, now));
        let job = job_for("wf");
        assert!(d.select_robot(&job, None, now).is_some());
    }

    #[test]
    fn affinity_prefers_prior_success() {
        let d = Dispatcher::new(DispatcherConfig {
            strategy: LoadBalancingStrategy::Affinity,
            ..DispatcherConfig::default()
        });
        let now = Utc::now();
        let winner = Uuid::new_v4();
        let loser = Uuid::new_v4();
        d.register_robot(robot(winner, 1, now));
        d.register_robot(robot(loser, 1, now));

        let mut job = job_for("wf-affinity");
        job.robot_id = Some(winner);
        job.status = JobStatus::Completed;
        d.record_job_result(&job, true);

        job.robot_id = None;
        job.priority = JobPriority::Normal;
        let selected = d.select_robot(&job, None, now).unwrap();
        assert_eq!(selected.id, winner);
    }

    #[test]
    fn stale_heartbeat_marks_offline() {
        let d = Dispatcher::new(DispatcherConfig {
            stale_robot_timeout: ChronoDuration::seconds(10),
            ..DispatcherConfig::default()
        });
        let now = Utc::now();
        let id = Uuid::new_v4();
        let mut r = robot(id, 1, now - ChronoDuration::seconds(60));
        r.last_heartbeat = now - ChronoDuration::seconds(60);
        d.register_robot(r);

        let offline = d.check_robot_health(now);
        assert_eq!(offline, vec![id]);
        assert_eq!(d.get_robot(id).unwrap().status, RobotStatus::Offline);
    }

    #[test]
    fn pool_admits_only_matching_tags() {
        let mut pool = RobotPool::new("prod");
        pool.tags.insert("prod".to_string());
        let now = Utc::now();
        let mut r = robot(Uuid::new_v4(), 1, now);
        assert!(!pool.admits(&r));
        r.tags.insert("prod".to_string());
        assert!(pool.admits(&r));
    }

    #[test]
    fn environment_filter_excludes_mismatched_robots() {
        let d = Dispatcher::new(DispatcherConfig::default());
        let now = Utc::now();
        let staging = Uuid::new_v4();
        let prod = Uuid::new_v4();
        d.register_robot(Robot::new(staging, "r", "staging", 1, HashSet::new(), now));
        d.register_robot(Robot::new(prod, "r", "prod", 1, HashSet::new(), now));

        let mut job = job_for("wf");
        job.environment = Some("prod".to_string());
        let selected = d.select_robot(&job, None, now).unwrap();
        assert_eq!(selected.id, prod);
    }

    #[test]
    fn unset_environment_matches_any_robot() {
        let d = Dispatcher::new(DispatcherConfig::default());
        let now = Utc::now();
        d.register_robot(Robot::new(Uuid::new_v4(), "r", "staging", 1, HashSet::new(), now));

        let job = job_for("wf");
        assert!(job.environment.is_none());
        assert!(d.select_robot(&job, None, now).is_some());
    }
}
