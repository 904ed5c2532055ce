//! Job entity and state machine transitions (spec §3, §4.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub type JobId = Uuid;
pub type RobotId = Uuid;

/// Ordered so that `a > b` means `a` dispatches first (spec §3: "ordered").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    /// Terminal states reject further transitions (spec §4.1).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub workflow_id: String,
    pub workflow_name: String,
    pub workflow_json: Value,
    pub priority: JobPriority,
    pub status: JobStatus,
    /// Empty means "any robot may claim this job".
    pub robot_id: Option<RobotId>,
    /// Empty means "any robot environment may claim this job" (spec §4.4
    /// `environment = env (or unset)`).
    pub environment: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub progress: u8,
    pub current_node: Option<String>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub visibility_timeout_seconds: i64,
    pub dedup_fingerprint: String,
    /// Set by `cancel()` on a RUNNING job; the robot polls this cooperatively
    /// between nodes instead of the queue force-transitioning it (spec §5).
    pub cancel_requested: bool,
}

/// Parameters needed to submit a job (spec §4.7 `submit_job`).
#[derive(Debug, Clone)]
pub struct SubmitJobRequest {
    pub workflow_id: String,
    pub workflow_name: String,
    pub workflow_json: Value,
    pub robot_id: Option<RobotId>,
    pub environment: Option<String>,
    pub priority: JobPriority,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub params: Value,
    pub check_duplicate: bool,
    pub visibility_timeout_seconds: i64,
}

impl SubmitJobRequest {
    pub fn new(workflow_id: impl Into<String>, workflow_name: impl Into<String>, workflow_json: Value) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            workflow_json,
            robot_id: None,
            environment: None,
            priority: JobPriority::Normal,
            scheduled_time: None,
            params: Value::Null,
            check_duplicate: true,
            visibility_timeout_seconds: 30,
        }
    }
}

impl Job {
    pub fn from_request(req: &SubmitJobRequest, now: DateTime<Utc>) -> Self {
        let status = match req.scheduled_time {
            Some(at) if at > now => JobStatus::Pending,
            _ => JobStatus::Queued,
        };
        Job {
            id: Uuid::new_v4(),
            workflow_id: req.workflow_id.clone(),
            workflow_name: req.workflow_name.clone(),
            workflow_json: req.workflow_json.clone(),
            priority: req.priority,
            status,
            robot_id: req.robot_id,
            environment: req.environment.clone(),
            scheduled_time: req.scheduled_time,
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            progress: 0,
            current_node: None,
            result: None,
            error_message: None,
            retry_count: 0,
            visibility_timeout_seconds: req.visibility_timeout_seconds,
            dedup_fingerprint: dedup_fingerprint(&req.workflow_id, &req.params),
            cancel_requested: false,
        }
    }

    /// True once `scheduled_time` has arrived (or there wasn't one).
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time.map(|t| t <= now).unwrap_or(true)
    }

    /// Whether this job is visible to `robot` (spec §4.1 dequeue rule,
    /// extended by spec §4.4's `environment = env (or unset)` claim filter).
    pub fn matches_robot(&self, robot: &crate::robot::Robot) -> bool {
        self.robot_id.map(|r| r == robot.id).unwrap_or(true) && self.matches_environment(&robot.environment)
    }

    /// spec §4.4 claim filter: an unset job environment matches anything.
    pub fn matches_environment(&self, environment: &str) -> bool {
        self.environment.as_deref().map(|e| e == environment).unwrap_or(true)
    }
}

/// `fingerprint = hash(workflow_id, normalized_params)` (spec §4.1).
///
/// Normalization is canonical JSON with sorted object keys, matching the
/// "opaque payload, hash with canonical JSON" guidance in spec §9.
pub fn dedup_fingerprint(workflow_id: &str, params: &Value) -> String {
    let normalized = canonicalize(params);
    let mut hasher = Sha256::new();
    hasher.update(workflow_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", canonicalize(&Value::String(k.clone())), canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_stable_under_key_reordering() {
        let a = dedup_fingerprint("wf-1", &json!({"x": 1, "y": 2}));
        let b = dedup_fingerprint("wf-1", &json!({"y": 2, "x": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_by_workflow() {
        let a = dedup_fingerprint("wf-1", &json!({"x": 1}));
        let b = dedup_fingerprint("wf-2", &json!({"x": 1}));
        assert_ne!(a, b);
    }

    #[test]
    fn priority_ordering_matches_spec() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for s in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Timeout,
        ] {
            assert!(s.is_terminal());
        }
        for s in [JobStatus::Pending, JobStatus::Queued, JobStatus::Running] {
            assert!(!s.is_terminal());
        }
    }
}
