//! Wire messages exchanged between a robot agent and the orchestrator
//! (spec §6). Transport-agnostic: the `robot` crate's HTTP/websocket
//! client and the orchestrator's handlers both serialize these directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{JobId, JobPriority, RobotId};
use crate::robot::RobotCapabilities;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RobotToOrchestrator {
    Register {
        robot_id: RobotId,
        name: String,
        environment: String,
        tags: Vec<String>,
        capabilities: RobotCapabilities,
        max_concurrent_jobs: u32,
    },
    Heartbeat {
        robot_id: RobotId,
        current_jobs: u32,
        timestamp: DateTime<Utc>,
    },
    ClaimRequest {
        robot_id: RobotId,
        eligible_workflow_ids: Option<Vec<String>>,
    },
    LeaseHeartbeat {
        job_id: JobId,
        robot_id: RobotId,
        lease_generation: i64,
    },
    Progress {
        job_id: JobId,
        robot_id: RobotId,
        progress: u8,
        current_node: Option<String>,
    },
    JobCompleted {
        job_id: JobId,
        robot_id: RobotId,
        lease_generation: i64,
        result: Option<Value>,
    },
    JobFailed {
        job_id: JobId,
        robot_id: RobotId,
        lease_generation: i64,
        error_message: String,
    },
    Deregister {
        robot_id: RobotId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorToRobot {
    Registered {
        robot_id: RobotId,
    },
    JobAssigned {
        job_id: JobId,
        workflow_id: String,
        workflow_name: String,
        workflow_json: Value,
        priority: JobPriority,
        lease_generation: i64,
        lease_expires_at: DateTime<Utc>,
    },
    NoJobAvailable,
    LeaseExtended {
        job_id: JobId,
        lease_expires_at: DateTime<Utc>,
    },
    LeaseLost {
        job_id: JobId,
    },
    CancelRequested {
        job_id: JobId,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn register_round_trips_through_json() {
        let msg = RobotToOrchestrator::Register {
            robot_id: Uuid::new_v4(),
            name: "robot-1".to_string(),
            environment: "prod".to_string(),
            tags: vec!["windows".to_string()],
            capabilities: RobotCapabilities::default(),
            max_concurrent_jobs: 4,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: RobotToOrchestrator = serde_json::from_str(&json).unwrap();
        match back {
            RobotToOrchestrator::Register { name, max_concurrent_jobs, .. } => {
                assert_eq!(name, "robot-1");
                assert_eq!(max_concurrent_jobs, 4);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn job_assigned_tag_is_snake_case() {
        let msg = OrchestratorToRobot::JobAssigned {
            job_id: Uuid::new_v4(),
            workflow_id: "wf-1".to_string(),
            workflow_name: "Invoice Processing".to_string(),
            workflow_json: Value::Null,
            priority: JobPriority::High,
            lease_generation: 1,
            lease_expires_at: Utc::now(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "job_assigned");
    }

    #[test]
    fn capabilities_default_is_empty() {
        let caps = RobotCapabilities::default();
        assert!(caps.browser_engines.is_empty());
        assert_eq!(caps.cpu_cores, 0);
    }
}
