//! State affinity (spec §4.5, optional): a workflow that keeps external
//! state tied to one robot (e.g. a logged-in browser session) can be pinned
//! so other robots release claimed jobs back to it.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rpa_orchestrator_core::job::RobotId;

#[derive(Debug, Clone)]
pub struct AffinityAdvertisement {
    pub workflow_id: String,
    pub robot_id: RobotId,
    pub expires_at: DateTime<Utc>,
    pub state_keys: Vec<String>,
}

/// Local view of affinities this agent has learned about, keyed by
/// `workflow_id`. Populated from presence-channel traffic or out-of-band
/// advertisement; expired entries are treated as absent.
#[derive(Default)]
pub struct AffinityTable {
    entries: Mutex<HashMap<String, AffinityAdvertisement>>,
}

impl AffinityTable {
    pub fn new() -> Self {
        AffinityTable::default()
    }

    pub fn advertise(&self, advertisement: AffinityAdvertisement) {
        self.entries
            .lock()
            .expect("affinity table poisoned")
            .insert(advertisement.workflow_id.clone(), advertisement);
    }

    /// True if `workflow_id` is affinitied to some robot other than
    /// `self_robot_id`, and that affinity has not expired. A true result
    /// means the claiming robot should immediately `release_job`.
    pub fn conflicts(&self, workflow_id: &str, self_robot_id: RobotId, now: DateTime<Utc>) -> bool {
        let entries = self.entries.lock().expect("affinity table poisoned");
        match entries.get(workflow_id) {
            Some(entry) => entry.robot_id != self_robot_id && entry.expires_at > now,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn non_expired_affinity_to_another_robot_conflicts() {
        let table = AffinityTable::new();
        let now = Utc::now();
        let other = Uuid::new_v4();
        table.advertise(AffinityAdvertisement {
            workflow_id: "wf-1".to_string(),
            robot_id: other,
            expires_at: now + chrono::Duration::minutes(5),
            state_keys: vec!["session".to_string()],
        });

        assert!(table.conflicts("wf-1", Uuid::new_v4(), now));
    }

    #[test]
    fn affinity_to_self_does_not_conflict() {
        let table = AffinityTable::new();
        let now = Utc::now();
        let me = Uuid::new_v4();
        table.advertise(AffinityAdvertisement {
            workflow_id: "wf-1".to_string(),
            robot_id: me,
            expires_at: now + chrono::Duration::minutes(5),
            state_keys: vec![],
        });

        assert!(!table.conflicts("wf-1", me, now));
    }

    #[test]
    fn expired_affinity_does_not_conflict() {
        let table = AffinityTable::new();
        let now = Utc::now();
        table.advertise(AffinityAdvertisement {
            workflow_id: "wf-1".to_string(),
            robot_id: Uuid::new_v4(),
            expires_at: now - chrono::Duration::minutes(1),
            state_keys: vec![],
        });

        assert!(!table.conflicts("wf-1", Uuid::new_v4(), now));
    }

    #[test]
    fn unknown_workflow_does_not_conflict() {
        let table = AffinityTable::new();
        assert!(!table.conflicts("wf-unknown", Uuid::new_v4(), Utc::now()));
    }
}
