//! End-to-end scenarios against the in-process engine, mirroring the
//! literal sequences an operator would exercise by hand: submit, dispatch,
//! crash, reclaim, dedup, and scheduled triggers. These drive real
//! `OrchestratorEngine` background loops wherever practical rather than
//! calling queue/dispatcher internals directly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use rpa_orchestrator_core::realtime::{RealtimeChannel, Subscription};
use rpa_orchestrator_core::{
    ClaimStore, ClaimStoreError, EngineConfig, JobPriority, JobStatus, OrchestratorEngine, OrchestratorError, Robot,
    RobotStatus, Schedule, ScheduleFrequency, SubmitJobRequest,
};
use rpa_orchestrator_realtime::InProcessChannel;
use rpa_orchestrator_testing::InMemoryClaimStore;
use uuid::Uuid;

fn fast_config() -> EngineConfig {
    EngineConfig {
        dispatch_interval: StdDuration::from_millis(20),
        timeout_check_interval: StdDuration::from_secs(30),
        scheduler_tick_interval: StdDuration::from_millis(20),
        lease_reap_interval: StdDuration::from_secs(10),
        ..EngineConfig::default()
    }
}

fn robot(name: &str, max_concurrent_jobs: u32) -> Robot {
    Robot::new(Uuid::new_v4(), name, "default", max_concurrent_jobs, HashSet::new(), Utc::now())
}

async fn wait_until<F: Fn() -> bool>(timeout: StdDuration, predicate: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
}

/// S1 — basic dispatch and complete.
#[tokio::test]
async fn s1_basic_dispatch_and_complete() {
    let engine = OrchestratorEngine::builder().with_config(fast_config()).build();
    let r1 = robot("R1", 1);
    engine.register_robot(r1.clone());
    engine.start().await;

    let job = engine
        .submit_job(SubmitJobRequest::new("W", "W", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    let dispatched = wait_until(StdDuration::from_millis(500), || {
        engine.dispatcher().get_robot(r1.id).map(|r| r.current_jobs).unwrap_or(0) == 1
    })
    .await;
    assert!(dispatched, "job was not dispatched within the timeout");
    assert_eq!(engine.get_job(job.id).await.unwrap().status, JobStatus::Running);

    engine.complete_job(job.id, Some(serde_json::json!({}))).await.unwrap();
    assert_eq!(engine.get_job(job.id).await.unwrap().status, JobStatus::Completed);
    assert_eq!(engine.dispatcher().get_robot(r1.id).unwrap().current_jobs, 0);

    engine.stop().await;
}

/// S2 — priority ordering: CRITICAL, then HIGH, then NORMAL.
#[tokio::test]
async fn s2_priority_ordering() {
    let engine = OrchestratorEngine::builder().with_config(fast_config()).build();
    let r1 = robot("R1", 1);
    engine.register_robot(r1.clone());
    engine.start().await;

    let ja = engine
        .submit_job(SubmitJobRequest { priority: JobPriority::Normal, ..SubmitJobRequest::new("W", "W", serde_json::json!({})) })
        .await
        .unwrap();
    let jb = engine
        .submit_job(SubmitJobRequest { priority: JobPriority::High, ..SubmitJobRequest::new("W", "W", serde_json::json!({})) })
        .await
        .unwrap();
    let jc = engine
        .submit_job(SubmitJobRequest { priority: JobPriority::Critical, ..SubmitJobRequest::new("W", "W", serde_json::json!({})) })
        .await
        .unwrap();

    let first = poll_running(&engine, &[jc.id, jb.id, ja.id]).await;
    assert_eq!(first, jc.id, "critical priority job should dispatch first");
    engine.complete_job(jc.id, None).await.unwrap();

    let second = poll_running(&engine, &[jb.id, ja.id]).await;
    assert_eq!(second, jb.id, "high priority job should dispatch second");
    engine.complete_job(jb.id, None).await.unwrap();

    let third = poll_running(&engine, &[ja.id]).await;
    assert_eq!(third, ja.id, "normal priority job should dispatch last");

    engine.stop().await;
}

async fn poll_running(engine: &OrchestratorEngine, candidates: &[uuid::Uuid]) -> uuid::Uuid {
    let deadline = tokio::time::Instant::now() + StdDuration::from_millis(500);
    loop {
        for id in candidates {
            if let Some(job) = engine.get_job(*id).await {
                if job.status == JobStatus::Running {
                    return *id;
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no candidate dispatched within the timeout");
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
}

/// S3 — dedup: identical in-flight submission is rejected, a terminal one frees the fingerprint.
#[tokio::test]
async fn s3_dedup_within_window() {
    let engine = OrchestratorEngine::builder().build();

    let request = SubmitJobRequest { params: serde_json::json!({"x": 1}), ..SubmitJobRequest::new("W", "W", serde_json::json!({})) };
    let j1 = engine.submit_job(request.clone()).await.unwrap();

    let err = engine.submit_job(request.clone()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Duplicate { existing_job_id, .. } if existing_job_id == j1.id));

    engine.complete_job(j1.id, None).await.unwrap();

    let j3 = engine.submit_job(request).await.unwrap();
    assert_ne!(j3.id, j1.id);
}

/// S4 — crash recovery via lease expiry: a second robot reclaims after the
/// first's lease lapses, and the zombie's stale settle is rejected.
#[tokio::test]
async fn s4_crash_recovery_via_lease_expiry() {
    let store = InMemoryClaimStore::new();
    let job = store
        .enqueue(rpa_orchestrator_testing::fixtures::enqueue_record("W", Utc::now()))
        .await
        .unwrap();

    let r1 = Uuid::new_v4();
    let t0 = Utc::now();
    let claim1 = store.claim_job(r1, None, None, t0, 1).await.unwrap().pop().unwrap();
    assert_eq!(claim1.job.id, job.id);

    // R1 crashes: no heartbeat/extend_lease call. Jump past visibility_timeout (30s default).
    let t_reap = t0 + ChronoDuration::seconds(36);
    let reaped = store.reap_expired_leases(t_reap).await.unwrap();
    assert_eq!(reaped, vec![job.id]);

    let r2 = Uuid::new_v4();
    let claim2 = store.claim_job(r2, None, None, t_reap, 1).await.unwrap().pop().unwrap();
    assert_eq!(claim2.job.id, job.id);
    assert_ne!(claim2.lease_generation, claim1.lease_generation);

    let settled = store
        .settle(job.id, claim2.lease_generation, JobStatus::Completed, Some(serde_json::json!({"ok": true})), None, t_reap)
        .await
        .unwrap();
    assert_eq!(settled.status, JobStatus::Completed);

    let zombie_settle =
        store.settle(job.id, claim1.lease_generation, JobStatus::Failed, None, Some("zombie".to_string()), t_reap).await;
    assert!(matches!(zombie_settle, Err(ClaimStoreError::LeaseLost { .. })));

    let final_job = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(final_job.status, JobStatus::Completed, "zombie settle must not overwrite the real one");
}

/// S5 — targeted job waits for its offline target instead of going to another robot.
#[tokio::test]
async fn s5_targeted_job_waits_for_offline_target() {
    let engine = OrchestratorEngine::builder().with_config(fast_config()).build();
    let r1 = robot("R1", 1);
    let r2 = robot("R2", 1);
    engine.register_robot(r1.clone());
    engine.register_robot(r2.clone());
    engine.dispatcher().update_robot_status(r2.id, RobotStatus::Offline);
    engine.start().await;

    let job = engine
        .submit_job(SubmitJobRequest { robot_id: Some(r2.id), ..SubmitJobRequest::new("W", "W", serde_json::json!({})) })
        .await
        .unwrap();

    tokio::time::sleep(StdDuration::from_millis(150)).await;
    assert_eq!(engine.get_job(job.id).await.unwrap().status, JobStatus::Queued, "R1 must never receive a job targeted at R2");
    assert_eq!(engine.dispatcher().get_robot(r1.id).unwrap().current_jobs, 0);

    engine.dispatcher().update_robot_status(r2.id, RobotStatus::Online);
    engine.dispatcher().heartbeat(r2.id, Utc::now());

    let dispatched = wait_until(StdDuration::from_millis(500), || {
        engine.dispatcher().get_robot(r2.id).map(|r| r.current_jobs).unwrap_or(0) == 1
    })
    .await;
    assert!(dispatched, "job did not dispatch to R2 once it returned online");
    assert_eq!(engine.get_job(job.id).await.unwrap().robot_id, Some(r2.id));

    engine.stop().await;
}

/// S6 — a recurring trigger dedups a still-unconsumed job and produces a
/// fresh one once the prior instance reaches a terminal state. Uses a
/// once-per-second cron instead of the operator-facing once-per-minute
/// expression purely so the test runs in under a few seconds; the
/// mechanism (scheduler tick -> submit_job with check_duplicate) is the
/// same either way.
#[tokio::test]
async fn s6_schedule_fires_and_dedups_per_period() {
    let channel = Arc::new(InProcessChannel::new());
    let mut jobs_sub = channel.subscribe("jobs").await.unwrap();

    let engine = OrchestratorEngine::builder().with_config(fast_config()).with_realtime_channel(channel).build();

    let mut schedule = Schedule::new("every-second", "wf-s6", ScheduleFrequency::Cron);
    schedule.cron_expression = Some("*/1 * * * * *".to_string());
    engine.create_schedule(schedule.clone()).await.unwrap();
    engine.start().await;

    let first_job_id = next_job_queued(&mut jobs_sub, StdDuration::from_secs(3)).await;
    engine.complete_job(first_job_id, None).await.unwrap();

    let second_job_id = next_job_queued(&mut jobs_sub, StdDuration::from_secs(3)).await;
    assert_ne!(second_job_id, first_job_id, "the next period must produce a fresh job once the prior one is terminal");

    let run_count = engine.scheduler().get(schedule.id).await.unwrap().run_count;
    assert!(run_count >= 2);

    engine.stop().await;
}

async fn next_job_queued(sub: &mut Box<dyn Subscription>, timeout: StdDuration) -> uuid::Uuid {
    use rpa_orchestrator_core::RealtimeEvent;
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::time::Instant::now() >= deadline {
            panic!("no JobQueued event observed within the timeout");
        }
        match tokio::time::timeout(StdDuration::from_millis(100), sub.recv()).await {
            Ok(Ok(RealtimeEvent::JobQueued { job_id, .. })) => return job_id,
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => panic!("subscription error: {e}"),
            Err(_) => continue,
        }
    }
}
