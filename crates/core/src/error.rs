//! Error taxonomy for the orchestration core.
//!
//! Every mutating operation on the queue, dispatcher, scheduler, or claim
//! store returns one of these instead of throwing; the taxonomy mirrors the
//! policy table in the orchestration spec (state machine violations are not
//! retried, transient storage errors are retried with backoff, lease loss
//! aborts local execution without settling).

use std::time::Duration;

use uuid::Uuid;

use crate::job::JobStatus;

/// Errors raised by the job queue, dispatcher, scheduler, and engine facade.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("job {job_id} cannot transition from {from:?} to {to:?}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("duplicate job: fingerprint {fingerprint} already queued as {existing_job_id}")]
    Duplicate {
        fingerprint: String,
        existing_job_id: Uuid,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("robot {robot_id} at capacity ({current}/{max})")]
    CapacityExceeded {
        robot_id: Uuid,
        current: u32,
        max: u32,
    },

    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("executor failed for job {job_id}: {message}")]
    ExecutorError { job_id: Uuid, message: String },

    #[error("job {job_id} timed out after {elapsed:?}")]
    Timeout { job_id: Uuid, elapsed: Duration },
}

/// Errors raised by a [`crate::claim::ClaimStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum ClaimStoreError {
    /// The caller's lease generation no longer matches what the store holds;
    /// another claim cycle has already reclaimed the job. The caller must
    /// abandon local execution and must not settle the job.
    #[error("lease lost for job {job_id} (robot {robot_id})")]
    LeaseLost { job_id: Uuid, robot_id: Uuid },

    /// A connection drop, deadlock, or similar recoverable storage failure.
    /// Callers retry with [`backoff::Backoff`].
    #[error("transient storage error: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

/// Errors raised by a [`crate::realtime::RealtimeChannel`] implementation.
///
/// Realtime is advisory only (spec §4.6): every caller degrades to
/// poll-only mode on [`RealtimeError::Transient`] rather than propagating it.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("transient realtime error: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("channel closed")]
    Closed,
}

/// Shared exponential backoff policy: base 1s, factor 2.0, cap 60s.
///
/// Used by robot/orchestrator loops to retry `Transient` storage or realtime
/// failures without hammering the database.
pub mod backoff {
    use std::time::Duration;

    #[derive(Debug, Clone, Copy)]
    pub struct Backoff {
        base: Duration,
        factor: f64,
        cap: Duration,
        attempt: u32,
    }

    impl Default for Backoff {
        fn default() -> Self {
            Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(60))
        }
    }

    impl Backoff {
        pub fn new(base: Duration, factor: f64, cap: Duration) -> Self {
            Self {
                base,
                factor,
                cap,
                attempt: 0,
            }
        }

        /// Delay for the current attempt, then advance to the next.
        pub fn next_delay(&mut self) -> Duration {
            let scaled = self.base.as_secs_f64() * self.factor.powi(self.attempt as i32);
            self.attempt = self.attempt.saturating_add(1);
            Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
        }

        pub fn reset(&mut self) {
            self.attempt = 0;
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn grows_geometrically_then_caps() {
            let mut b = Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(10));
            assert_eq!(b.next_delay(), Duration::from_secs(1));
            assert_eq!(b.next_delay(), Duration::from_secs(2));
            assert_eq!(b.next_delay(), Duration::from_secs(4));
            assert_eq!(b.next_delay(), Duration::from_secs(8));
            assert_eq!(b.next_delay(), Duration::from_secs(10));
            assert_eq!(b.next_delay(), Duration::from_secs(10));
        }

        #[test]
        fn reset_restarts_from_base() {
            let mut b = Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(60));
            b.next_delay();
            b.next_delay();
            b.reset();
            assert_eq!(b.next_delay(), Duration::from_secs(1));
        }
    }
}

/// Poll-loop-local backoff for the hybrid claim loop (spec §4.5): starts at
/// `poll_interval`, factor 1.5, caps at 10s.
pub fn claim_loop_backoff(poll_interval: Duration) -> backoff::Backoff {
    backoff::Backoff::new(poll_interval, 1.5, Duration::from_secs(10))
}
