//! The boundary between the agent and workflow execution (spec §1: "workflow
//! execution itself" is explicitly out of scope; spec §9: "opaque handles
//! tied to the job's lifetime"). This crate defines the seam only — no
//! `Executor` is implemented here.

use async_trait::async_trait;
use rpa_orchestrator_core::job::JobId;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("execution failed: {0}")]
    Failed(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("resource acquisition failed: {0}")]
    ResourceUnavailable(String),
}

/// A progress tick reported mid-execution (spec §4.5.1 step 3).
#[derive(Debug, Clone)]
pub struct ProgressTick {
    pub job_id: JobId,
    pub progress: u8,
    pub current_node: Option<String>,
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressTick>;

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub result: Option<Value>,
}

/// An opaque resource acquired for the lifetime of one job (browser context,
/// DB handle, HTTP client — spec §9). The agent never inspects it; dropping
/// it releases whatever the executor acquired.
pub trait ResourceHandle: Send {}

/// Hands `workflow_json` to an external collaborator and reports progress
/// through `progress`. `cancel` is polled cooperatively between nodes (spec
/// §4.5.3); the executor decides how finely to check it.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        job_id: JobId,
        workflow_json: Value,
        progress: ProgressSender,
        cancel: CancelFlag,
    ) -> Result<JobOutcome, ExecutorError>;
}

/// Cooperative cancellation flag shared between the agent's claim-loop state
/// and an in-flight execution task (spec §4.5.3).
#[derive(Debug, Clone)]
pub struct CancelFlag(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag(std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}
