pub mod cleanup;
pub mod scheduler;
pub mod validation;

use crate::error::AppError;
use async_trait::async_trait;

pub use cleanup::LogCleanupJob;
pub use scheduler::JobScheduler;
pub use validation::KeyValidationJob;

/// Result of one job execution.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub success: bool,
    pub message: String,
    pub items_processed: u64,
}

impl JobResult {
    pub fn success_with_count(count: u64) -> Self {
        Self {
            success: true,
            message: format!("processed {count} items"),
            items_processed: count,
        }
    }

    pub fn failure(message: String) -> Self {
        Self {
            success: false,
            message,
            items_processed: 0,
        }
    }
}

/// An executable background job. Errors are logged by the scheduler and the
/// job is retried on its next tick; they never affect the request path.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self) -> Result<JobResult, AppError>;
}
