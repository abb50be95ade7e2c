//! Application services coordinating the domain model
//!
//! Everything stateful lives behind the repository traits; the services
//! here hold only `Arc` handles and configuration.

pub mod admission;
pub mod correlation;
pub mod dispatcher;
pub mod sequence_execution_service;

pub use admission::{Admission, AdmissionControl};
pub use correlation::ReportCorrelator;
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use sequence_execution_service::SequenceExecutionService;

use std::time::Duration;

/// Tunables of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Budget for a dispatched task to report completion before the
    /// execution is timed out
    pub task_timeout: Duration,

    /// How many times a dispatch publish is attempted before the execution
    /// is timed out
    pub publish_retry_attempts: u32,

    /// Base backoff between publish attempts; grows linearly per attempt
    pub publish_retry_backoff: Duration,

    /// How many times a conflicted write is re-read and re-applied before
    /// giving up
    pub conflict_retry_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(30 * 60),
            publish_retry_attempts: 3,
            publish_retry_backoff: Duration::from_millis(100),
            conflict_retry_attempts: 3,
        }
    }
}
