//! Completion-report correlation
//!
//! Reports carry the correlation context of their execution and the
//! `dispatch_id` of the dispatch they answer. Anything that does not match
//! an in-flight dispatch is discarded without error; the bus may replay
//! events and workers may answer long after a timeout.

use std::sync::Arc;

use tracing::debug;

use crate::domain::{
    ReportEvent, SequenceExecution, SequenceExecutionFilter, SequenceExecutionRepository,
};
use crate::EngineError;

/// Resolves completion reports to the execution they belong to
pub struct ReportCorrelator {
    executions: Arc<dyn SequenceExecutionRepository>,
}

impl ReportCorrelator {
    /// Create a correlator over the given store
    pub fn new(executions: Arc<dyn SequenceExecutionRepository>) -> Self {
        Self { executions }
    }

    /// Find the execution a report belongs to
    ///
    /// Returns `Ok(None)` for reports that must be dropped: unknown
    /// context, terminal or queued execution, or a `dispatch_id` that does
    /// not match the task currently in flight.
    pub async fn correlate(
        &self,
        report: &ReportEvent,
    ) -> Result<Option<SequenceExecution>, EngineError> {
        let filter = SequenceExecutionFilter::by_correlation(&report.context);
        let execution = match self.executions.get(&filter).await?.into_iter().next() {
            Some(execution) => execution,
            None => {
                debug!(
                    context = %report.context,
                    "discarding report with unknown context"
                );
                return Ok(None);
            }
        };

        if execution.is_terminal() {
            debug!(
                execution_id = %execution.id,
                state = %execution.status.state,
                "discarding report for terminal execution"
            );
            return Ok(None);
        }
        if execution.status.queued {
            debug!(
                execution_id = %execution.id,
                "discarding report for queued execution"
            );
            return Ok(None);
        }

        match execution.current_dispatch_id() {
            Some(dispatch_id) if dispatch_id == report.dispatch_id => Ok(Some(execution)),
            Some(dispatch_id) => {
                debug!(
                    execution_id = %execution.id,
                    expected = %dispatch_id,
                    received = %report.dispatch_id,
                    "discarding report for stale dispatch"
                );
                Ok(None)
            }
            None => {
                debug!(
                    execution_id = %execution.id,
                    "discarding report; no task in flight"
                );
                Ok(None)
            }
        }
    }
}
