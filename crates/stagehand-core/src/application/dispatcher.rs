//! Task dispatch and delay handling
//!
//! The dispatcher mutates the in-memory execution only; callers persist the
//! result and arm wall-clock timers afterwards, so a timer can never fire
//! before its deadline is durable.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::application::EngineConfig;
use crate::domain::{
    DispatchEvent, EventPublisher, SequenceExecution, TaskExecutionState, TaskSpec, TimeoutReason,
};
use crate::{EngineError, PropertyMap};

/// What happened when the dispatcher advanced an execution
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A task was dispatched; a completion report is due by the deadline
    Dispatched {
        /// Report deadline; `None` for the approval gate
        timeout_at: Option<DateTime<Utc>>,
    },

    /// The next task has a delay that has not elapsed yet
    Delayed(DateTime<Utc>),

    /// An approval gate was dispatched; the execution is suspended
    Suspended,

    /// No task remained; the execution finished
    Finished,

    /// The dispatch could not be published; the execution timed out
    TimedOut,
}

/// Dispatches the next task of an execution onto the bus
pub struct Dispatcher {
    publisher: Arc<dyn EventPublisher>,
    config: EngineConfig,
}

impl Dispatcher {
    /// Create a dispatcher publishing through the given bus handle
    pub fn new(publisher: Arc<dyn EventPublisher>, config: EngineConfig) -> Self {
        Self { publisher, config }
    }

    /// Advance the execution by one step at wall-clock instant `now`
    ///
    /// Finishes the execution when no task remains (either the sequence is
    /// exhausted or the last result was a failure), honors a configured
    /// post-predecessor delay, and otherwise dispatches the next task with
    /// a fresh `dispatch_id`.
    pub async fn dispatch_next(
        &self,
        execution: &mut SequenceExecution,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, EngineError> {
        let task = match execution.next_task() {
            Some(task) => task.clone(),
            None => {
                execution.finish()?;
                info!(
                    execution_id = %execution.id,
                    scope = %execution.scope,
                    aborted = execution.last_result_failed(),
                    "sequence execution finished"
                );
                return Ok(DispatchOutcome::Finished);
            }
        };

        match execution.status.dispatch_after {
            Some(at) if at > now => return Ok(DispatchOutcome::Delayed(at)),
            Some(_) => execution.status.dispatch_after = None,
            None => {
                if let Some(delay) = task.triggered_after_duration()? {
                    if !delay.is_zero() {
                        let at = now
                            + ChronoDuration::from_std(delay).map_err(|e| {
                                EngineError::Validation(format!(
                                    "delay of task {} out of range: {e}",
                                    task.name
                                ))
                            })?;
                        execution.status.dispatch_after = Some(at);
                        return Ok(DispatchOutcome::Delayed(at));
                    }
                }
            }
        }

        let state = TaskExecutionState::new(&task.name);
        let event = DispatchEvent {
            context: execution.correlation_id.clone(),
            dispatch_id: state.dispatch_id.clone(),
            task_name: task.name.clone(),
            scope: execution.scope.clone(),
            properties: self.dispatch_properties(execution, &task),
        };
        execution.status.current_task = Some(state);

        if let Err(e) = self.publish_with_retry(&event).await {
            warn!(
                execution_id = %execution.id,
                task = %task.name,
                error = %e,
                "dispatch publish failed after retries; timing execution out"
            );
            execution.time_out(TimeoutReason::DispatchFailed)?;
            return Ok(DispatchOutcome::TimedOut);
        }

        info!(
            execution_id = %execution.id,
            task = %task.name,
            dispatch_id = %event.dispatch_id,
            "dispatched task"
        );

        if task.is_approval() {
            execution.suspend()?;
            Ok(DispatchOutcome::Suspended)
        } else {
            execution.begin_waiting()?;
            let timeout_at = now
                + ChronoDuration::from_std(self.config.task_timeout).map_err(|e| {
                    EngineError::Timer(format!("task timeout out of range: {e}"))
                })?;
            execution.status.timeout_at = Some(timeout_at);
            Ok(DispatchOutcome::Dispatched {
                timeout_at: Some(timeout_at),
            })
        }
    }

    /// Payload for a dispatch: trigger input, then every finalized task's
    /// aggregated payload in completion order, then the task spec's own
    /// properties
    fn dispatch_properties(&self, execution: &SequenceExecution, task: &TaskSpec) -> PropertyMap {
        let mut merged = execution.input_properties.clone();
        for previous in &execution.status.previous_tasks {
            merged.merge(&previous.properties);
        }
        merged.merge(&task.properties);
        merged
    }

    async fn publish_with_retry(&self, event: &DispatchEvent) -> Result<(), EngineError> {
        let attempts = self.config.publish_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.publisher.publish_dispatch(event).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        dispatch_id = %event.dispatch_id,
                        attempt,
                        error = %e,
                        "dispatch publish attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.publish_retry_backoff * attempt).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| EngineError::Dispatch("publish failed".to_string())))
    }
}
