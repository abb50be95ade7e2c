use crate::domain::scope::EventScope;
use crate::domain::sequence::{SequenceDefinition, TaskSpec};
use crate::{EngineError, PropertyMap};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a sequence execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SequenceState {
    /// Created from a trigger; no task dispatched yet
    Triggered,

    /// A task has been dispatched and the engine awaits completion reports
    Waiting,

    /// An approval gate is in flight, awaiting an external decision
    Suspended,

    /// Explicitly paused from the outside
    Paused,

    /// All tasks completed (or the sequence aborted on a failed task result)
    Finished,

    /// Cancelled before reaching the end
    Cancelled,

    /// A dispatch got no response in time, or could not be published
    TimedOut,
}

impl SequenceState {
    /// Whether no further transitions are defined out of this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SequenceState::Finished | SequenceState::Cancelled | SequenceState::TimedOut
        )
    }
}

impl std::fmt::Display for SequenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SequenceState::Triggered => "triggered",
            SequenceState::Waiting => "waiting",
            SequenceState::Suspended => "suspended",
            SequenceState::Paused => "paused",
            SequenceState::Finished => "finished",
            SequenceState::Cancelled => "cancelled",
            SequenceState::TimedOut => "timedOut",
        };
        f.write_str(name)
    }
}

/// Result of one task execution, worst-of aggregated across reporters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ResultType {
    /// Task succeeded
    #[default]
    Pass,
    /// Task succeeded with warnings
    Warning,
    /// Task failed
    Fail,
}

impl ResultType {
    /// Combine two results, keeping the worse one (Fail > Warning > Pass)
    pub fn worst(self, other: ResultType) -> ResultType {
        use ResultType::*;
        match (self, other) {
            (Fail, _) | (_, Fail) => Fail,
            (Warning, _) | (_, Warning) => Warning,
            (Pass, Pass) => Pass,
        }
    }
}

/// Execution status a reporter observed while running a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum StatusType {
    /// The reporter ran the task to completion
    #[default]
    Succeeded,
    /// The reporter hit an error while running the task
    Errored,
    /// The reporter could not determine the outcome
    Unknown,
}

impl StatusType {
    /// Combine two statuses, keeping the worse one (Errored > Unknown >
    /// Succeeded)
    pub fn worst(self, other: StatusType) -> StatusType {
        use StatusType::*;
        match (self, other) {
            (Errored, _) | (_, Errored) => Errored,
            (Unknown, _) | (_, Unknown) => Unknown,
            (Succeeded, Succeeded) => Succeeded,
        }
    }
}

/// Why an execution ended up in the timed-out state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeoutReason {
    /// The dispatch was published but no completion report arrived in time
    NoResponse,
    /// The dispatch event could not be published within the retry budget
    DispatchFailed,
}

/// Kind of a task completion report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskEventKind {
    /// A reporter picked up the dispatched task
    Started,
    /// A reporter finished the dispatched task
    Finished,
}

/// One reporter's report for the currently dispatched task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    /// Started or finished
    pub kind: TaskEventKind,

    /// Identity of the reporting worker service
    pub source: String,

    /// Result the reporter observed
    pub result: ResultType,

    /// Status the reporter observed
    pub status: StatusType,

    /// When the report was emitted
    pub time: DateTime<Utc>,

    /// Reporter-supplied payload, merged into the aggregate on finalization
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub properties: PropertyMap,
}

/// The task currently in flight (or most recently dispatched)
///
/// `dispatch_id` is a fresh random identifier generated at each dispatch and
/// is the sole correlation key accepted for completion reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionState {
    /// Name of the dispatched task
    pub name: String,

    /// Identifier of this particular dispatch
    pub dispatch_id: String,

    /// Reports collected for this dispatch, in arrival order
    #[serde(default)]
    pub events: Vec<TaskEvent>,
}

impl TaskExecutionState {
    /// Create the state for a fresh dispatch of the named task
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dispatch_id: Uuid::new_v4().to_string(),
            events: Vec::new(),
        }
    }

    fn finished_events(&self) -> impl Iterator<Item = &TaskEvent> {
        self.events
            .iter()
            .filter(|e| e.kind == TaskEventKind::Finished)
    }

    /// Worst-of result over the finished reports collected so far
    pub fn aggregate_result(&self) -> ResultType {
        self.finished_events()
            .fold(ResultType::Pass, |acc, e| acc.worst(e.result))
    }

    /// Worst-of status over the finished reports collected so far
    pub fn aggregate_status(&self) -> StatusType {
        self.finished_events()
            .fold(StatusType::Succeeded, |acc, e| acc.worst(e.status))
    }

    /// Finished report payloads merged in arrival order
    pub fn aggregate_properties(&self) -> PropertyMap {
        let mut merged = PropertyMap::new();
        for event in self.finished_events() {
            merged.merge(&event.properties);
        }
        merged
    }

    /// Whether every reporter that started the task has also finished it
    ///
    /// A finished report with no preceding started report from the same
    /// source counts as a single-reporter fast path. At least one finished
    /// report is always required.
    pub fn is_complete(&self) -> bool {
        let mut any_finished = false;
        for event in &self.events {
            match event.kind {
                TaskEventKind::Finished => any_finished = true,
                TaskEventKind::Started => {
                    let finished = self.events.iter().any(|e| {
                        e.kind == TaskEventKind::Finished && e.source == event.source
                    });
                    if !finished {
                        return false;
                    }
                }
            }
        }
        any_finished
    }

    /// Aggregate the collected reports into the finalized task result
    pub fn to_result(&self) -> Result<TaskExecutionResult, EngineError> {
        if self.finished_events().next().is_none() {
            return Err(EngineError::StateTransition(format!(
                "cannot finalize task {} without completion reports",
                self.name
            )));
        }
        Ok(TaskExecutionResult {
            name: self.name.clone(),
            dispatch_id: self.dispatch_id.clone(),
            result: self.aggregate_result(),
            status: self.aggregate_status(),
            properties: self.aggregate_properties(),
        })
    }
}

/// Finalized, aggregated outcome of one completed task
///
/// Immutable once appended to `previous_tasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionResult {
    /// Task name
    pub name: String,

    /// Dispatch this result belongs to
    pub dispatch_id: String,

    /// Aggregated result
    pub result: ResultType,

    /// Aggregated status
    pub status: StatusType,

    /// Aggregated reporter payloads
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub properties: PropertyMap,
}

/// Mutable status block of a sequence execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceExecutionStatus {
    /// Current lifecycle state
    pub state: SequenceState,

    /// State the execution had before it was paused; set iff state is paused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_before_pause: Option<SequenceState>,

    /// Whether the execution is held back by admission control
    #[serde(default)]
    pub queued: bool,

    /// Finalized tasks, append-only, in completion order
    #[serde(default)]
    pub previous_tasks: Vec<TaskExecutionResult>,

    /// The task currently in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskExecutionState>,

    /// Wall-clock deadline before which the next task must not be dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_after: Option<DateTime<Utc>>,

    /// Wall-clock deadline by which a completion report must arrive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,

    /// Unexpired timeout budget stashed while paused, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_timeout_remaining_ms: Option<i64>,

    /// Diagnostic reason recorded when the state is timed out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out_reason: Option<TimeoutReason>,
}

impl Default for SequenceExecutionStatus {
    fn default() -> Self {
        Self {
            state: SequenceState::Triggered,
            state_before_pause: None,
            queued: false,
            previous_tasks: Vec::new(),
            current_task: None,
            dispatch_after: None,
            timeout_at: None,
            paused_timeout_remaining_ms: None,
            timed_out_reason: None,
        }
    }
}

/// Aggregate root: one workflow instance created per trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceExecution {
    /// Unique identifier, stable for the instance's lifetime
    pub id: String,

    /// Correlation identifier shared by every event of this instance
    pub correlation_id: String,

    /// Deployment coordinate the execution targets
    pub scope: EventScope,

    /// Snapshot of the sequence definition resolved at trigger time
    pub sequence: SequenceDefinition,

    /// Opaque payload from the triggering event, forwarded to every task
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub input_properties: PropertyMap,

    /// Mutable status block
    pub status: SequenceExecutionStatus,

    /// When the trigger was received; orders the FIFO scope queue
    pub triggered_at: DateTime<Utc>,

    /// Optimistic-concurrency token maintained by the store; not persisted
    /// as part of the record payload
    #[serde(skip)]
    pub revision: u64,
}

impl SequenceExecution {
    /// Create a fresh execution from a trigger
    pub fn new(
        correlation_id: impl Into<String>,
        scope: EventScope,
        sequence: SequenceDefinition,
        input_properties: PropertyMap,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.into(),
            scope,
            sequence,
            input_properties,
            status: SequenceExecutionStatus::default(),
            triggered_at: Utc::now(),
            revision: 0,
        }
    }

    /// Whether the execution reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.state.is_terminal()
    }

    /// Hold the execution back in the scope queue
    pub fn mark_queued(&mut self) {
        self.status.queued = true;
    }

    /// Release the execution from the scope queue
    pub fn clear_queued(&mut self) {
        self.status.queued = false;
    }

    /// Dispatch id of the task currently in flight, if any
    pub fn current_dispatch_id(&self) -> Option<&str> {
        self.status
            .current_task
            .as_ref()
            .map(|t| t.dispatch_id.as_str())
    }

    /// The next task to dispatch, or `None` when the sequence is exhausted
    /// or aborted by a failed task result
    pub fn next_task(&self) -> Option<&TaskSpec> {
        if self.last_result_failed() {
            return None;
        }
        self.sequence.task_at(self.status.previous_tasks.len())
    }

    /// Whether the most recently finalized task failed
    pub fn last_result_failed(&self) -> bool {
        self.status
            .previous_tasks
            .last()
            .map(|t| t.result == ResultType::Fail)
            .unwrap_or(false)
    }

    fn transition_error(&self, to: &str) -> EngineError {
        EngineError::StateTransition(format!(
            "cannot move execution {} from {} to {}",
            self.id, self.status.state, to
        ))
    }

    /// Enter the waiting state after a dispatch was emitted
    pub fn begin_waiting(&mut self) -> Result<(), EngineError> {
        match self.status.state {
            SequenceState::Triggered | SequenceState::Waiting | SequenceState::Suspended => {
                self.status.state = SequenceState::Waiting;
                Ok(())
            }
            _ => Err(self.transition_error("waiting")),
        }
    }

    /// Enter the suspended state for an approval gate
    pub fn suspend(&mut self) -> Result<(), EngineError> {
        match self.status.state {
            SequenceState::Triggered | SequenceState::Waiting => {
                self.status.state = SequenceState::Suspended;
                Ok(())
            }
            _ => Err(self.transition_error("suspended")),
        }
    }

    /// Pause the execution, remembering the state to restore on resume
    ///
    /// The unexpired timeout budget is stashed so a resumed execution is not
    /// penalized for elapsed pause time.
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.is_terminal() || self.status.state == SequenceState::Paused {
            return Err(self.transition_error("paused"));
        }
        self.status.state_before_pause = Some(self.status.state);
        self.status.state = SequenceState::Paused;
        if let Some(timeout_at) = self.status.timeout_at.take() {
            let remaining = (timeout_at - now).num_milliseconds().max(0);
            self.status.paused_timeout_remaining_ms = Some(remaining);
        }
        Ok(())
    }

    /// Resume a paused execution into the state it had before the pause
    ///
    /// No new dispatch is emitted and the in-flight `dispatch_id` is kept;
    /// a stashed timeout budget is re-armed relative to `now`.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status.state != SequenceState::Paused {
            return Err(self.transition_error("resumed"));
        }
        let restored = self
            .status
            .state_before_pause
            .take()
            .ok_or_else(|| {
                EngineError::StateTransition(format!(
                    "paused execution {} has no recorded prior state",
                    self.id
                ))
            })?;
        self.status.state = restored;
        if let Some(remaining_ms) = self.status.paused_timeout_remaining_ms.take() {
            if restored == SequenceState::Waiting {
                self.status.timeout_at = Some(now + ChronoDuration::milliseconds(remaining_ms));
            }
        }
        Ok(())
    }

    /// Cancel the execution from any non-terminal state
    pub fn cancel(&mut self) -> Result<(), EngineError> {
        if self.is_terminal() {
            return Err(self.transition_error("cancelled"));
        }
        self.status.state = SequenceState::Cancelled;
        self.status.state_before_pause = None;
        self.status.timeout_at = None;
        self.status.dispatch_after = None;
        self.status.paused_timeout_remaining_ms = None;
        Ok(())
    }

    /// Mark the execution timed out, preserving `current_task` for
    /// diagnostics
    pub fn time_out(&mut self, reason: TimeoutReason) -> Result<(), EngineError> {
        if self.is_terminal() || self.status.state == SequenceState::Paused {
            return Err(self.transition_error("timedOut"));
        }
        self.status.state = SequenceState::TimedOut;
        self.status.timed_out_reason = Some(reason);
        self.status.timeout_at = None;
        self.status.dispatch_after = None;
        Ok(())
    }

    /// Finish the execution after the last task completed (or the sequence
    /// aborted on a failed result)
    pub fn finish(&mut self) -> Result<(), EngineError> {
        match self.status.state {
            SequenceState::Triggered | SequenceState::Waiting => {
                self.status.state = SequenceState::Finished;
                self.status.timeout_at = None;
                self.status.dispatch_after = None;
                Ok(())
            }
            _ => Err(self.transition_error("finished")),
        }
    }

    /// Append a completion report to the task currently in flight
    pub fn append_event(&mut self, event: TaskEvent) -> Result<(), EngineError> {
        if self.is_terminal() {
            return Err(self.transition_error("reported"));
        }
        let current = self.status.current_task.as_mut().ok_or_else(|| {
            EngineError::StateTransition(format!(
                "execution {} has no task in flight",
                self.id
            ))
        })?;
        current.events.push(event);
        Ok(())
    }

    /// Move the completed current task into `previous_tasks`
    ///
    /// Clears the dispatch timeout; never succeeds with zero completion
    /// reports.
    pub fn finalize_current_task(&mut self) -> Result<TaskExecutionResult, EngineError> {
        let current = self.status.current_task.take().ok_or_else(|| {
            EngineError::StateTransition(format!(
                "execution {} has no task to finalize",
                self.id
            ))
        })?;
        let result = match current.to_result() {
            Ok(result) => result,
            Err(e) => {
                self.status.current_task = Some(current);
                return Err(e);
            }
        };
        self.status.previous_tasks.push(result.clone());
        self.status.timeout_at = None;
        Ok(result)
    }
}
