//! Domain model of the sequence execution engine
//!
//! Pure state and transition logic with no I/O. The traits in
//! [`repository`] are the only seams to the outside world.

pub mod events;
pub mod execution;
pub mod repository;
pub mod scope;
pub mod sequence;

pub use events::{DispatchEvent, ReportEvent, TriggerData, TriggerEvent};
pub use execution::{
    ResultType, SequenceExecution, SequenceExecutionStatus, SequenceState, StatusType, TaskEvent,
    TaskEventKind, TaskExecutionResult, TaskExecutionState, TimeoutReason,
};
pub use repository::{
    EventPublisher, ProjectRepository, SequenceDefinitionSource, SequenceExecutionFilter,
    SequenceExecutionRepository, TimerFired, TimerKind, TimerRepository,
};
pub use scope::EventScope;
pub use sequence::{SequenceDefinition, TaskSpec, APPROVAL_TASK_NAME};
