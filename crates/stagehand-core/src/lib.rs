//! Stagehand Core - durable sequence execution engine
//!
//! This crate contains the engine that turns trigger events into sequence
//! executions: one persisted state machine instance per trigger, task
//! dispatch over an at-least-once bus, fan-in aggregation of worker
//! reports, per-(project, stage) admission control, and wall-clock delays
//! and timeouts that survive a restart.
//!
//! Persistence, bus transport, and timers sit behind the traits in
//! [`domain::repository`]; the in-memory implementations behind the
//! `testing` feature back the tests, the durable store lives in its own
//! crate.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stagehand_core::application::{EngineConfig, SequenceExecutionService};
//! use stagehand_core::domain::repository::memory::{
//!     MemoryDefinitionSource, MemoryEventPublisher, MemorySequenceExecutionRepository,
//!     MemoryTimerRepository,
//! };
//!
//! # async fn wire() {
//! let (timers, _timer_rx) = MemoryTimerRepository::new();
//! let service = SequenceExecutionService::new(
//!     Arc::new(MemorySequenceExecutionRepository::new()),
//!     Arc::new(MemoryDefinitionSource::new()),
//!     Arc::new(MemoryEventPublisher::new()),
//!     Arc::new(timers),
//!     EngineConfig::default(),
//! );
//! # }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod application;
pub mod domain;
pub mod error;
pub mod types;

pub use error::EngineError;
pub use types::PropertyMap;

pub use application::{EngineConfig, SequenceExecutionService};
pub use domain::{
    EventScope, ReportEvent, SequenceDefinition, SequenceExecution, SequenceExecutionFilter,
    SequenceState, TriggerEvent,
};
