//! Repository and collaborator traits for the Stagehand engine
//!
//! This module defines the seams the engine depends on. External crates
//! implement these traits to provide persistence, bus transport, and timer
//! mechanisms.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::events::DispatchEvent;
use super::execution::{SequenceExecution, SequenceState};
use super::scope::EventScope;
use super::sequence::SequenceDefinition;
use crate::EngineError;

/// Query filter for the execution store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceExecutionFilter {
    /// Match a single execution by id
    pub id: Option<String>,

    /// Match by the trigger's correlation identifier
    pub correlation_id: Option<String>,

    /// Match by project
    pub project: Option<String>,

    /// Match by stage
    pub stage: Option<String>,

    /// Match by service
    pub service: Option<String>,

    /// Match by sequence name
    pub name: Option<String>,

    /// Match any of the given states; empty means any state
    pub states: Vec<SequenceState>,

    /// Match by the queued flag
    pub queued: Option<bool>,
}

impl SequenceExecutionFilter {
    /// Filter matching a single execution by id
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Filter matching executions by correlation identifier
    pub fn by_correlation(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::default()
        }
    }

    /// Filter matching every execution of a project
    pub fn for_project(project: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            ..Self::default()
        }
    }

    /// Filter matching the admission queue of a (project, stage) pair
    pub fn for_scope_queue(scope: &EventScope) -> Self {
        Self {
            project: Some(scope.project.clone()),
            stage: Some(scope.stage.clone()),
            ..Self::default()
        }
    }

    /// Restrict the filter to the given states
    pub fn with_states(mut self, states: Vec<SequenceState>) -> Self {
        self.states = states;
        self
    }

    /// Restrict the filter to queued or non-queued executions
    pub fn with_queued(mut self, queued: bool) -> Self {
        self.queued = Some(queued);
        self
    }

    /// Whether an execution satisfies every set criterion
    pub fn matches(&self, execution: &SequenceExecution) -> bool {
        if let Some(id) = &self.id {
            if &execution.id != id {
                return false;
            }
        }
        if let Some(correlation_id) = &self.correlation_id {
            if &execution.correlation_id != correlation_id {
                return false;
            }
        }
        if let Some(project) = &self.project {
            if &execution.scope.project != project {
                return false;
            }
        }
        if let Some(stage) = &self.stage {
            if &execution.scope.stage != stage {
                return false;
            }
        }
        if let Some(service) = &self.service {
            if &execution.scope.service != service {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &execution.sequence.name != name {
                return false;
            }
        }
        if !self.states.is_empty() && !self.states.contains(&execution.status.state) {
            return false;
        }
        if let Some(queued) = self.queued {
            if execution.status.queued != queued {
                return false;
            }
        }
        true
    }
}

/// Versioned store holding one record per sequence execution
#[async_trait]
pub trait SequenceExecutionRepository: Send + Sync {
    /// Load every execution matching the filter, ordered by trigger time
    async fn get(
        &self,
        filter: &SequenceExecutionFilter,
    ) -> Result<Vec<SequenceExecution>, EngineError>;

    /// Insert or update an execution, returning the new revision
    ///
    /// With `expected_revision` set, the write fails with
    /// [`EngineError::Conflict`] unless the stored revision still matches
    /// (0 meaning the record must not exist yet). `None` writes
    /// unconditionally; the migrator uses this path.
    async fn upsert(
        &self,
        execution: &SequenceExecution,
        expected_revision: Option<u64>,
    ) -> Result<u64, EngineError>;
}

/// Resolves sequence definitions from project configuration
///
/// Project configuration lives in an external store; the engine only ever
/// sees the snapshot it copies onto a new execution.
#[async_trait]
pub trait SequenceDefinitionSource: Send + Sync {
    /// Resolve the named sequence for a scope, if configured
    async fn resolve(
        &self,
        scope: &EventScope,
        sequence: &str,
    ) -> Result<Option<SequenceDefinition>, EngineError>;
}

/// Publishes dispatch events to the bus
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one dispatch event; failures are retried by the dispatcher
    async fn publish_dispatch(&self, event: &DispatchEvent) -> Result<(), EngineError>;
}

/// What a wall-clock timer is armed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// A post-predecessor delay before the next dispatch
    DispatchDelay,
    /// The per-dispatch completion-report deadline
    DispatchTimeout,
}

/// A fired wall-clock timer
#[derive(Debug, Clone, PartialEq)]
pub struct TimerFired {
    /// Execution the timer belongs to
    pub execution_id: String,
    /// What the timer was armed for
    pub kind: TimerKind,
    /// The deadline the timer was armed at
    pub deadline: DateTime<Utc>,
}

/// Wall-clock timer mechanism independent of the message bus
///
/// Deadlines are also persisted on the execution itself, so implementations
/// only need best-effort delivery; the engine re-checks persisted state when
/// a timer fires and re-arms outstanding timers on startup.
#[async_trait]
pub trait TimerRepository: Send + Sync {
    /// Arm a timer that fires at the given wall-clock instant
    async fn schedule_at(
        &self,
        execution_id: &str,
        kind: TimerKind,
        at: DateTime<Utc>,
    ) -> Result<String, EngineError>;

    /// Disarm a previously scheduled timer
    async fn cancel(&self, timer_id: &str) -> Result<(), EngineError>;
}

/// Lists the projects known to the platform
///
/// Used by the schema migrator to walk every project's executions.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    /// Names of all known projects
    async fn project_names(&self) -> Result<Vec<String>, EngineError>;
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    /// In-memory execution store with revision checking
    ///
    /// Holds plain domain values; the persistent store with its encoded
    /// record format lives in its own crate.
    pub struct MemorySequenceExecutionRepository {
        executions: DashMap<String, SequenceExecution>,
    }

    impl MemorySequenceExecutionRepository {
        /// Create an empty store
        pub fn new() -> Self {
            Self {
                executions: DashMap::new(),
            }
        }
    }

    impl Default for MemorySequenceExecutionRepository {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl SequenceExecutionRepository for MemorySequenceExecutionRepository {
        async fn get(
            &self,
            filter: &SequenceExecutionFilter,
        ) -> Result<Vec<SequenceExecution>, EngineError> {
            let mut matching: Vec<SequenceExecution> = self
                .executions
                .iter()
                .filter(|entry| filter.matches(entry.value()))
                .map(|entry| entry.value().clone())
                .collect();
            matching.sort_by_key(|e| e.triggered_at);
            Ok(matching)
        }

        async fn upsert(
            &self,
            execution: &SequenceExecution,
            expected_revision: Option<u64>,
        ) -> Result<u64, EngineError> {
            let current = self.executions.get(&execution.id).map(|e| e.revision);
            if let Some(expected) = expected_revision {
                if current.unwrap_or(0) != expected {
                    return Err(EngineError::Conflict(format!(
                        "execution {} is at revision {}, expected {}",
                        execution.id,
                        current.unwrap_or(0),
                        expected
                    )));
                }
            }
            let revision = current.unwrap_or(0) + 1;
            let mut stored = execution.clone();
            stored.revision = revision;
            self.executions.insert(stored.id.clone(), stored);
            Ok(revision)
        }
    }

    /// In-memory publisher that records every dispatch event
    ///
    /// A number of upcoming publishes can be made to fail to exercise the
    /// dispatcher's retry path.
    pub struct MemoryEventPublisher {
        published: Arc<Mutex<Vec<DispatchEvent>>>,
        failures_remaining: AtomicUsize,
    }

    impl MemoryEventPublisher {
        /// Create a new memory publisher
        pub fn new() -> Self {
            Self {
                published: Arc::new(Mutex::new(Vec::new())),
                failures_remaining: AtomicUsize::new(0),
            }
        }

        /// Make the next `count` publishes fail
        pub fn fail_next(&self, count: usize) {
            self.failures_remaining.store(count, Ordering::SeqCst);
        }

        /// Every dispatch published so far, in order
        pub fn published(&self) -> Vec<DispatchEvent> {
            self.published.lock().expect("publisher lock poisoned").clone()
        }
    }

    impl Default for MemoryEventPublisher {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl EventPublisher for MemoryEventPublisher {
        async fn publish_dispatch(&self, event: &DispatchEvent) -> Result<(), EngineError> {
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::Dispatch("bus unavailable".to_string()));
            }
            self.published
                .lock()
                .expect("publisher lock poisoned")
                .push(event.clone());
            Ok(())
        }
    }

    /// In-memory definition source keyed by (project, stage, sequence name)
    pub struct MemoryDefinitionSource {
        definitions: DashMap<(String, String, String), SequenceDefinition>,
    }

    impl MemoryDefinitionSource {
        /// Create an empty definition source
        pub fn new() -> Self {
            Self {
                definitions: DashMap::new(),
            }
        }

        /// Register a definition for a (project, stage)
        pub fn register(&self, scope: &EventScope, definition: SequenceDefinition) {
            self.definitions.insert(
                (
                    scope.project.clone(),
                    scope.stage.clone(),
                    definition.name.clone(),
                ),
                definition,
            );
        }
    }

    impl Default for MemoryDefinitionSource {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl SequenceDefinitionSource for MemoryDefinitionSource {
        async fn resolve(
            &self,
            scope: &EventScope,
            sequence: &str,
        ) -> Result<Option<SequenceDefinition>, EngineError> {
            let key = (
                scope.project.clone(),
                scope.stage.clone(),
                sequence.to_string(),
            );
            Ok(self.definitions.get(&key).map(|d| d.clone()))
        }
    }

    type TimerMapEntry = (DateTime<Utc>, String, TimerKind);

    /// In-memory wall-clock timer repository
    ///
    /// A background task polls the armed deadlines and delivers fired
    /// timers over a channel.
    pub struct MemoryTimerRepository {
        timers: Arc<DashMap<String, TimerMapEntry>>,
        timer_tx: mpsc::Sender<TimerFired>,
    }

    impl MemoryTimerRepository {
        /// Create a new memory timer repository and its fired-timer channel
        pub fn new() -> (Self, mpsc::Receiver<TimerFired>) {
            let (timer_tx, timer_rx) = mpsc::channel(32);

            let repo = Self {
                timers: Arc::new(DashMap::new()),
                timer_tx,
            };

            // Start the timer processor
            let timers_ref = repo.timers.clone();
            let tx_ref = repo.timer_tx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(20)).await;

                    let now = Utc::now();
                    let mut expired = Vec::new();
                    for entry in timers_ref.iter() {
                        let (deadline, execution_id, kind) = entry.value();
                        if *deadline <= now {
                            expired.push((
                                entry.key().clone(),
                                TimerFired {
                                    execution_id: execution_id.clone(),
                                    kind: *kind,
                                    deadline: *deadline,
                                },
                            ));
                        }
                    }

                    for (id, fired) in expired {
                        timers_ref.remove(&id);
                        if tx_ref.send(fired).await.is_err() {
                            // Channel closed, likely shutdown
                            return;
                        }
                    }
                }
            });

            (repo, timer_rx)
        }
    }

    #[async_trait]
    impl TimerRepository for MemoryTimerRepository {
        async fn schedule_at(
            &self,
            execution_id: &str,
            kind: TimerKind,
            at: DateTime<Utc>,
        ) -> Result<String, EngineError> {
            let timer_id = Uuid::new_v4().to_string();
            self.timers
                .insert(timer_id.clone(), (at, execution_id.to_string(), kind));
            Ok(timer_id)
        }

        async fn cancel(&self, timer_id: &str) -> Result<(), EngineError> {
            self.timers.remove(timer_id);
            Ok(())
        }
    }
}
