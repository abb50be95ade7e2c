//! Per-(project, stage) admission control
//!
//! At most one execution per (project, stage) pair runs at a time; later
//! triggers are parked with the queued flag and admitted in trigger order
//! once the blocking execution reaches a terminal state.

use std::sync::Arc;

use crate::domain::{
    EventScope, SequenceExecution, SequenceExecutionFilter, SequenceExecutionRepository,
    SequenceState,
};
use crate::EngineError;

/// Decision taken for a freshly triggered execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The scope is free; the execution may dispatch immediately
    Active,
    /// Another execution holds the scope; this one is parked
    Queued,
}

/// States that hold the (project, stage) slot against later triggers
const BLOCKING_STATES: [SequenceState; 4] = [
    SequenceState::Triggered,
    SequenceState::Waiting,
    SequenceState::Suspended,
    SequenceState::Paused,
];

/// Serializes executions per (project, stage)
pub struct AdmissionControl {
    executions: Arc<dyn SequenceExecutionRepository>,
}

impl AdmissionControl {
    /// Create admission control over the given store
    pub fn new(executions: Arc<dyn SequenceExecutionRepository>) -> Self {
        Self { executions }
    }

    /// Decide whether a new execution may run or must queue
    pub async fn admit(&self, execution: &SequenceExecution) -> Result<Admission, EngineError> {
        let filter = SequenceExecutionFilter::for_scope_queue(&execution.scope)
            .with_states(BLOCKING_STATES.to_vec())
            .with_queued(false);

        let blocking = self
            .executions
            .get(&filter)
            .await?
            .into_iter()
            .any(|e| e.id != execution.id);

        if blocking {
            Ok(Admission::Queued)
        } else {
            Ok(Admission::Active)
        }
    }

    /// The oldest queued execution of a scope, by trigger time
    pub async fn next_queued(
        &self,
        scope: &EventScope,
    ) -> Result<Option<SequenceExecution>, EngineError> {
        let filter = SequenceExecutionFilter::for_scope_queue(scope)
            .with_states(vec![SequenceState::Triggered])
            .with_queued(true);

        // The store returns executions ordered by trigger time
        Ok(self.executions.get(&filter).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SequenceDefinition, TaskSpec};
    use crate::PropertyMap;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubRepo {
        executions: Mutex<Vec<SequenceExecution>>,
    }

    #[async_trait]
    impl SequenceExecutionRepository for StubRepo {
        async fn get(
            &self,
            filter: &SequenceExecutionFilter,
        ) -> Result<Vec<SequenceExecution>, EngineError> {
            let mut matching: Vec<SequenceExecution> = self
                .executions
                .lock()
                .unwrap()
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect();
            matching.sort_by_key(|e| e.triggered_at);
            Ok(matching)
        }

        async fn upsert(
            &self,
            _execution: &SequenceExecution,
            _expected_revision: Option<u64>,
        ) -> Result<u64, EngineError> {
            unimplemented!("not exercised by admission tests")
        }
    }

    fn execution(stage: &str) -> SequenceExecution {
        SequenceExecution::new(
            "ctx",
            EventScope::new("shop", stage, "carts"),
            SequenceDefinition::new("delivery", vec![TaskSpec::new("deploy")]),
            PropertyMap::new(),
        )
    }

    fn control(existing: Vec<SequenceExecution>) -> AdmissionControl {
        AdmissionControl::new(Arc::new(StubRepo {
            executions: Mutex::new(existing),
        }))
    }

    #[tokio::test]
    async fn test_empty_scope_admits() {
        let control = control(vec![]);
        let admission = control.admit(&execution("production")).await.unwrap();
        assert_eq!(admission, Admission::Active);
    }

    #[tokio::test]
    async fn test_running_execution_queues_the_next() {
        let mut running = execution("production");
        running.status.state = SequenceState::Waiting;
        let control = control(vec![running]);

        let admission = control.admit(&execution("production")).await.unwrap();
        assert_eq!(admission, Admission::Queued);
    }

    #[tokio::test]
    async fn test_other_stage_does_not_block() {
        let mut running = execution("staging");
        running.status.state = SequenceState::Waiting;
        let control = control(vec![running]);

        let admission = control.admit(&execution("production")).await.unwrap();
        assert_eq!(admission, Admission::Active);
    }

    #[tokio::test]
    async fn test_terminal_execution_does_not_block() {
        let mut finished = execution("production");
        finished.status.state = SequenceState::Finished;
        let control = control(vec![finished]);

        let admission = control.admit(&execution("production")).await.unwrap();
        assert_eq!(admission, Admission::Active);
    }

    #[tokio::test]
    async fn test_admit_ignores_the_execution_itself() {
        let candidate = execution("production");
        let control = control(vec![candidate.clone()]);

        let admission = control.admit(&candidate).await.unwrap();
        assert_eq!(admission, Admission::Active);
    }

    #[tokio::test]
    async fn test_next_queued_is_fifo_by_trigger_time() {
        let mut older = execution("production");
        older.mark_queued();
        older.triggered_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        let older_id = older.id.clone();

        let mut newer = execution("production");
        newer.mark_queued();

        let control = control(vec![newer, older]);
        let next = control
            .next_queued(&EventScope::new("shop", "production", ""))
            .await
            .unwrap()
            .expect("a queued execution exists");
        assert_eq!(next.id, older_id);
    }

    #[tokio::test]
    async fn test_next_queued_empty_scope() {
        let control = control(vec![]);
        let next = control
            .next_queued(&EventScope::new("shop", "production", ""))
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
