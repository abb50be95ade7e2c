//! In-memory implementations of the engine's store traits
//!
//! Records are held as JSON documents in exactly the persisted shape, with
//! a revision counter per record for optimistic concurrency. This keeps the
//! schema handling identical to a durable backend: every read goes through
//! [`record::decode_document`] and every write through [`record::encode`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use stagehand_core::domain::{
    ProjectRepository, SequenceExecution, SequenceExecutionFilter, SequenceExecutionRepository,
};
use stagehand_core::EngineError;

use crate::record;

struct StoredRecord {
    revision: u64,
    doc: Value,
}

/// Execution store backed by a revision-checked document map
pub struct InMemorySequenceExecutionStore {
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl InMemorySequenceExecutionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Seed a raw document, bypassing the encoder
    ///
    /// Lets tests and migration tooling plant legacy-format records the way
    /// an older release would have written them.
    pub async fn insert_raw(&self, id: impl Into<String>, doc: Value) {
        let mut records = self.records.write().await;
        records.insert(id.into(), StoredRecord { revision: 1, doc });
    }

    /// The stored document for an id, as persisted
    pub async fn raw_document(&self, id: &str) -> Option<Value> {
        let records = self.records.read().await;
        records.get(id).map(|r| r.doc.clone())
    }

    /// All stored documents of one project, as persisted
    pub async fn raw_documents_for_project(&self, project: &str) -> Vec<(String, Value)> {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|(_, stored)| {
                stored.doc["scope"]["project"].as_str() == Some(project)
            })
            .map(|(id, stored)| (id.clone(), stored.doc.clone()))
            .collect()
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store holds no records
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for InMemorySequenceExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SequenceExecutionRepository for InMemorySequenceExecutionStore {
    async fn get(
        &self,
        filter: &SequenceExecutionFilter,
    ) -> Result<Vec<SequenceExecution>, EngineError> {
        let records = self.records.read().await;

        let mut matching = Vec::new();
        for (id, stored) in records.iter() {
            let mut execution = match record::decode_document(&stored.doc) {
                Ok(execution) => execution,
                Err(e) => {
                    // One broken record must not fail the whole query
                    warn!(record_id = %id, error = %e, "skipping undecodable record");
                    continue;
                }
            };
            execution.revision = stored.revision;
            if filter.matches(&execution) {
                matching.push(execution);
            }
        }

        matching.sort_by_key(|e| e.triggered_at);
        Ok(matching)
    }

    async fn upsert(
        &self,
        execution: &SequenceExecution,
        expected_revision: Option<u64>,
    ) -> Result<u64, EngineError> {
        let mut records = self.records.write().await;

        let current = records.get(&execution.id).map(|r| r.revision).unwrap_or(0);
        if let Some(expected) = expected_revision {
            if current != expected {
                return Err(EngineError::Conflict(format!(
                    "execution {} is at revision {current}, write expected {expected}",
                    execution.id
                )));
            }
        }

        let doc = serde_json::to_value(record::encode(execution))
            .map_err(|e| EngineError::StateStore(format!("failed to encode record: {e}")))?;
        let revision = current + 1;
        records.insert(execution.id.clone(), StoredRecord { revision, doc });
        Ok(revision)
    }
}

/// Project registry backing the schema migrator's project walk
pub struct InMemoryProjectStore {
    projects: RwLock<Vec<String>>,
}

impl InMemoryProjectStore {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            projects: RwLock::new(Vec::new()),
        }
    }

    /// Create a registry with the given project names
    pub fn with_projects(projects: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            projects: RwLock::new(projects),
        })
    }

    /// Register a project
    pub async fn add(&self, name: impl Into<String>) {
        self.projects.write().await.push(name.into());
    }
}

impl Default for InMemoryProjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectRepository for InMemoryProjectStore {
    async fn project_names(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.projects.read().await.clone())
    }
}
