//! Bulk migration of legacy records to the current schema
//!
//! Walks every project's executions and rewrites each legacy document in
//! the v02 format. One broken record is logged and skipped; it never aborts
//! the run. Re-running the migrator is a no-op for records that already
//! carry the current tag.

use std::sync::Arc;

use tracing::{error, info};

use stagehand_core::domain::{ProjectRepository, SequenceExecutionRepository};
use stagehand_core::EngineError;

use crate::record;
use crate::repositories::InMemorySequenceExecutionStore;

/// Outcome counts of one migration run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    /// Legacy records rewritten in the current format
    pub migrated: usize,
    /// Records that already carried the current schema tag
    pub already_current: usize,
    /// Records that could not be decoded and were left untouched
    pub failed: usize,
}

/// Rewrites legacy execution records in the current schema
pub struct SequenceExecutionMigrator {
    executions: Arc<InMemorySequenceExecutionStore>,
    projects: Arc<dyn ProjectRepository>,
}

impl SequenceExecutionMigrator {
    /// Create a migrator over the given store and project registry
    pub fn new(
        executions: Arc<InMemorySequenceExecutionStore>,
        projects: Arc<dyn ProjectRepository>,
    ) -> Self {
        Self {
            executions,
            projects,
        }
    }

    /// Migrate every project's execution records
    pub async fn migrate_all(&self) -> Result<MigrationSummary, EngineError> {
        let mut summary = MigrationSummary::default();

        for project in self.projects.project_names().await? {
            for (id, doc) in self.executions.raw_documents_for_project(&project).await {
                if record::is_current_schema(&doc) {
                    summary.already_current += 1;
                    continue;
                }

                let execution = match record::decode_document(&doc) {
                    Ok(execution) => execution,
                    Err(e) => {
                        error!(
                            project = %project,
                            record_id = %id,
                            error = %e,
                            "skipping record that could not be migrated"
                        );
                        summary.failed += 1;
                        continue;
                    }
                };

                // Unconditional write: the migrator runs before the engine
                // starts taking traffic
                if let Err(e) = self.executions.upsert(&execution, None).await {
                    error!(
                        project = %project,
                        record_id = %id,
                        error = %e,
                        "failed to rewrite migrated record"
                    );
                    summary.failed += 1;
                    continue;
                }
                summary.migrated += 1;
            }
        }

        info!(
            migrated = summary.migrated,
            already_current = summary.already_current,
            failed = summary.failed,
            "sequence execution migration finished"
        );
        Ok(summary)
    }
}
