//! In-memory execution store for the Stagehand engine
//!
//! Implements the store traits from `stagehand-core` over revision-checked
//! JSON documents held in memory, using the same persisted record format a
//! durable backend would: string-encoded payloads tagged with
//! `schemaVersion: "v02"`, legacy structured documents accepted on read,
//! and a bulk migrator that rewrites legacy records in place.

#![forbid(unsafe_code)]

pub mod migration;
pub mod record;
pub mod repositories;

pub use migration::{MigrationSummary, SequenceExecutionMigrator};
pub use repositories::{InMemoryProjectStore, InMemorySequenceExecutionStore};
