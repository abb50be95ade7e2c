//! Persisted record format for sequence executions
//!
//! In memory every payload is a structured JSON object; on disk each one is
//! flattened to a single string field so user-supplied property names can
//! never collide with the store's own field names or contain characters the
//! store forbids. Records written this way carry `schemaVersion: "v02"`.
//! Documents without the tag are legacy records whose payloads are still
//! structured; they decode through the domain types directly and are
//! rewritten in the current format by the migrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stagehand_core::domain::{
    EventScope, ResultType, SequenceExecution, SequenceExecutionStatus, SequenceState, StatusType,
    TaskEvent, TaskEventKind, TaskExecutionResult, TaskExecutionState, TimeoutReason,
};
use stagehand_core::{EngineError, PropertyMap};

/// Schema tag of records with string-encoded payloads
pub const SCHEMA_VERSION_V02: &str = "v02";

/// A sequence execution in its persisted v02 shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedSequenceExecution {
    pub id: String,
    pub schema_version: String,
    pub correlation_id: String,
    pub scope: EventScope,
    pub sequence: EncodedSequence,
    #[serde(default)]
    pub input_properties: String,
    pub status: EncodedStatus,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedSequence {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<EncodedTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedTask {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_after: Option<String>,
    #[serde(default)]
    pub properties: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedStatus {
    pub state: SequenceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_before_pause: Option<SequenceState>,
    #[serde(default)]
    pub queued: bool,
    #[serde(default)]
    pub previous_tasks: Vec<EncodedTaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<EncodedTaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_timeout_remaining_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out_reason: Option<TimeoutReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedTaskResult {
    pub name: String,
    pub dispatch_id: String,
    pub result: ResultType,
    pub status: StatusType,
    #[serde(default)]
    pub properties: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedTaskState {
    pub name: String,
    pub dispatch_id: String,
    #[serde(default)]
    pub events: Vec<EncodedTaskEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedTaskEvent {
    pub kind: TaskEventKind,
    pub source: String,
    pub result: ResultType,
    pub status: StatusType,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub properties: String,
}

/// Flatten a domain execution into its persisted v02 shape
pub fn encode(execution: &SequenceExecution) -> EncodedSequenceExecution {
    EncodedSequenceExecution {
        id: execution.id.clone(),
        schema_version: SCHEMA_VERSION_V02.to_string(),
        correlation_id: execution.correlation_id.clone(),
        scope: execution.scope.clone(),
        sequence: EncodedSequence {
            name: execution.sequence.name.clone(),
            tasks: execution
                .sequence
                .tasks
                .iter()
                .map(|task| EncodedTask {
                    name: task.name.clone(),
                    triggered_after: task.triggered_after.clone(),
                    properties: task.properties.encode(),
                })
                .collect(),
        },
        input_properties: execution.input_properties.encode(),
        status: EncodedStatus {
            state: execution.status.state,
            state_before_pause: execution.status.state_before_pause,
            queued: execution.status.queued,
            previous_tasks: execution
                .status
                .previous_tasks
                .iter()
                .map(|result| EncodedTaskResult {
                    name: result.name.clone(),
                    dispatch_id: result.dispatch_id.clone(),
                    result: result.result,
                    status: result.status,
                    properties: result.properties.encode(),
                })
                .collect(),
            current_task: execution.status.current_task.as_ref().map(|task| {
                EncodedTaskState {
                    name: task.name.clone(),
                    dispatch_id: task.dispatch_id.clone(),
                    events: task
                        .events
                        .iter()
                        .map(|event| EncodedTaskEvent {
                            kind: event.kind,
                            source: event.source.clone(),
                            result: event.result,
                            status: event.status,
                            time: event.time,
                            properties: event.properties.encode(),
                        })
                        .collect(),
                }
            }),
            dispatch_after: execution.status.dispatch_after,
            timeout_at: execution.status.timeout_at,
            paused_timeout_remaining_ms: execution.status.paused_timeout_remaining_ms,
            timed_out_reason: execution.status.timed_out_reason,
        },
        triggered_at: execution.triggered_at,
    }
}

impl EncodedSequenceExecution {
    /// Rebuild the domain execution from its persisted shape
    ///
    /// The store sets the revision afterwards; a decoded execution starts
    /// at revision 0.
    pub fn decode(self) -> SequenceExecution {
        SequenceExecution {
            id: self.id,
            correlation_id: self.correlation_id,
            scope: self.scope,
            sequence: stagehand_core::domain::SequenceDefinition {
                name: self.sequence.name,
                tasks: self
                    .sequence
                    .tasks
                    .into_iter()
                    .map(|task| stagehand_core::domain::TaskSpec {
                        name: task.name,
                        triggered_after: task.triggered_after,
                        properties: PropertyMap::decode(&task.properties),
                    })
                    .collect(),
            },
            input_properties: PropertyMap::decode(&self.input_properties),
            status: SequenceExecutionStatus {
                state: self.status.state,
                state_before_pause: self.status.state_before_pause,
                queued: self.status.queued,
                previous_tasks: self
                    .status
                    .previous_tasks
                    .into_iter()
                    .map(|result| TaskExecutionResult {
                        name: result.name,
                        dispatch_id: result.dispatch_id,
                        result: result.result,
                        status: result.status,
                        properties: PropertyMap::decode(&result.properties),
                    })
                    .collect(),
                current_task: self.status.current_task.map(|task| TaskExecutionState {
                    name: task.name,
                    dispatch_id: task.dispatch_id,
                    events: task
                        .events
                        .into_iter()
                        .map(|event| TaskEvent {
                            kind: event.kind,
                            source: event.source,
                            result: event.result,
                            status: event.status,
                            time: event.time,
                            properties: PropertyMap::decode(&event.properties),
                        })
                        .collect(),
                }),
                dispatch_after: self.status.dispatch_after,
                timeout_at: self.status.timeout_at,
                paused_timeout_remaining_ms: self.status.paused_timeout_remaining_ms,
                timed_out_reason: self.status.timed_out_reason,
            },
            triggered_at: self.triggered_at,
            revision: 0,
        }
    }
}

/// Whether a stored document already carries the current schema tag
pub fn is_current_schema(doc: &Value) -> bool {
    doc.get("schemaVersion").and_then(Value::as_str) == Some(SCHEMA_VERSION_V02)
}

/// Decode a stored document of either schema generation
pub fn decode_document(doc: &Value) -> Result<SequenceExecution, EngineError> {
    if is_current_schema(doc) {
        let encoded: EncodedSequenceExecution =
            serde_json::from_value(doc.clone()).map_err(|e| {
                EngineError::Decode(format!("malformed v02 record: {e}"))
            })?;
        Ok(encoded.decode())
    } else {
        serde_json::from_value(doc.clone())
            .map_err(|e| EngineError::Decode(format!("malformed legacy record: {e}")))
    }
}
