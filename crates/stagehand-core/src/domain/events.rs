use crate::domain::execution::{ResultType, StatusType, TaskEvent, TaskEventKind};
use crate::domain::scope::EventScope;
use crate::{EngineError, PropertyMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound event that creates a sequence execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    /// Event identifier assigned by the producer
    pub id: String,

    /// Fully qualified event type
    #[serde(rename = "type")]
    pub event_type: String,

    /// Producer identity
    pub source: String,

    /// Correlation identifier shared by every event of the new execution
    pub context: String,

    /// When the trigger was emitted
    pub time: DateTime<Utc>,

    /// Scope coordinates, sequence name, and input payload
    pub data: TriggerData,
}

/// Payload of a trigger event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerData {
    /// Target project
    pub project: String,

    /// Target stage
    pub stage: String,

    /// Target service; may be empty
    #[serde(default)]
    pub service: String,

    /// Name of the sequence to run
    pub sequence: String,

    /// Opaque input payload forwarded to every task of the execution
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub properties: PropertyMap,
}

impl TriggerEvent {
    /// Reject triggers that cannot create a valid execution
    ///
    /// Validation failures mean no instance is created at all.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.context.is_empty() {
            return Err(EngineError::Validation(
                "trigger is missing the correlation context".to_string(),
            ));
        }
        if self.data.sequence.is_empty() {
            return Err(EngineError::Validation(
                "trigger is missing the sequence name".to_string(),
            ));
        }
        self.scope().validate()
    }

    /// The scope coordinate carried by this trigger
    pub fn scope(&self) -> EventScope {
        EventScope::new(
            self.data.project.clone(),
            self.data.stage.clone(),
            self.data.service.clone(),
        )
    }
}

/// Outbound "do this" event for one task dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEvent {
    /// Correlation identifier of the owning execution
    pub context: String,

    /// Fresh identifier of this dispatch; the only key accepted on reports
    pub dispatch_id: String,

    /// Name of the task to run
    pub task_name: String,

    /// Scope coordinate the task targets
    pub scope: EventScope,

    /// Input payload merged with the task spec's own properties
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub properties: PropertyMap,
}

/// Inbound completion report from one worker for one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEvent {
    /// Correlation identifier of the owning execution
    pub context: String,

    /// Dispatch the report answers
    pub dispatch_id: String,

    /// Started or finished
    pub kind: TaskEventKind,

    /// Identity of the reporting worker
    pub source: String,

    /// Observed result
    #[serde(default)]
    pub result: ResultType,

    /// Observed status
    #[serde(default)]
    pub status: StatusType,

    /// When the report was emitted
    pub time: DateTime<Utc>,

    /// Reporter-supplied payload
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub properties: PropertyMap,
}

impl ReportEvent {
    /// Convert the report into the task event stored on the execution
    pub fn to_task_event(&self) -> TaskEvent {
        TaskEvent {
            kind: self.kind,
            source: self.source.clone(),
            result: self.result,
            status: self.status,
            time: self.time,
            properties: self.properties.clone(),
        }
    }
}
