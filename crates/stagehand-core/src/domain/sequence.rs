use crate::{EngineError, PropertyMap};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the approval gate task
///
/// Dispatching a task with this name suspends the execution until an
/// external approval decision is reported; no timeout is armed for it.
pub const APPROVAL_TASK_NAME: &str = "approval";

/// A named, ordered list of tasks executed as one workflow per trigger
///
/// Resolved from project configuration at trigger time and snapshotted onto
/// the execution, so later configuration edits never change an in-flight
/// instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceDefinition {
    /// Name of the sequence, unique per stage
    pub name: String,

    /// Ordered tasks; executed strictly one after another
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl SequenceDefinition {
    /// Create a new sequence definition
    pub fn new(name: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        Self {
            name: name.into(),
            tasks,
        }
    }

    /// Get the task at the given position
    pub fn task_at(&self, index: usize) -> Option<&TaskSpec> {
        self.tasks.get(index)
    }
}

/// One task within a sequence definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Task name, forwarded verbatim on the dispatch event
    pub name: String,

    /// Minimum delay since the predecessor completed, as a duration string
    /// ("30s", "10m", "1h30m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_after: Option<String>,

    /// Task-level configuration forwarded to workers alongside the trigger's
    /// input properties
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub properties: PropertyMap,
}

impl TaskSpec {
    /// Create a task spec with no delay and no properties
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triggered_after: None,
            properties: PropertyMap::new(),
        }
    }

    /// Create a task spec with a post-predecessor delay
    pub fn with_delay(name: impl Into<String>, triggered_after: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triggered_after: Some(triggered_after.into()),
            properties: PropertyMap::new(),
        }
    }

    /// Whether this task is the approval gate
    pub fn is_approval(&self) -> bool {
        self.name == APPROVAL_TASK_NAME
    }

    /// Parse the configured delay, if any
    pub fn triggered_after_duration(&self) -> Result<Option<Duration>, EngineError> {
        match &self.triggered_after {
            None => Ok(None),
            Some(raw) => parse_duration(raw).map(Some),
        }
    }
}

/// Parse a duration string of the form `<int><unit>[<int><unit>...]` with
/// units `s`, `m`, and `h`
fn parse_duration(raw: &str) -> Result<Duration, EngineError> {
    let invalid =
        || EngineError::Validation(format!("invalid duration string: {raw:?}"));

    if raw.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut saw_component = false;

    for c in raw.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let seconds = match c {
            's' => value,
            'm' => value * 60,
            'h' => value * 3600,
            _ => return Err(invalid()),
        };
        total += Duration::from_secs(seconds);
        saw_component = true;
    }

    if !digits.is_empty() || !saw_component {
        return Err(invalid());
    }
    Ok(total)
}
