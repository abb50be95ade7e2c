use crate::EngineError;
use serde::{Deserialize, Serialize};

/// The (project, stage, service) coordinate a sequence execution targets
///
/// Immutable for the lifetime of one execution. Two executions with the same
/// project and stage contend for the same admission queue regardless of
/// service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    /// Project the execution belongs to
    pub project: String,

    /// Stage (deployment target) within the project
    pub stage: String,

    /// Service within the stage; may be empty for stage-level sequences
    #[serde(default)]
    pub service: String,
}

impl EventScope {
    /// Create a new scope
    pub fn new(
        project: impl Into<String>,
        stage: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            stage: stage.into(),
            service: service.into(),
        }
    }

    /// Validate that the mandatory coordinates are present
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.project.is_empty() {
            return Err(EngineError::Validation(
                "scope is missing the project field".to_string(),
            ));
        }
        if self.stage.is_empty() {
            return Err(EngineError::Validation(
                "scope is missing the stage field".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether two scopes contend for the same admission queue
    pub fn same_queue(&self, other: &EventScope) -> bool {
        self.project == other.project && self.stage == other.stage
    }
}

impl std::fmt::Display for EventScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.service.is_empty() {
            write!(f, "{}/{}", self.project, self.stage)
        } else {
            write!(f, "{}/{}/{}", self.project, self.stage, self.service)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_project_and_stage() {
        assert!(EventScope::new("shop", "production", "carts").validate().is_ok());
        assert!(EventScope::new("shop", "production", "").validate().is_ok());

        let missing_project = EventScope::new("", "production", "carts");
        assert!(matches!(
            missing_project.validate(),
            Err(EngineError::Validation(_))
        ));

        let missing_stage = EventScope::new("shop", "", "carts");
        assert!(matches!(
            missing_stage.validate(),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_same_queue_ignores_service() {
        let a = EventScope::new("shop", "production", "carts");
        let b = EventScope::new("shop", "production", "orders");
        let c = EventScope::new("shop", "staging", "carts");

        assert!(a.same_queue(&b));
        assert!(!a.same_queue(&c));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            EventScope::new("shop", "production", "carts").to_string(),
            "shop/production/carts"
        );
        assert_eq!(
            EventScope::new("shop", "production", "").to_string(),
            "shop/production"
        );
    }
}
