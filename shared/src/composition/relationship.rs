use std::fmt;
use serde::{Deserialize, Serialize};
use crate::composition::{CompositionError, ServiceInstance};

/// Execution policy of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationshipKind {
    /// Always run the destination
    Ordered,
    /// Run the destination only if the source call succeeded
    OnSuccess,
    /// Run the destination if the source succeeded and its result satisfies the condition
    Condition,
    /// Any other tag; kept so a stored app round-trips, skipped at run time
    Other(String),
}

impl RelationshipKind {
    pub fn as_str(&self) -> &str {
        match self {
            RelationshipKind::Ordered => "ordered",
            RelationshipKind::OnSuccess => "on-success",
            RelationshipKind::Condition => "condition",
            RelationshipKind::Other(tag) => tag,
        }
    }

    pub fn default_category(&self) -> &'static str {
        match self {
            RelationshipKind::Ordered => "order",
            RelationshipKind::OnSuccess => "order-based",
            RelationshipKind::Condition => "conditional",
            RelationshipKind::Other(_) => "order",
        }
    }
}

impl From<String> for RelationshipKind {
    fn from(tag: String) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "ordered" => RelationshipKind::Ordered,
            "on-success" => RelationshipKind::OnSuccess,
            "condition" | "conditional" => RelationshipKind::Condition,
            _ => RelationshipKind::Other(tag),
        }
    }
}

impl From<&str> for RelationshipKind {
    fn from(tag: &str) -> Self {
        RelationshipKind::from(tag.to_string())
    }
}

impl From<RelationshipKind> for String {
    fn from(kind: RelationshipKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed, typed edge between two service instances of one app.
///
/// Endpoints are held by instance id and resolved through the owning
/// [`IoTApp`](crate::composition::IoTApp).
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipInstance {
    pub id: String,
    pub src: String,
    pub dst: String,
    pub kind: RelationshipKind,
    pub condition: Option<String>,
    pub name: Option<String>,
    pub category: String,
    pub description: Option<String>,
}

impl RelationshipInstance {
    /// Build an edge between two instances.
    ///
    /// A condition is required, and only allowed, on `condition` edges.
    pub fn new(
        src: &ServiceInstance,
        dst: &ServiceInstance,
        kind: RelationshipKind,
        condition: Option<String>,
    ) -> Result<Self, CompositionError> {
        let condition = condition.filter(|c| !c.trim().is_empty());
        match (&kind, &condition) {
            (RelationshipKind::Condition, None) => {
                return Err(CompositionError::InvalidRelationship(
                    "condition edges need a non-empty condition".to_string(),
                ));
            }
            (RelationshipKind::Condition, Some(_)) | (_, None) => {}
            (other, Some(_)) => {
                return Err(CompositionError::InvalidRelationship(format!(
                    "{other} edges do not take a condition"
                )));
            }
        }

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            src: src.id.clone(),
            dst: dst.id.clone(),
            name: Some(format!("{}_to_{}_{}", src.display_name(), dst.display_name(), kind)),
            category: kind.default_category().to_string(),
            kind,
            condition,
            description: None,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn touches(&self, instance_id: &str) -> bool {
        self.src == instance_id || self.dst == instance_id
    }
}
