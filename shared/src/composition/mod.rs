//! Composition model: apps built from discovered services.

mod app;
mod instance;
mod relationship;

pub use app::IoTApp;
pub use instance::ServiceInstance;
pub use relationship::{RelationshipInstance, RelationshipKind};

#[derive(Debug, thiserror::Error)]
pub enum CompositionError {
    #[error("invalid graph: relationship {relationship} references service instance {instance}, which is not part of the app")]
    InvalidGraph { relationship: String, instance: String },

    #[error("invalid relationship: {0}")]
    InvalidRelationship(String),

    #[error("id {0} is already used in this app")]
    DuplicateId(String),

    #[error("service {service} has no input parameter {param:?}")]
    UnknownInput { service: String, param: String },

    #[error("malformed composition document: {0}")]
    Serialization(#[from] serde_json::Error),
}
