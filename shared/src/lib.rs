pub mod call;
pub mod composition;
pub mod condition;
pub mod protocol;
pub mod registry;
pub mod tweet;
pub mod types;
