//! Tower middleware for the operation pipeline.
//!
//! - [`guard`]: per-class admission, deadlines and the `operation` span
//! - [`pipeline`]: wraps the router into one boxed service

pub mod guard;
pub mod pipeline;

pub use guard::{OperationClass, OperationGuardLayer};
pub use pipeline::{build_operation_pipeline, OperationPipeline};
