mod client;
mod error;
mod models;

pub use client::{content_type_for, AutoretouchClient};
pub use error::{ApiError, ApiResult};
pub use models::{ExecutionStatus, Organization, Page, Workflow, WorkflowExecution};
