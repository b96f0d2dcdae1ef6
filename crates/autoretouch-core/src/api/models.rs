use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One page of a listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub entries: Vec<T>,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: Uuid,
    pub version: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub members: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: Uuid,
    pub version: Option<Uuid>,
    pub name: String,
    pub date: Option<String>,
    pub author: Option<Value>,
    #[serde(default)]
    pub workflow_components: Vec<Value>,
    pub execution_price: Option<i64>,
}

/// Lifecycle state reported for a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Created,
    Active,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow: Uuid,
    pub workflow_version: Option<Uuid>,
    pub workflow_name: Option<String>,
    pub organization_id: Uuid,
    pub status: ExecutionStatus,
    pub user_id: Option<String>,
    pub created_at: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub input_file_name: Option<String>,
    pub input_content_hash: Option<String>,
    pub result_content_hash: Option<String>,
    pub result_content_type: Option<String>,
    pub result_file_name: Option<String>,
    pub result_path: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub charged_credits: Option<i64>,
}
