//! Request bodies and query parameters for the dashboard API.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct SubmitGoalBody {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub group_id: String,
    pub title: String,
    pub task_type: String,
    pub assigned_to: String,
    pub assigned_by: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub revision_of: Option<String>,
    #[serde(default)]
    pub blocked_by: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BoardQuery {
    pub group_id: Option<String>,
    pub assigned_to: Option<String>,
    pub claimed_by: Option<String>,
    pub task_type: Option<String>,
    pub priority: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GroupsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchTasksQuery {
    #[serde(default)]
    pub q: String,
    pub group_id: Option<String>,
    pub status: Option<String>,
    pub assigned_to: Option<String>,
    pub task_type: Option<String>,
    pub priority: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelTaskBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReassignTaskBody {
    pub assigned_to: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteTaskBody {
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateTaskBody {
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchTasksBody {
    pub task_ids: Vec<String>,
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplateBody {
    pub name: String,
    pub title_template: String,
    #[serde(default)]
    pub description_template: Option<String>,
    pub task_type: String,
    pub assigned_to: String,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InstantiateTemplateBody {
    pub template_name: String,
    pub group_id: String,
    #[serde(default)]
    pub variables: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowBody {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Value,
}

#[derive(Debug, Deserialize)]
pub struct StartWorkflowBody {
    pub group_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TimeseriesQuery {
    #[serde(default = "default_time_range")]
    pub time_range: String,
    #[serde(default = "default_granularity")]
    pub granularity: String,
}

fn default_time_range() -> String {
    "24h".to_string()
}

fn default_granularity() -> String {
    "hour".to_string()
}
