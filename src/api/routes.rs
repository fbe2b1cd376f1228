//! Axum router for the dashboard API and the `/ws/events` stream.
//!
//! Handlers are thin: they parse, delegate to the task board and
//! orchestrator, and map `BoardError` onto HTTP statuses with a
//! `{detail}` body.

use crate::adapters::sqlite::verify_connection;
use crate::api::models::{
    BatchTasksBody, BoardQuery, CancelTaskBody, CompleteTaskBody, CreateTaskBody,
    CreateTemplateBody, CreateWorkflowBody, GroupsQuery, InstantiateTemplateBody,
    ReassignTaskBody, SearchTasksQuery, StartWorkflowBody, SubmitGoalBody, TimeseriesQuery,
    UpdateTaskBody,
};
use crate::application::orchestrator::Orchestrator;
use crate::domain::errors::BoardError;
use crate::domain::models::{BrewEvent, GroupStatus, TaskPriority, TaskStatus};
use crate::services::task_board::{BatchAction, BoardFilters, NewTask, SearchQuery};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

type AppState = Arc<Orchestrator>;

/// API error carrying an HTTP status and a `{detail}` body.
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }
}

impl From<BoardError> for ApiError {
    fn from(err: BoardError) -> Self {
        let status = match &err {
            BoardError::TaskNotFound(_)
            | BoardError::GroupNotFound(_)
            | BoardError::TemplateNotFound(_)
            | BoardError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
            BoardError::RouteForbidden { .. } => StatusCode::FORBIDDEN,
            BoardError::GroupFull { .. }
            | BoardError::DepthExceeded { .. }
            | BoardError::CycleLimit { .. }
            | BoardError::CycleInDependency { .. }
            | BoardError::IllegalStatus { .. } => StatusCode::CONFLICT,
            BoardError::InvalidRole(_)
            | BoardError::UnacceptedType { .. }
            | BoardError::UnregisteredPrefix(_)
            | BoardError::UnknownBatchAction(_)
            | BoardError::Config(_) => StatusCode::BAD_REQUEST,
            BoardError::Database(_)
            | BoardError::Serialization(_)
            | BoardError::Execution(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Build the full dashboard router over the orchestrator state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/board", get(get_board))
        .route("/api/board/filters", get(board_filters))
        .route("/api/groups", get(get_groups))
        .route("/api/groups/:group_id/graph", get(group_graph))
        .route("/api/goals", post(submit_goal))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/search", get(search_tasks))
        .route("/api/tasks/batch", post(batch_tasks))
        .route("/api/tasks/:task_id", get(task_detail).patch(update_task))
        .route("/api/tasks/:task_id/cancel", post(cancel_task))
        .route("/api/tasks/:task_id/retry", post(retry_task))
        .route("/api/tasks/:task_id/reassign", post(reassign_task))
        .route("/api/tasks/:task_id/complete", post(complete_task))
        .route("/api/agents", get(get_agents))
        .route("/api/templates", get(get_templates).post(create_template))
        .route("/api/templates/instantiate", post(instantiate_template))
        .route("/api/workflows", get(get_workflows).post(create_workflow))
        .route("/api/workflows/:workflow_id/start", post(start_workflow))
        .route("/api/metrics/timeseries", get(metrics_timeseries))
        .route("/api/events/recent", get(recent_events))
        .route("/ws/events", get(ws_events))
        .with_state(state)
}

/// Bind and serve the API until the orchestrator shuts down.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!(host, port, "Dashboard API listening");
    axum::serve(listener, router).await?;
    Ok(())
}

// ----------------------------------------------------------------------
// Health & board views
// ----------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Response {
    match verify_connection(state.store().pool()).await {
        Ok(()) => Json(json!({ "status": "ok", "db": "connected" })).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "db": err.to_string() })),
        )
            .into_response(),
    }
}

async fn get_board(State(state): State<AppState>, Query(query): Query<BoardQuery>) -> ApiResult {
    let board = state
        .board()
        .get_board(&BoardFilters {
            group_id: query.group_id,
            assigned_to: query.assigned_to,
            claimed_by: query.claimed_by,
            task_type: query.task_type,
            priority: query.priority,
        })
        .await?;
    Ok(Json(serde_json::to_value(board).map_err(BoardError::from)?))
}

async fn board_filters(State(state): State<AppState>) -> ApiResult {
    Ok(Json(state.board().board_filter_values().await?))
}

async fn get_groups(State(state): State<AppState>, Query(query): Query<GroupsQuery>) -> ApiResult {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            GroupStatus::from_str(s)
                .ok_or_else(|| ApiError::bad_request(format!("invalid group status '{s}'")))?,
        ),
        None => None,
    };
    let groups = state.board().get_groups(status).await?;
    Ok(Json(serde_json::to_value(groups).map_err(BoardError::from)?))
}

async fn group_graph(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> ApiResult {
    let tasks = state.board().get_group_tasks(&group_id).await?;
    let deps = state.board().get_group_dependencies(&group_id).await?;

    let nodes: Vec<Value> = tasks
        .iter()
        .map(|t| {
            json!({
                "id": t.id,
                "title": t.title,
                "status": t.status,
                "assigned_to": t.assigned_to,
                "claimed_by": t.claimed_by,
                "task_type": t.task_type,
            })
        })
        .collect();

    let mut edges: Vec<Value> = tasks
        .iter()
        .filter_map(|t| {
            t.parent_id
                .as_ref()
                .map(|parent| json!({ "from": parent, "to": t.id, "type": "parent" }))
        })
        .collect();
    edges.extend(
        deps.iter()
            .map(|d| json!({ "from": d.blocked_by, "to": d.task_id, "type": "blocked_by" })),
    );

    Ok(Json(json!({ "nodes": nodes, "edges": edges })))
}

// ----------------------------------------------------------------------
// Goals & task creation
// ----------------------------------------------------------------------

async fn submit_goal(
    State(state): State<AppState>,
    Json(body): Json<SubmitGoalBody>,
) -> ApiResult {
    if body.title.is_empty() {
        return Err(ApiError::bad_request("Title is required"));
    }
    let (group, task) = state.submit_goal(&body.title, &body.description).await?;
    Ok(Json(json!({ "group_id": group.id, "task_id": task.id })))
}

async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskBody>,
) -> ApiResult {
    let priority = parse_priority(body.priority.as_deref())?;
    let new = NewTask {
        group_id: body.group_id,
        title: body.title,
        task_type: body.task_type,
        assigned_to: body.assigned_to,
        created_by: Some(body.assigned_by.clone()),
        description: body.description,
        priority,
        parent_id: body.parent_id,
        revision_of: body.revision_of,
        blocked_by: body.blocked_by.unwrap_or_default(),
    };

    state
        .validator()
        .validate(state.board(), &new, &body.assigned_by)
        .await?;
    let task = state.board().create_task(new).await?;
    state
        .bus()
        .emit(BrewEvent::TaskCreated {
            task_id: task.id.clone(),
            group_id: task.group_id.clone(),
        })
        .await;
    Ok(Json(serde_json::to_value(task).map_err(BoardError::from)?))
}

fn parse_priority(value: Option<&str>) -> Result<TaskPriority, ApiError> {
    match value {
        None => Ok(TaskPriority::Medium),
        Some(s) => TaskPriority::from_str(s)
            .ok_or_else(|| ApiError::bad_request(format!("invalid priority '{s}'"))),
    }
}

// ----------------------------------------------------------------------
// Task queries & actions
// ----------------------------------------------------------------------

async fn search_tasks(
    State(state): State<AppState>,
    Query(query): Query<SearchTasksQuery>,
) -> ApiResult {
    let result = state
        .board()
        .search_tasks(&SearchQuery {
            query: query.q,
            group_id: query.group_id,
            status: query.status,
            assigned_to: query.assigned_to,
            task_type: query.task_type,
            priority: query.priority,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;
    Ok(Json(json!({
        "tasks": result.tasks,
        "total": result.total,
        "limit": result.limit,
        "offset": result.offset,
    })))
}

async fn task_detail(State(state): State<AppState>, Path(task_id): Path<String>) -> ApiResult {
    let task = state
        .board()
        .get_task(&task_id)
        .await?
        .ok_or(BoardError::TaskNotFound(task_id.clone()))?;
    let dependencies = state.board().get_task_dependencies(&task_id).await?;
    let children = state.board().get_task_children(&task_id).await?;

    let mut value = serde_json::to_value(task).map_err(BoardError::from)?;
    value["dependencies"] = serde_json::to_value(dependencies).map_err(BoardError::from)?;
    value["children"] = children
        .iter()
        .map(|t| {
            json!({
                "id": t.id,
                "title": t.title,
                "status": t.status,
                "assigned_to": t.assigned_to,
            })
        })
        .collect();
    Ok(Json(value))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Option<Json<CancelTaskBody>>,
) -> ApiResult {
    let reason = body.and_then(|Json(b)| b.reason);
    let task = state.board().cancel_task(&task_id, reason.as_deref()).await?;
    state
        .bus()
        .emit(BrewEvent::TaskCancelled {
            task_id: task_id.clone(),
            reason,
        })
        .await;
    Ok(Json(serde_json::to_value(task).map_err(BoardError::from)?))
}

async fn retry_task(State(state): State<AppState>, Path(task_id): Path<String>) -> ApiResult {
    let task = state.board().retry_task(&task_id).await?;
    Ok(Json(serde_json::to_value(task).map_err(BoardError::from)?))
}

async fn reassign_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<ReassignTaskBody>,
) -> ApiResult {
    let task = state
        .board()
        .reassign_task(&task_id, &body.assigned_to)
        .await?;
    Ok(Json(serde_json::to_value(task).map_err(BoardError::from)?))
}

async fn complete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Option<Json<CompleteTaskBody>>,
) -> ApiResult {
    let output = body.and_then(|Json(b)| b.output);
    let task = match output {
        Some(ref output) => {
            state
                .board()
                .complete_task_with_output(&task_id, output)
                .await?
        }
        None => state.board().complete_task(&task_id).await?,
    };
    Ok(Json(serde_json::to_value(task).map_err(BoardError::from)?))
}

async fn update_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<UpdateTaskBody>,
) -> ApiResult {
    let priority = match body.priority.as_deref() {
        Some(s) => Some(
            TaskPriority::from_str(s)
                .ok_or_else(|| ApiError::bad_request(format!("invalid priority '{s}'")))?,
        ),
        None => None,
    };
    let status = match body.status.as_deref() {
        Some(s) => Some(
            TaskStatus::from_str(s)
                .ok_or_else(|| ApiError::bad_request(format!("invalid status '{s}'")))?,
        ),
        None => None,
    };

    let task = state
        .board()
        .update_task_fields(&task_id, priority, body.assigned_to.as_deref(), status)
        .await?;
    Ok(Json(serde_json::to_value(task).map_err(BoardError::from)?))
}

async fn batch_tasks(
    State(state): State<AppState>,
    Json(body): Json<BatchTasksBody>,
) -> ApiResult {
    let action = match body.action.as_str() {
        "cancel" => BatchAction::Cancel {
            reason: body.params["reason"].as_str().map(str::to_string),
        },
        "reassign" => BatchAction::Reassign {
            assigned_to: body.params["assigned_to"]
                .as_str()
                .ok_or_else(|| ApiError::bad_request("reassign requires params.assigned_to"))?
                .to_string(),
        },
        "change_priority" => BatchAction::ChangePriority {
            priority: parse_priority(body.params["priority"].as_str())?,
        },
        "retry" => BatchAction::Retry,
        other => return Err(BoardError::UnknownBatchAction(other.to_string()).into()),
    };

    let result = state
        .board()
        .batch_update_tasks(&body.task_ids, &action)
        .await?;
    Ok(Json(json!({
        "updated": result.updated,
        "task_ids": result.task_ids,
    })))
}

// ----------------------------------------------------------------------
// Agents, templates, workflows, metrics
// ----------------------------------------------------------------------

async fn get_agents(State(state): State<AppState>) -> ApiResult {
    let instances = state.instances().get_all_instances().await?;
    Ok(Json(
        serde_json::to_value(instances).map_err(BoardError::from)?,
    ))
}

async fn create_template(
    State(state): State<AppState>,
    Json(body): Json<CreateTemplateBody>,
) -> ApiResult {
    let priority = parse_priority(body.priority.as_deref())?;
    let template = state
        .board()
        .create_template(
            &body.name,
            &body.title_template,
            body.description_template.as_deref(),
            &body.task_type,
            &body.assigned_to,
            priority,
        )
        .await?;
    Ok(Json(json!({ "id": template.id, "name": template.name })))
}

async fn get_templates(State(state): State<AppState>) -> ApiResult {
    let templates = state.board().get_templates().await?;
    Ok(Json(
        templates
            .iter()
            .map(|t| {
                json!({
                    "id": t.id,
                    "name": t.name,
                    "title_template": t.title_template,
                    "description_template": t.description_template,
                    "task_type": t.task_type,
                    "assigned_to": t.assigned_to,
                    "priority": t.priority.as_str(),
                })
            })
            .collect(),
    ))
}

async fn instantiate_template(
    State(state): State<AppState>,
    Json(body): Json<InstantiateTemplateBody>,
) -> ApiResult {
    let task = state
        .board()
        .create_from_template(&body.template_name, &body.group_id, &body.variables)
        .await?;
    state
        .bus()
        .emit(BrewEvent::TaskCreated {
            task_id: task.id.clone(),
            group_id: task.group_id.clone(),
        })
        .await;
    Ok(Json(serde_json::to_value(task).map_err(BoardError::from)?))
}

async fn create_workflow(
    State(state): State<AppState>,
    Json(body): Json<CreateWorkflowBody>,
) -> ApiResult {
    let workflow_id = state
        .board()
        .create_workflow(&body.name, body.description.as_deref(), &body.steps)
        .await?;
    Ok(Json(json!({ "id": workflow_id, "name": body.name })))
}

async fn get_workflows(State(state): State<AppState>) -> ApiResult {
    Ok(Json(Value::Array(state.board().get_workflows().await?)))
}

async fn start_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(body): Json<StartWorkflowBody>,
) -> ApiResult {
    let tasks = state
        .board()
        .start_workflow(&workflow_id, &body.group_id)
        .await?;
    for task in &tasks {
        state
            .bus()
            .emit(BrewEvent::TaskCreated {
                task_id: task.id.clone(),
                group_id: task.group_id.clone(),
            })
            .await;
    }
    Ok(Json(serde_json::to_value(tasks).map_err(BoardError::from)?))
}

async fn metrics_timeseries(
    State(state): State<AppState>,
    Query(query): Query<TimeseriesQuery>,
) -> ApiResult {
    let duration = parse_time_range(&query.time_range)
        .ok_or_else(|| ApiError::bad_request(format!("invalid time_range '{}'", query.time_range)))?;
    let since = (state.store().clock().now() - duration).to_rfc3339();
    let series = state
        .store()
        .usage_timeseries(&since, &query.granularity)
        .await?;
    let summary = state.store().usage_summary(&since).await?;
    Ok(Json(json!({
        "time_range": query.time_range,
        "granularity": query.granularity,
        "series": series,
        "summary": summary,
    })))
}

#[derive(serde::Deserialize)]
struct RecentEventsQuery {
    #[serde(default = "default_event_limit")]
    limit: i64,
}

fn default_event_limit() -> i64 {
    100
}

/// Replay recently persisted events (oldest first).
async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<RecentEventsQuery>,
) -> ApiResult {
    let events = state.store().recent_events(query.limit.clamp(1, 1000)).await?;
    Ok(Json(Value::Array(events)))
}

/// Parse ranges like `"45m"`, `"24h"`, `"7d"`.
fn parse_time_range(range: &str) -> Option<chrono::Duration> {
    let (number, unit) = range.split_at(range.len().checked_sub(1)?);
    let value: i64 = number.parse().ok()?;
    match unit {
        "m" => Some(chrono::Duration::minutes(value)),
        "h" => Some(chrono::Duration::hours(value)),
        "d" => Some(chrono::Duration::days(value)),
        _ => None,
    }
}

// ----------------------------------------------------------------------
// WebSocket event stream
// ----------------------------------------------------------------------

async fn ws_events(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| stream_events(socket, state))
}

/// Forward every bus event as `{type, data}`. No backpressure: a slow or
/// lagged client is disconnected.
async fn stream_events(mut socket: WebSocket, state: AppState) {
    let mut rx = state.bus().subscribe();
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                let text = envelope.wire().to_string();
                if socket.send(Message::Text(text)).await.is_err() {
                    debug!("WebSocket client went away");
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Disconnecting lagged WebSocket client");
                break;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    let _ = socket.close().await;
}
