//! Lifecycle events published on the event bus.
//!
//! Every interesting state change is described by one [`BrewEvent`] variant.
//! The wire representation is `{type, data}` where `type` is the dotted kind
//! string and `data` the variant fields; `Extension` is the escape hatch for
//! event types the core does not know about.

use serde_json::{json, Value};

/// Typed lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum BrewEvent {
    GroupCreated {
        group_id: String,
        title: String,
    },
    TaskCreated {
        task_id: String,
        group_id: Option<String>,
    },
    TaskClaimed {
        task_id: String,
        claimed_by: String,
        model: Option<String>,
        correlation_id: String,
    },
    TaskCompleted {
        task_id: String,
        group_id: Option<String>,
        agent_id: String,
        model: Option<String>,
    },
    TaskFailed {
        task_id: String,
        instance_id: Option<String>,
        reason: Option<String>,
        error: Option<String>,
        correlation_id: Option<String>,
    },
    TaskCancelled {
        task_id: String,
        reason: Option<String>,
    },
    TaskRejected {
        task_id: String,
        reason: String,
    },
    TaskRecovered {
        task_id: String,
    },
    AgentStatusChanged {
        instance_id: String,
        role: String,
        status: String,
    },
    AgentStopped {
        instance_id: String,
    },
    /// Untyped extension event for external collaborators.
    Extension {
        event_type: String,
        data: Value,
    },
}

impl BrewEvent {
    /// Dotted kind string used for subscriptions, persistence, and the wire.
    pub fn kind(&self) -> &str {
        match self {
            Self::GroupCreated { .. } => "group.created",
            Self::TaskCreated { .. } => "task.created",
            Self::TaskClaimed { .. } => "task.claimed",
            Self::TaskCompleted { .. } => "task.completed",
            Self::TaskFailed { .. } => "task.failed",
            Self::TaskCancelled { .. } => "task.cancelled",
            Self::TaskRejected { .. } => "task.rejected",
            Self::TaskRecovered { .. } => "task.recovered",
            Self::AgentStatusChanged { .. } => "agent.status_changed",
            Self::AgentStopped { .. } => "agent.stopped",
            Self::Extension { event_type, .. } => event_type,
        }
    }

    /// Task id this event refers to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskCreated { task_id, .. }
            | Self::TaskClaimed { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskCancelled { task_id, .. }
            | Self::TaskRejected { task_id, .. }
            | Self::TaskRecovered { task_id } => Some(task_id),
            Self::Extension { data, .. } => data.get("task_id").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Group id this event refers to, if any.
    pub fn group_id(&self) -> Option<&str> {
        match self {
            Self::GroupCreated { group_id, .. } => Some(group_id),
            Self::TaskCreated { group_id, .. } | Self::TaskCompleted { group_id, .. } => {
                group_id.as_deref()
            }
            Self::Extension { data, .. } => data.get("group_id").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Agent/instance id this event refers to, if any.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::TaskClaimed { claimed_by, .. } => Some(claimed_by),
            Self::TaskCompleted { agent_id, .. } => Some(agent_id),
            Self::TaskFailed { instance_id, .. } => instance_id.as_deref(),
            Self::AgentStatusChanged { instance_id, .. } | Self::AgentStopped { instance_id } => {
                Some(instance_id)
            }
            Self::Extension { data, .. } => data.get("agent_id").and_then(Value::as_str),
            _ => None,
        }
    }

    /// JSON payload for the wire and the persisted `data` column.
    pub fn data(&self) -> Value {
        match self {
            Self::GroupCreated { group_id, title } => {
                json!({ "group_id": group_id, "title": title })
            }
            Self::TaskCreated { task_id, group_id } => {
                json!({ "task_id": task_id, "group_id": group_id })
            }
            Self::TaskClaimed {
                task_id,
                claimed_by,
                model,
                correlation_id,
            } => json!({
                "task_id": task_id,
                "claimed_by": claimed_by,
                "model": model,
                "correlation_id": correlation_id,
            }),
            Self::TaskCompleted {
                task_id,
                group_id,
                agent_id,
                model,
            } => json!({
                "task_id": task_id,
                "group_id": group_id,
                "agent_id": agent_id,
                "model": model,
            }),
            Self::TaskFailed {
                task_id,
                instance_id,
                reason,
                error,
                correlation_id,
            } => json!({
                "task_id": task_id,
                "instance_id": instance_id,
                "reason": reason,
                "error": error,
                "correlation_id": correlation_id,
            }),
            Self::TaskCancelled { task_id, reason } => {
                json!({ "task_id": task_id, "reason": reason })
            }
            Self::TaskRejected { task_id, reason } => {
                json!({ "task_id": task_id, "reason": reason })
            }
            Self::TaskRecovered { task_id } => json!({ "task_id": task_id }),
            Self::AgentStatusChanged {
                instance_id,
                role,
                status,
            } => json!({
                "instance_id": instance_id,
                "role": role,
                "status": status,
            }),
            Self::AgentStopped { instance_id } => json!({ "instance_id": instance_id }),
            Self::Extension { data, .. } => data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings() {
        let e = BrewEvent::TaskRecovered {
            task_id: "CD-001".into(),
        };
        assert_eq!(e.kind(), "task.recovered");
        assert_eq!(e.task_id(), Some("CD-001"));

        let ext = BrewEvent::Extension {
            event_type: "intel.insight".into(),
            data: json!({ "task_id": "CD-002" }),
        };
        assert_eq!(ext.kind(), "intel.insight");
        assert_eq!(ext.task_id(), Some("CD-002"));
    }

    #[test]
    fn data_payload_contains_fields() {
        let e = BrewEvent::TaskClaimed {
            task_id: "AR-003".into(),
            claimed_by: "architect-1".into(),
            model: Some("claude-sonnet-4-6".into()),
            correlation_id: "AR-003-1700000000".into(),
        };
        let data = e.data();
        assert_eq!(data["task_id"], "AR-003");
        assert_eq!(data["claimed_by"], "architect-1");
        assert_eq!(data["correlation_id"], "AR-003-1700000000");
    }
}
