use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed catalogue of events published on the bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TaskCreated,
    TasksCreated,
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    HandlerError,
    StoryProcessingStarted,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    TaskStatusChanged,
    RollbackCompleted,
    RollbackIncomplete,
    StoryCompleted,
    StoryFailed,
    StoryCancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "TASK_CREATED",
            Self::TasksCreated => "TASKS_CREATED",
            Self::ExecutionStarted => "EXECUTION_STARTED",
            Self::ExecutionCompleted => "EXECUTION_COMPLETED",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::HandlerError => "HANDLER_ERROR",
            Self::StoryProcessingStarted => "STORY_PROCESSING_STARTED",
            Self::PhaseStarted => "PHASE_STARTED",
            Self::PhaseCompleted => "PHASE_COMPLETED",
            Self::PhaseFailed => "PHASE_FAILED",
            Self::TaskStatusChanged => "TASK_STATUS_CHANGED",
            Self::RollbackCompleted => "ROLLBACK_COMPLETED",
            Self::RollbackIncomplete => "ROLLBACK_INCOMPLETE",
            Self::StoryCompleted => "STORY_COMPLETED",
            Self::StoryFailed => "STORY_FAILED",
            Self::StoryCancelled => "STORY_CANCELLED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contextual identifiers plus event-specific fields.
///
/// `project_id` is always present; `story_id` and `task_id` are set when the
/// event concerns a story or a task. Any other fields are flattened alongside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub project_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl EventPayload {
    pub fn project(project_id: Uuid) -> Self {
        Self {
            project_id,
            story_id: None,
            task_id: None,
            fields: serde_json::Map::new(),
        }
    }

    pub fn story(project_id: Uuid, story_id: Uuid) -> Self {
        Self {
            story_id: Some(story_id),
            ..Self::project(project_id)
        }
    }

    pub fn task(project_id: Uuid, story_id: Uuid, task_id: Uuid) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::story(project_id, story_id)
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }
}

/// An immutable record published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: EventPayload,
    /// Serialized as an ISO-8601 string.
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    pub fn new(event_type: EventType, payload: EventPayload) -> Self {
        Self {
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Durable audit-log entry, one per published event or handler failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLog {
    pub id: Uuid,
    pub project_id: Uuid,
    pub story_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
