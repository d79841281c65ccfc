use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user-authored unit of requested work, decomposed into tasks.
///
/// Stories are created externally and only mutated by the orchestrator and its
/// phase handlers. The core never deletes a story.
///
/// # Lifecycle
/// `pending → dividing → reviewing → tasks_ready → generating → code_review →
/// testing → deploying → completed`, with `failed` and `cancelled` reachable
/// from any non-terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: String,
    pub priority: i32,
    pub status: StoryStatus,
    /// Phase that was running when the story failed.
    pub failed_phase: Option<Phase>,
    pub failed_reason: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Files that could not be restored by the last rollback. A non-empty list
    /// means the project's file set is in an inconsistent state.
    #[serde(default)]
    pub rollback_failures: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Story {
    pub fn is_inconsistent(&self) -> bool {
        !self.rollback_failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    Dividing,
    Reviewing,
    TasksReady,
    Generating,
    CodeReview,
    Testing,
    Deploying,
    Completed,
    Failed,
    Cancelled,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dividing => "dividing",
            Self::Reviewing => "reviewing",
            Self::TasksReady => "tasks_ready",
            Self::Generating => "generating",
            Self::CodeReview => "code_review",
            Self::Testing => "testing",
            Self::Deploying => "deploying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "dividing" => Some(Self::Dividing),
            "reviewing" => Some(Self::Reviewing),
            "tasks_ready" => Some(Self::TasksReady),
            "generating" => Some(Self::Generating),
            "code_review" => Some(Self::CodeReview),
            "testing" => Some(Self::Testing),
            "deploying" => Some(Self::Deploying),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a pipeline run currently owns the story.
    ///
    /// `tasks_ready` counts as processing: it is the hand-off point between
    /// review and generation.
    pub fn is_processing(&self) -> bool {
        !self.is_terminal() && *self != Self::Pending
    }
}

/// One stage of the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Divide,
    Review,
    Generate,
    CodeReview,
    Test,
    Deploy,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Divide,
        Phase::Review,
        Phase::Generate,
        Phase::CodeReview,
        Phase::Test,
        Phase::Deploy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Divide => "divide",
            Self::Review => "review",
            Self::Generate => "generate",
            Self::CodeReview => "code_review",
            Self::Test => "test",
            Self::Deploy => "deploy",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "divide" => Some(Self::Divide),
            "review" => Some(Self::Review),
            "generate" => Some(Self::Generate),
            "code_review" => Some(Self::CodeReview),
            "test" => Some(Self::Test),
            "deploy" => Some(Self::Deploy),
            _ => None,
        }
    }

    /// Story status while this phase runs.
    pub fn story_status(&self) -> StoryStatus {
        match self {
            Self::Divide => StoryStatus::Dividing,
            Self::Review => StoryStatus::Reviewing,
            Self::Generate => StoryStatus::Generating,
            Self::CodeReview => StoryStatus::CodeReview,
            Self::Test => StoryStatus::Testing,
            Self::Deploy => StoryStatus::Deploying,
        }
    }

    pub fn next(&self) -> Option<Phase> {
        match self {
            Self::Divide => Some(Self::Review),
            Self::Review => Some(Self::Generate),
            Self::Generate => Some(Self::CodeReview),
            Self::CodeReview => Some(Self::Test),
            Self::Test => Some(Self::Deploy),
            Self::Deploy => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for creating a new story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStoryInput {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
}

/// Failure metadata recorded when a story transitions to `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryFailure {
    pub phase: Phase,
    pub reason: String,
}
