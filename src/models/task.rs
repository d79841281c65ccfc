use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::story::Phase;

/// An atomic unit of implementation belonging to a story.
///
/// Tasks reference each other through `dependencies`, an ordered set of task
/// ids from the same story. A task never depends on itself, directly or
/// transitively.
///
/// Tasks produced by subdividing another task carry its id in
/// `parent_task_id`. The subdivided parent is not executed itself; its
/// sub-tasks are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub story_id: Uuid,
    pub parent_task_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Ascending: lower values run earlier.
    pub priority: i32,
    pub status: TaskStatus,
    pub dependencies: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The execution status of a task.
///
/// `pending → reviewed | subdivided → in_progress → code_generated →
/// code_approved → tests_generated → tests_passed | failed → deployed`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Reviewed,
    Subdivided,
    InProgress,
    CodeGenerated,
    CodeApproved,
    TestsGenerated,
    TestsPassed,
    Failed,
    Deployed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reviewed => "reviewed",
            Self::Subdivided => "subdivided",
            Self::InProgress => "in_progress",
            Self::CodeGenerated => "code_generated",
            Self::CodeApproved => "code_approved",
            Self::TestsGenerated => "tests_generated",
            Self::TestsPassed => "tests_passed",
            Self::Failed => "failed",
            Self::Deployed => "deployed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "reviewed" => Some(Self::Reviewed),
            "subdivided" => Some(Self::Subdivided),
            "in_progress" => Some(Self::InProgress),
            "code_generated" => Some(Self::CodeGenerated),
            "code_approved" => Some(Self::CodeApproved),
            "tests_generated" => Some(Self::TestsGenerated),
            "tests_passed" => Some(Self::TestsPassed),
            "failed" => Some(Self::Failed),
            "deployed" => Some(Self::Deployed),
            _ => None,
        }
    }

    /// Terminal states: nothing further happens to the task.
    ///
    /// A subdivided task is terminal; its sub-tasks carry the work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deployed | Self::Failed | Self::Subdivided)
    }

    /// Position along the success path, `None` for `failed` and `subdivided`.
    fn rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Reviewed => Some(1),
            Self::InProgress => Some(2),
            Self::CodeGenerated => Some(3),
            Self::CodeApproved => Some(4),
            Self::TestsGenerated => Some(5),
            Self::TestsPassed => Some(6),
            Self::Deployed => Some(7),
            Self::Failed | Self::Subdivided => None,
        }
    }

    /// Whether a task in this status has successfully finished `phase`.
    pub fn has_completed(&self, phase: Phase) -> bool {
        match (self.rank(), TaskStatus::success_for(phase).rank()) {
            (Some(current), Some(required)) => current >= required,
            _ => false,
        }
    }

    /// The status a task reaches when `phase` succeeds for it.
    pub fn success_for(phase: Phase) -> TaskStatus {
        match phase {
            Phase::Divide => Self::Pending,
            Phase::Review => Self::Reviewed,
            Phase::Generate => Self::CodeGenerated,
            Phase::CodeReview => Self::CodeApproved,
            Phase::Test => Self::TestsPassed,
            Phase::Deploy => Self::Deployed,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Frontend,
    Backend,
    Database,
    Integration,
    Deletion,
    TestCleanup,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Database => "database",
            Self::Integration => "integration",
            Self::Deletion => "deletion",
            Self::TestCleanup => "test_cleanup",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "frontend" => Some(Self::Frontend),
            "backend" => Some(Self::Backend),
            "database" => Some(Self::Database),
            "integration" => Some(Self::Integration),
            "deletion" => Some(Self::Deletion),
            "test_cleanup" | "test-cleanup" => Some(Self::TestCleanup),
            _ => None,
        }
    }
}

/// A freshly generated task description, before persistence.
///
/// Dependencies are human-readable titles of other drafts in the same batch;
/// the resolver turns them into durable ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Input for persisting a single task.
#[derive(Debug, Clone)]
pub struct CreateTaskInput {
    pub parent_task_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: i32,
    pub dependencies: Vec<Uuid>,
}

impl CreateTaskInput {
    pub fn from_draft(draft: &TaskDraft, parent_task_id: Option<Uuid>) -> Self {
        Self {
            parent_task_id,
            title: draft.title.clone(),
            description: draft.description.clone(),
            task_type: draft.task_type,
            priority: draft.priority,
            dependencies: Vec::new(),
        }
    }
}
