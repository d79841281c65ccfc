use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A project owning a file set and the stories that mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A file belonging to a project, keyed by `(project_id, path)`.
///
/// Project files live in the persistence layer rather than on disk so that
/// phases, snapshots and rollbacks all go through the same gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectFile {
    pub project_id: Uuid,
    pub path: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a new project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectInput {
    pub name: String,
    pub description: Option<String>,
}

/// Input for creating or replacing a project file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertFileInput {
    pub path: String,
    pub content: String,
}
