use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The pre-phase state of one project file, owned by a story.
///
/// At most one snapshot exists per `(story_id, file_path)`. When `existed` is
/// true the file is restored to `content` on rollback; when false the file was
/// created during the story and is deleted on rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileSnapshot {
    pub id: Uuid,
    pub story_id: Uuid,
    pub file_path: String,
    pub content: String,
    pub existed: bool,
    pub created_at: DateTime<Utc>,
}

/// A file mutation requested by a phase collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FileChange {
    Write { path: String, content: String },
    Delete { path: String },
}

impl FileChange {
    pub fn path(&self) -> &str {
        match self {
            Self::Write { path, .. } | Self::Delete { path } => path,
        }
    }
}
