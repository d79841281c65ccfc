//! Pre-phase file snapshots and rollback.
//!
//! A story's snapshot is the set of [`FileSnapshot`] rows capturing the
//! project's files before the story started mutating them. Files the story
//! creates afterwards are tracked with `existed = false`. Rolling back puts
//! every tracked path back to its captured state: restored when it existed,
//! deleted when it did not.

use serde::Serialize;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{OrchestratorError, Result};
use crate::models::{FileChange, ProjectFile, StoryStatus};

/// A file the rollback could not put back.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileFailure {
    pub path: String,
    pub error: String,
}

/// Aggregate result of a best-effort rollback sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub restored: usize,
    pub deleted: usize,
    pub failures: Vec<FileFailure>,
}

impl RollbackReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_paths(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.path.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    /// Tasks moved to `failed` by the cancellation.
    pub failed_tasks: Vec<Uuid>,
    pub rollback: Option<RollbackReport>,
}

#[derive(Clone)]
pub struct SnapshotManager {
    db: Database,
}

impl SnapshotManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Capture every current file of the story's project with `existed = true`.
    ///
    /// Rows left over from an earlier attempt are purged first, so calling
    /// this twice leaves exactly one row per current file.
    pub fn create_snapshot(&self, story_id: Uuid) -> Result<usize> {
        let story = self
            .db
            .get_story(story_id)?
            .ok_or(OrchestratorError::StoryNotFound(story_id))?;

        let files = self.db.get_project_files(story.project_id)?;
        let count = self.db.replace_snapshots(story_id, &files)?;

        tracing::info!(story_id = %story_id, "Snapshot captured {} files", count);
        Ok(count)
    }

    /// Record a path the story is about to create.
    ///
    /// No-op when the path is already covered: the first snapshot holds the
    /// original state. Returns whether a row was added.
    pub fn track_new_file(&self, story_id: Uuid, path: &str) -> Result<bool> {
        let added = self.db.insert_snapshot_if_absent(story_id, path, "", false)?;
        if added {
            tracing::debug!(story_id = %story_id, "Tracking new file {}", path);
        }
        Ok(added)
    }

    /// Put every tracked path back to its captured state.
    ///
    /// Each file is handled independently: a failure is recorded in the
    /// report and the sweep continues. Snapshot rows are purged for the files
    /// that were handled; rows of failed files are kept so the rollback can be
    /// retried.
    pub fn rollback(&self, story_id: Uuid, project_id: Uuid) -> Result<RollbackReport> {
        let snapshots = self.db.get_snapshots(story_id)?;
        let mut report = RollbackReport::default();

        for snapshot in snapshots {
            let reverted = if snapshot.existed {
                self.db
                    .upsert_file(project_id, &snapshot.file_path, &snapshot.content)
                    .map(|_| true)
            } else {
                self.db
                    .delete_file(project_id, &snapshot.file_path)
                    .map(|_| false)
            };

            // A file only counts once its snapshot row is gone as well.
            let outcome = reverted
                .and_then(|restored| self.db.delete_snapshot(snapshot.id).map(|_| restored));

            match outcome {
                Ok(true) => report.restored += 1,
                Ok(false) => report.deleted += 1,
                Err(e) => {
                    tracing::error!(
                        story_id = %story_id,
                        "Rollback failed for {}: {:#}",
                        snapshot.file_path,
                        e
                    );
                    report.failures.push(FileFailure {
                        path: snapshot.file_path,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            story_id = %story_id,
            "Rollback restored {} files, deleted {}, failed {}",
            report.restored,
            report.deleted,
            report.failures.len()
        );

        Ok(report)
    }

    /// Discard the story's snapshot without restoring anything.
    pub fn cleanup(&self, story_id: Uuid) -> Result<usize> {
        let purged = self.db.delete_snapshots(story_id)?;
        tracing::debug!(story_id = %story_id, "Purged {} snapshot rows", purged);
        Ok(purged)
    }

    /// Cancel a story: mark it `cancelled`, fail its open tasks and, when
    /// `rollback` is set, restore the captured file state. Without rollback
    /// the snapshot is discarded and the story's changes stay in place.
    pub fn cancel(&self, story_id: Uuid, project_id: Uuid, rollback: bool) -> Result<CancelOutcome> {
        let story = self
            .db
            .get_story(story_id)?
            .ok_or(OrchestratorError::StoryNotFound(story_id))?;
        if story.status == StoryStatus::Completed {
            return Err(OrchestratorError::AlreadyCompleted(story_id));
        }

        self.db.set_story_status(story_id, StoryStatus::Cancelled)?;
        let failed_tasks = self.db.fail_open_tasks(story_id)?;

        let rollback = if rollback {
            let report = self.rollback(story_id, project_id)?;
            self.db.set_rollback_failures(story_id, &report.failed_paths())?;
            Some(report)
        } else {
            // Changes are kept, so the captured state is no longer needed.
            self.cleanup(story_id)?;
            None
        };

        tracing::info!(
            story_id = %story_id,
            "Story cancelled, {} open tasks failed",
            failed_tasks.len()
        );

        Ok(CancelOutcome {
            failed_tasks,
            rollback,
        })
    }

    pub fn workspace(&self, story_id: Uuid, project_id: Uuid) -> Workspace {
        Workspace {
            snapshots: self.clone(),
            story_id,
            project_id,
        }
    }
}

/// A story's view of its project files. Every mutation goes through the
/// snapshot so it can be rolled back.
pub struct Workspace {
    snapshots: SnapshotManager,
    story_id: Uuid,
    project_id: Uuid,
}

impl Workspace {
    pub fn files(&self) -> Result<Vec<ProjectFile>> {
        Ok(self.snapshots.db.get_project_files(self.project_id)?)
    }

    pub fn read(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .snapshots
            .db
            .get_file(self.project_id, path)?
            .map(|f| f.content))
    }

    pub fn apply(&self, change: &FileChange) -> Result<()> {
        let db = &self.snapshots.db;
        let path = change.path();

        // Paths already covered by the snapshot keep their original row.
        match db.get_file(self.project_id, path)? {
            Some(current) => {
                db.insert_snapshot_if_absent(self.story_id, path, &current.content, true)?;
            }
            None => {
                self.snapshots.track_new_file(self.story_id, path)?;
            }
        }

        match change {
            FileChange::Write { path, content } => {
                db.upsert_file(self.project_id, path, content)?;
            }
            FileChange::Delete { path } => {
                db.delete_file(self.project_id, path)?;
            }
        }
        Ok(())
    }

    pub fn apply_all(&self, changes: &[FileChange]) -> Result<usize> {
        for change in changes {
            self.apply(change)?;
        }
        Ok(changes.len())
    }
}
