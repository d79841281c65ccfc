//! SQLite-backed persistence gateway.
//!
//! The orchestration core only needs generic get/create/update/delete on its
//! entities plus a conditional file upsert keyed by `(project_id, path)`.
//! Every method takes the connection lock for the duration of one statement
//! (or one transaction), so callers never hold it across an `.await`.

mod schema;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::models::*;

const STORY_COLUMNS: &str = "id, project_id, title, description, priority, status, failed_phase, failed_reason, failed_at, rollback_failures, created_at, updated_at";

const TASK_COLUMNS: &str = "id, story_id, parent_task_id, title, description, task_type, priority, status, dependencies, created_at, updated_at";

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_default() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("", "", "storyline")
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        let db_path = dirs.data_dir().join("storyline.db");
        Self::open(db_path)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        schema::run_migrations(&conn)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        conn.execute_batch(sql)?;
        Ok(())
    }

    // ============================================================
    // Project operations
    // ============================================================

    pub fn get_all_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, name, description, created_at, updated_at FROM projects ORDER BY name",
        )?;

        let projects = stmt
            .query_map([], project_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(projects)
    }

    pub fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let project = conn
            .query_row(
                "SELECT id, name, description, created_at, updated_at FROM projects WHERE id = ?",
                [id.to_string()],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    pub fn create_project(&self, input: CreateProjectInput) -> Result<Project> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let id = Uuid::new_v4();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO projects (id, name, description, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
            (
                id.to_string(),
                &input.name,
                &input.description,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(Project {
            id,
            name: input.name,
            description: input.description,
            created_at: now,
            updated_at: now,
        })
    }

    // ============================================================
    // Project file operations
    // ============================================================

    pub fn get_project_files(&self, project_id: Uuid) -> Result<Vec<ProjectFile>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT project_id, path, content, updated_at
             FROM project_files WHERE project_id = ? ORDER BY path",
        )?;

        let files = stmt
            .query_map([project_id.to_string()], file_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(files)
    }

    pub fn get_file(&self, project_id: Uuid, path: &str) -> Result<Option<ProjectFile>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let file = conn
            .query_row(
                "SELECT project_id, path, content, updated_at
                 FROM project_files WHERE project_id = ? AND path = ?",
                (project_id.to_string(), path),
                file_from_row,
            )
            .optional()?;
        Ok(file)
    }

    /// Create the file or replace its content, keyed by `(project_id, path)`.
    pub fn upsert_file(&self, project_id: Uuid, path: &str, content: &str) -> Result<ProjectFile> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let now = Utc::now();

        conn.execute(
            "INSERT INTO project_files (project_id, path, content, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (project_id, path) DO UPDATE SET
                 content = excluded.content,
                 updated_at = excluded.updated_at",
            (project_id.to_string(), path, content, now.to_rfc3339()),
        )?;

        Ok(ProjectFile {
            project_id,
            path: path.to_string(),
            content: content.to_string(),
            updated_at: now,
        })
    }

    pub fn delete_file(&self, project_id: Uuid, path: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "DELETE FROM project_files WHERE project_id = ? AND path = ?",
            (project_id.to_string(), path),
        )?;
        Ok(rows > 0)
    }

    // ============================================================
    // Story operations
    // ============================================================

    pub fn create_story(&self, project_id: Uuid, input: CreateStoryInput) -> Result<Story> {
        self.get_project(project_id)?
            .ok_or_else(|| anyhow::anyhow!("Project not found"))?;

        let conn = self.conn.lock().expect("database lock poisoned");
        let id = Uuid::new_v4();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO stories (id, project_id, title, description, priority, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)",
            (
                id.to_string(),
                project_id.to_string(),
                &input.title,
                &input.description,
                input.priority,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(Story {
            id,
            project_id,
            title: input.title,
            description: input.description,
            priority: input.priority,
            status: StoryStatus::Pending,
            failed_phase: None,
            failed_reason: None,
            failed_at: None,
            rollback_failures: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_story(&self, id: Uuid) -> Result<Option<Story>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let story = conn
            .query_row(
                &format!("SELECT {} FROM stories WHERE id = ?", STORY_COLUMNS),
                [id.to_string()],
                story_from_row,
            )
            .optional()?;
        Ok(story)
    }

    pub fn get_stories_by_project(&self, project_id: Uuid) -> Result<Vec<Story>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM stories WHERE project_id = ? ORDER BY priority, created_at",
            STORY_COLUMNS
        ))?;

        let stories = stmt
            .query_map([project_id.to_string()], story_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(stories)
    }

    /// Move a story to `to` only if it is currently in one of `from`.
    ///
    /// The check and the write happen under one lock, which makes this the
    /// compare-and-set used for the reentrancy guard and for at-least-once
    /// event handling. Returns false when the story was not in `from`.
    pub fn transition_story(
        &self,
        id: Uuid,
        from: &[StoryStatus],
        to: StoryStatus,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let conn = self.conn.lock().expect("database lock poisoned");
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE stories SET status = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            placeholders
        );

        let mut params: Vec<String> = vec![
            to.as_str().to_string(),
            Utc::now().to_rfc3339(),
            id.to_string(),
        ];
        params.extend(from.iter().map(|s| s.as_str().to_string()));

        let rows = conn.execute(&sql, rusqlite::params_from_iter(params))?;
        Ok(rows > 0)
    }

    pub fn set_story_status(&self, id: Uuid, status: StoryStatus) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE stories SET status = ?, updated_at = ? WHERE id = ?",
            (status.as_str(), Utc::now().to_rfc3339(), id.to_string()),
        )?;
        Ok(rows > 0)
    }

    /// Transition to `failed`, recording the phase and reason.
    pub fn mark_story_failed(&self, id: Uuid, failure: &StoryFailure) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let now = Utc::now().to_rfc3339();
        let rows = conn.execute(
            "UPDATE stories SET status = 'failed', failed_phase = ?, failed_reason = ?, failed_at = ?, updated_at = ?
             WHERE id = ?",
            (
                failure.phase.as_str(),
                &failure.reason,
                &now,
                &now,
                id.to_string(),
            ),
        )?;
        Ok(rows > 0)
    }

    /// Forget failure metadata from a previous attempt.
    pub fn clear_story_failure(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        conn.execute(
            "UPDATE stories SET failed_phase = NULL, failed_reason = NULL, failed_at = NULL,
                 rollback_failures = '[]', updated_at = ?
             WHERE id = ?",
            (Utc::now().to_rfc3339(), id.to_string()),
        )?;
        Ok(())
    }

    pub fn set_rollback_failures(&self, id: Uuid, paths: &[String]) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        conn.execute(
            "UPDATE stories SET rollback_failures = ?, updated_at = ? WHERE id = ?",
            (
                serde_json::to_string(paths)?,
                Utc::now().to_rfc3339(),
                id.to_string(),
            ),
        )?;
        Ok(())
    }

    // ============================================================
    // Task operations
    // ============================================================

    pub fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS),
                [id.to_string()],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// All tasks of a story in creation order.
    pub fn get_tasks_by_story(&self, story_id: Uuid) -> Result<Vec<Task>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE story_id = ? ORDER BY rowid",
            TASK_COLUMNS
        ))?;

        let tasks = stmt
            .query_map([story_id.to_string()], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(tasks)
    }

    pub fn create_task(&self, story_id: Uuid, input: CreateTaskInput) -> Result<Task> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let id = Uuid::new_v4();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO tasks (id, story_id, parent_task_id, title, description, task_type, priority, status, dependencies, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)",
            (
                id.to_string(),
                story_id.to_string(),
                input.parent_task_id.map(|u| u.to_string()),
                &input.title,
                &input.description,
                input.task_type.as_str(),
                input.priority,
                serde_json::to_string(&input.dependencies)?,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(Task {
            id,
            story_id,
            parent_task_id: input.parent_task_id,
            title: input.title,
            description: input.description,
            task_type: input.task_type,
            priority: input.priority,
            status: TaskStatus::Pending,
            dependencies: input.dependencies,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn set_task_dependencies(&self, id: Uuid, dependencies: &[Uuid]) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE tasks SET dependencies = ?, updated_at = ? WHERE id = ?",
            (
                serde_json::to_string(dependencies)?,
                Utc::now().to_rfc3339(),
                id.to_string(),
            ),
        )?;
        Ok(rows > 0)
    }

    pub fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?",
            (status.as_str(), Utc::now().to_rfc3339(), id.to_string()),
        )?;
        Ok(rows > 0)
    }

    /// Mark every non-terminal task of a story as failed. Returns the ids touched.
    pub fn fail_open_tasks(&self, story_id: Uuid) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id FROM tasks
             WHERE story_id = ? AND status NOT IN ('deployed', 'failed', 'subdivided')
             ORDER BY rowid",
        )?;
        let open = stmt
            .query_map([story_id.to_string()], |row| {
                Ok(parse_uuid(row.get::<_, String>(0)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        conn.execute(
            "UPDATE tasks SET status = 'failed', updated_at = ?
             WHERE story_id = ? AND status NOT IN ('deployed', 'failed', 'subdivided')",
            (Utc::now().to_rfc3339(), story_id.to_string()),
        )?;

        Ok(open)
    }

    pub fn delete_tasks_by_story(&self, story_id: Uuid) -> Result<usize> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "DELETE FROM tasks WHERE story_id = ?",
            [story_id.to_string()],
        )?;
        Ok(rows)
    }

    // ============================================================
    // File snapshot operations
    // ============================================================

    pub fn get_snapshots(&self, story_id: Uuid) -> Result<Vec<FileSnapshot>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, story_id, file_path, content, existed, created_at
             FROM file_snapshots WHERE story_id = ? ORDER BY file_path",
        )?;

        let snapshots = stmt
            .query_map([story_id.to_string()], snapshot_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(snapshots)
    }

    pub fn get_snapshot(&self, story_id: Uuid, file_path: &str) -> Result<Option<FileSnapshot>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let snapshot = conn
            .query_row(
                "SELECT id, story_id, file_path, content, existed, created_at
                 FROM file_snapshots WHERE story_id = ? AND file_path = ?",
                (story_id.to_string(), file_path),
                snapshot_from_row,
            )
            .optional()?;
        Ok(snapshot)
    }

    /// Replace every snapshot row of a story with one `existed = true` row per
    /// file, in a single transaction.
    pub fn replace_snapshots(&self, story_id: Uuid, files: &[ProjectFile]) -> Result<usize> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "DELETE FROM file_snapshots WHERE story_id = ?",
            [story_id.to_string()],
        )?;
        for file in files {
            tx.execute(
                "INSERT INTO file_snapshots (id, story_id, file_path, content, existed, created_at)
                 VALUES (?, ?, ?, ?, 1, ?)",
                (
                    Uuid::new_v4().to_string(),
                    story_id.to_string(),
                    &file.path,
                    &file.content,
                    &now,
                ),
            )?;
        }
        tx.commit()?;

        Ok(files.len())
    }

    /// Insert a snapshot unless one already exists for the path.
    ///
    /// Returns false when a row was already present; the existing row is kept.
    pub fn insert_snapshot_if_absent(
        &self,
        story_id: Uuid,
        file_path: &str,
        content: &str,
        existed: bool,
    ) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "INSERT INTO file_snapshots (id, story_id, file_path, content, existed, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (story_id, file_path) DO NOTHING",
            (
                Uuid::new_v4().to_string(),
                story_id.to_string(),
                file_path,
                content,
                if existed { 1 } else { 0 },
                Utc::now().to_rfc3339(),
            ),
        )?;
        Ok(rows > 0)
    }

    pub fn delete_snapshots(&self, story_id: Uuid) -> Result<usize> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "DELETE FROM file_snapshots WHERE story_id = ?",
            [story_id.to_string()],
        )?;
        Ok(rows)
    }

    pub fn delete_snapshot(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute("DELETE FROM file_snapshots WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    // ============================================================
    // Agent log operations
    // ============================================================

    pub fn insert_agent_log(&self, event: &AgentEvent) -> Result<AgentLog> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let id = Uuid::new_v4();
        let payload = serde_json::to_value(&event.payload)?;

        conn.execute(
            "INSERT INTO agent_logs (id, project_id, story_id, task_id, event_type, payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                event.payload.project_id.to_string(),
                event.payload.story_id.map(|u| u.to_string()),
                event.payload.task_id.map(|u| u.to_string()),
                event.event_type.as_str(),
                serde_json::to_string(&payload)?,
                event.timestamp.to_rfc3339(),
            ),
        )?;

        Ok(AgentLog {
            id,
            project_id: event.payload.project_id,
            story_id: event.payload.story_id,
            task_id: event.payload.task_id,
            event_type: event.event_type,
            payload,
            created_at: event.timestamp,
        })
    }

    /// Audit log of a project, oldest first, optionally narrowed to one story.
    pub fn get_agent_logs(&self, project_id: Uuid, story_id: Option<Uuid>) -> Result<Vec<AgentLog>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, project_id, story_id, task_id, event_type, payload, created_at
             FROM agent_logs
             WHERE project_id = ?1 AND (?2 IS NULL OR story_id = ?2)
             ORDER BY created_at, rowid",
        )?;

        let logs = stmt
            .query_map(
                (project_id.to_string(), story_id.map(|u| u.to_string())),
                |row| {
                    let event_type: String = row.get(4)?;
                    let payload: String = row.get(5)?;
                    Ok(AgentLog {
                        id: parse_uuid(row.get::<_, String>(0)?),
                        project_id: parse_uuid(row.get::<_, String>(1)?),
                        story_id: row.get::<_, Option<String>>(2)?.map(parse_uuid),
                        task_id: row.get::<_, Option<String>>(3)?.map(parse_uuid),
                        event_type: serde_json::from_value(serde_json::Value::String(event_type))
                            .unwrap_or(EventType::HandlerError),
                        payload: serde_json::from_str(&payload).unwrap_or_default(),
                        created_at: parse_datetime(row.get::<_, String>(6)?),
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(logs)
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: parse_uuid(row.get::<_, String>(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: parse_datetime(row.get::<_, String>(3)?),
        updated_at: parse_datetime(row.get::<_, String>(4)?),
    })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<ProjectFile> {
    Ok(ProjectFile {
        project_id: parse_uuid(row.get::<_, String>(0)?),
        path: row.get(1)?,
        content: row.get(2)?,
        updated_at: parse_datetime(row.get::<_, String>(3)?),
    })
}

fn story_from_row(row: &Row<'_>) -> rusqlite::Result<Story> {
    Ok(Story {
        id: parse_uuid(row.get::<_, String>(0)?),
        project_id: parse_uuid(row.get::<_, String>(1)?),
        title: row.get(2)?,
        description: row.get(3)?,
        priority: row.get(4)?,
        status: StoryStatus::from_str(&row.get::<_, String>(5)?).unwrap_or(StoryStatus::Pending),
        failed_phase: row
            .get::<_, Option<String>>(6)?
            .and_then(|p| Phase::from_str(&p)),
        failed_reason: row.get(7)?,
        failed_at: row.get::<_, Option<String>>(8)?.map(parse_datetime),
        rollback_failures: serde_json::from_str(&row.get::<_, String>(9)?).unwrap_or_default(),
        created_at: parse_datetime(row.get::<_, String>(10)?),
        updated_at: parse_datetime(row.get::<_, String>(11)?),
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: parse_uuid(row.get::<_, String>(0)?),
        story_id: parse_uuid(row.get::<_, String>(1)?),
        parent_task_id: row.get::<_, Option<String>>(2)?.map(parse_uuid),
        title: row.get(3)?,
        description: row.get(4)?,
        task_type: TaskType::from_str(&row.get::<_, String>(5)?).unwrap_or(TaskType::Backend),
        priority: row.get(6)?,
        status: TaskStatus::from_str(&row.get::<_, String>(7)?).unwrap_or(TaskStatus::Pending),
        dependencies: serde_json::from_str(&row.get::<_, String>(8)?).unwrap_or_default(),
        created_at: parse_datetime(row.get::<_, String>(9)?),
        updated_at: parse_datetime(row.get::<_, String>(10)?),
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<FileSnapshot> {
    Ok(FileSnapshot {
        id: parse_uuid(row.get::<_, String>(0)?),
        story_id: parse_uuid(row.get::<_, String>(1)?),
        file_path: row.get(2)?,
        content: row.get(3)?,
        existed: row.get::<_, i32>(4)? != 0,
        created_at: parse_datetime(row.get::<_, String>(5)?),
    })
}

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_datetime(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
