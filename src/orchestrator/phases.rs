//! Phase runners.

use std::collections::HashMap;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{story_payload, Orchestrator};
use crate::agents::ReviewVerdict;
use crate::error::{OrchestratorError, Result};
use crate::models::{
    EventPayload, EventType, FileChange, Phase, Story, StoryStatus, Task, TaskStatus,
};
use crate::resolver;
use crate::snapshot::Workspace;

fn ensure_active(token: &CancellationToken, story_id: Uuid) -> Result<()> {
    if token.is_cancelled() {
        return Err(OrchestratorError::Cancelled(story_id));
    }
    Ok(())
}

/// Write collaborator output unless the story was cancelled while it ran.
fn apply_changes(
    workspace: &Workspace,
    changes: &[FileChange],
    token: &CancellationToken,
    story_id: Uuid,
) -> Result<usize> {
    ensure_active(token, story_id)?;
    workspace.apply_all(changes)
}

fn task_payload(story: &Story, task: &Task) -> EventPayload {
    EventPayload::task(story.project_id, story.id, task.id)
}

/// Keep typed errors raised by collaborators, wrap everything else.
fn collaborator_error(phase: Phase, err: anyhow::Error) -> OrchestratorError {
    match err.downcast::<OrchestratorError>() {
        Ok(typed) => typed,
        Err(other) => OrchestratorError::Collaborator {
            phase,
            reason: format!("{:#}", other),
        },
    }
}

impl Orchestrator {
    pub(super) async fn execute_phase(
        &self,
        story_id: Uuid,
        phase: Phase,
        token: &CancellationToken,
    ) -> Result<()> {
        ensure_active(token, story_id)?;
        let story = self.load_story(story_id)?;
        if story.status != phase.story_status() {
            // Moved on without us (cancelled or failed elsewhere).
            return Err(OrchestratorError::Cancelled(story_id));
        }

        self.bus
            .publish(
                EventType::PhaseStarted,
                story_payload(&story).with("phase", phase.as_str()),
            )
            .await?;

        match phase {
            Phase::Divide => self.divide(&story, token).await,
            Phase::Review => self.review(&story, token).await,
            Phase::Generate => {
                self.snapshots.create_snapshot(story.id)?;
                self.run_tasks(&story, phase, token).await
            }
            Phase::CodeReview | Phase::Test => self.run_tasks(&story, phase, token).await,
            Phase::Deploy => self.deploy(&story, token).await,
        }
    }

    /// Run one collaborator call, bracketed by `EXECUTION_*` events.
    async fn execute<T, F>(
        &self,
        story: &Story,
        task: Option<&Task>,
        phase: Phase,
        token: &CancellationToken,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send,
    {
        ensure_active(token, story.id)?;
        let payload = match task {
            Some(task) => task_payload(story, task),
            None => story_payload(story),
        }
        .with("phase", phase.as_str());

        self.bus
            .publish(EventType::ExecutionStarted, payload.clone())
            .await?;

        let outcome = match self.config.collaborator_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result.map_err(|e| collaborator_error(phase, e)),
                Err(_) => Err(OrchestratorError::CollaboratorTimeout {
                    phase,
                    seconds: limit.as_secs(),
                }),
            },
            None => work.await.map_err(|e| collaborator_error(phase, e)),
        };

        match outcome {
            Ok(value) => {
                ensure_active(token, story.id)?;
                self.bus
                    .publish(EventType::ExecutionCompleted, payload)
                    .await?;
                Ok(value)
            }
            Err(e) => {
                tracing::error!(
                    story_id = %story.id,
                    task_id = ?task.map(|t| t.id),
                    "{} collaborator failed: {}",
                    phase,
                    e
                );
                let payload = payload.with("error", e.to_string());
                if let Err(publish) = self.bus.publish(EventType::ExecutionFailed, payload).await {
                    tracing::error!(story_id = %story.id, "Failed to publish execution failure: {}", publish);
                }
                Err(e)
            }
        }
    }

    async fn set_task_status(
        &self,
        story: &Story,
        task: &Task,
        status: TaskStatus,
        token: &CancellationToken,
    ) -> Result<()> {
        ensure_active(token, story.id)?;
        self.db.set_task_status(task.id, status)?;
        self.bus
            .publish(
                EventType::TaskStatusChanged,
                task_payload(story, task).with("status", status.as_str()),
            )
            .await?;
        Ok(())
    }

    async fn announce_task(&self, story: &Story, task: &Task) -> Result<()> {
        let mut payload = task_payload(story, task)
            .with("title", task.title.as_str())
            .with("type", task.task_type.as_str())
            .with("priority", task.priority)
            .with("dependencies", serde_json::json!(task.dependencies));
        if let Some(parent) = task.parent_task_id {
            payload = payload.with("parentTaskId", parent.to_string());
        }
        self.bus.publish(EventType::TaskCreated, payload).await?;
        Ok(())
    }

    async fn divide(&self, story: &Story, token: &CancellationToken) -> Result<()> {
        let drafts = self
            .execute(
                story,
                None,
                Phase::Divide,
                token,
                self.agents.divider.divide(story),
            )
            .await?;

        let resolved = resolver::create_tasks(
            &self.db,
            story.id,
            &drafts,
            None,
            self.config.resolve_mode,
        )?;
        for task in &resolved.tasks {
            self.announce_task(story, task).await?;
        }

        let unresolved: Vec<serde_json::Value> = resolved
            .unresolved
            .iter()
            .map(|u| serde_json::json!({ "task": u.task, "dependency": u.dependency }))
            .collect();
        self.bus
            .publish(
                EventType::TasksCreated,
                story_payload(story)
                    .with("count", resolved.tasks.len())
                    .with("unresolved", unresolved),
            )
            .await?;

        tracing::info!(story_id = %story.id, "Divided story into {} tasks", resolved.tasks.len());
        Ok(())
    }

    async fn review(&self, story: &Story, token: &CancellationToken) -> Result<()> {
        let pending: Vec<Task> = self
            .db
            .get_tasks_by_story(story.id)?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();

        let reviews = self
            .execute(
                story,
                None,
                Phase::Review,
                token,
                self.agents.reviewer.review(story, &pending),
            )
            .await?;

        let mut verdicts: HashMap<Uuid, ReviewVerdict> = HashMap::new();
        for review in reviews {
            if pending.iter().any(|t| t.id == review.task_id) {
                verdicts.insert(review.task_id, review.verdict);
            } else {
                tracing::warn!(story_id = %story.id, "Ignoring review of unknown task {}", review.task_id);
            }
        }

        for task in &pending {
            match verdicts.remove(&task.id).unwrap_or(ReviewVerdict::Approve) {
                ReviewVerdict::Approve => {
                    self.set_task_status(story, task, TaskStatus::Reviewed, token)
                        .await?;
                }
                ReviewVerdict::Subdivide { tasks: drafts } => {
                    if drafts.is_empty() {
                        return Err(OrchestratorError::malformed(
                            Phase::Review,
                            format!("task {:?} subdivided into nothing", task.title),
                        ));
                    }
                    ensure_active(token, story.id)?;
                    let resolved = resolver::create_tasks(
                        &self.db,
                        story.id,
                        &drafts,
                        Some(task),
                        self.config.resolve_mode,
                    )?;
                    self.set_task_status(story, task, TaskStatus::Subdivided, token)
                        .await?;
                    // Sub-tasks come out of review already approved.
                    for sub in &resolved.tasks {
                        self.db.set_task_status(sub.id, TaskStatus::Reviewed)?;
                        self.announce_task(story, sub).await?;
                    }
                    tracing::info!(
                        story_id = %story.id,
                        "Task {:?} subdivided into {} sub-tasks",
                        task.title,
                        resolved.tasks.len()
                    );
                }
            }
        }

        let tasks = self.db.get_tasks_by_story(story.id)?;
        resolver::execution_order(&tasks)?;

        if !self
            .db
            .transition_story(story.id, &[StoryStatus::Reviewing], StoryStatus::TasksReady)?
        {
            return Err(OrchestratorError::Cancelled(story.id));
        }
        Ok(())
    }

    /// Run `phase` for every task, one ready task at a time.
    async fn run_tasks(&self, story: &Story, phase: Phase, token: &CancellationToken) -> Result<()> {
        let workspace = self.snapshots.workspace(story.id, story.project_id);
        let mut processed = 0;

        loop {
            ensure_active(token, story.id)?;
            let tasks = self.db.get_tasks_by_story(story.id)?;
            let Some(task) = resolver::ready_tasks(&tasks, phase).first().map(|t| (*t).clone())
            else {
                let blocked = resolver::pending_tasks(&tasks, phase).len();
                if blocked > 0 {
                    return Err(OrchestratorError::Blocked { phase, blocked });
                }
                break;
            };

            if let Err(e) = self.run_task(story, &task, phase, &workspace, token).await {
                if !matches!(e, OrchestratorError::Cancelled(_)) {
                    self.db.set_task_status(task.id, TaskStatus::Failed)?;
                    let payload = task_payload(story, &task).with("status", TaskStatus::Failed.as_str());
                    if let Err(publish) = self.bus.publish(EventType::TaskStatusChanged, payload).await {
                        tracing::error!(task_id = %task.id, "Failed to publish task failure: {}", publish);
                    }
                }
                return Err(e);
            }
            processed += 1;
        }

        tracing::info!(story_id = %story.id, "{} finished for {} tasks", phase, processed);
        Ok(())
    }

    async fn run_task(
        &self,
        story: &Story,
        task: &Task,
        phase: Phase,
        workspace: &Workspace,
        token: &CancellationToken,
    ) -> Result<()> {
        match phase {
            Phase::Generate => {
                self.set_task_status(story, task, TaskStatus::InProgress, token)
                    .await?;
                let files = workspace.files()?;
                let changes = self
                    .execute(
                        story,
                        Some(task),
                        phase,
                        token,
                        self.agents.generator.generate(story, task, &files),
                    )
                    .await?;
                apply_changes(workspace, &changes, token, story.id)?;
                self.set_task_status(story, task, TaskStatus::CodeGenerated, token)
                    .await
            }
            Phase::CodeReview => {
                let files = workspace.files()?;
                let reviewer = &self.agents.code_reviewer;
                self.execute(story, Some(task), phase, token, async {
                    let review = reviewer.review_code(story, task, &files).await?;
                    if !review.approved {
                        anyhow::bail!("code review rejected: {}", review.comments);
                    }
                    Ok(review)
                })
                .await?;
                self.set_task_status(story, task, TaskStatus::CodeApproved, token)
                    .await
            }
            Phase::Test => {
                let files = workspace.files()?;
                let tests = self
                    .execute(
                        story,
                        Some(task),
                        phase,
                        token,
                        self.agents.tester.write_tests(story, task, &files),
                    )
                    .await?;
                apply_changes(workspace, &tests, token, story.id)?;
                self.set_task_status(story, task, TaskStatus::TestsGenerated, token)
                    .await?;

                let files = workspace.files()?;
                let tester = &self.agents.tester;
                self.execute(story, Some(task), phase, token, async {
                    let report = tester.run_tests(story, task, &files).await?;
                    if !report.passed {
                        anyhow::bail!("tests failed: {}", report.summary);
                    }
                    Ok(report)
                })
                .await?;
                self.set_task_status(story, task, TaskStatus::TestsPassed, token)
                    .await
            }
            Phase::Divide | Phase::Review | Phase::Deploy => {
                Err(anyhow::anyhow!("{} does not run per task", phase).into())
            }
        }
    }

    async fn deploy(&self, story: &Story, token: &CancellationToken) -> Result<()> {
        let tasks = self.db.get_tasks_by_story(story.id)?;
        let order: Vec<Task> = resolver::execution_order(&tasks)?
            .into_iter()
            .cloned()
            .collect();

        let untested = order
            .iter()
            .filter(|t| !t.status.has_completed(Phase::Test))
            .count();
        if untested > 0 {
            return Err(OrchestratorError::Blocked {
                phase: Phase::Deploy,
                blocked: untested,
            });
        }

        let workspace = self.snapshots.workspace(story.id, story.project_id);
        let files = workspace.files()?;
        let changes = self
            .execute(
                story,
                None,
                Phase::Deploy,
                token,
                self.agents.deployer.deploy(story, &order, &files),
            )
            .await?;
        apply_changes(&workspace, &changes, token, story.id)?;

        for task in &order {
            self.set_task_status(story, task, TaskStatus::Deployed, token)
                .await?;
        }

        tracing::info!(story_id = %story.id, "Deployed {} tasks", order.len());
        Ok(())
    }
}
