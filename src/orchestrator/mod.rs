//! Phase orchestrator: the story state machine.
//!
//! A story moves through
//! `pending → dividing → reviewing → tasks_ready → generating → code_review →
//! testing → deploying → completed`. Each phase runs on its own tokio task and
//! reports back through the event bus:
//!
//! - the runner publishes `PHASE_COMPLETED` or `PHASE_FAILED`;
//! - the orchestrator's bus handlers react by starting the next phase, or by
//!   rolling back the story's file changes and marking it `failed`.
//!
//! Phase events carry the id of the run that produced them. Handlers only act
//! when that run still owns the story and the story is still in the phase the
//! event refers to (an atomic compare-and-set on the story status), so
//! redelivered events and late events of a cancelled run are ignored.
//!
//! Each active run owns a [`CancellationToken`]. Runners check it between
//! collaborator calls and tasks; in-flight calls are never interrupted.
//!
//! [`Orchestrator::register`] must be called once, and the bus must be
//! listening, before stories can advance past their first phase.

mod phases;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::Agents;
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, EventHandler};
use crate::models::{
    AgentEvent, EventPayload, EventType, Phase, Story, StoryFailure, StoryStatus,
};
use crate::snapshot::{CancelOutcome, RollbackReport, SnapshotManager};

/// Immediate answer to a processing request. Progress is observable through
/// events and the audit log only.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStarted {
    pub status: &'static str,
    pub story_id: Uuid,
}

#[derive(Clone)]
struct Run {
    id: Uuid,
    token: CancellationToken,
}

pub struct Orchestrator {
    db: Database,
    bus: Arc<EventBus>,
    agents: Agents,
    snapshots: SnapshotManager,
    config: EngineConfig,
    runs: Mutex<HashMap<Uuid, Run>>,
    registered: AtomicBool,
}

impl Orchestrator {
    pub fn new(db: Database, bus: Arc<EventBus>, agents: Agents, config: EngineConfig) -> Self {
        Self {
            snapshots: SnapshotManager::new(db.clone()),
            db,
            bus,
            agents,
            config,
            runs: Mutex::new(HashMap::new()),
            registered: AtomicBool::new(false),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Subscribe the phase handlers on the bus. Later calls are no-ops.
    pub fn register(self: &Arc<Self>) {
        if self.registered.swap(true, Ordering::SeqCst) {
            return;
        }

        let handler: Arc<dyn EventHandler> = Arc::new(PhaseEvents {
            orchestrator: Arc::downgrade(self),
        });
        self.bus.subscribe(EventType::PhaseCompleted, handler.clone());
        self.bus.subscribe(EventType::PhaseFailed, handler);
    }

    /// Whether a pipeline run currently owns the story.
    pub fn is_running(&self, story_id: Uuid) -> bool {
        self.runs
            .lock()
            .expect("run table poisoned")
            .contains_key(&story_id)
    }

    /// Start the pipeline for a story and return without waiting for it.
    ///
    /// Allowed from `pending`, and from `failed` or `cancelled` as a manual
    /// retry. A retry first reverts files a previous rollback left behind,
    /// then discards the previous tasks and failure metadata.
    pub async fn process_story(self: &Arc<Self>, story_id: Uuid) -> Result<ProcessingStarted> {
        let story = self.load_story(story_id)?;
        match story.status {
            StoryStatus::Completed => return Err(OrchestratorError::AlreadyCompleted(story_id)),
            status if status.is_processing() => {
                return Err(OrchestratorError::AlreadyProcessing {
                    id: story_id,
                    status,
                })
            }
            _ => {}
        }

        if !self.begin_run(story_id) {
            return Err(OrchestratorError::AlreadyProcessing {
                id: story_id,
                status: story.status,
            });
        }

        let claimed = self.db.transition_story(
            story_id,
            &[
                StoryStatus::Pending,
                StoryStatus::Failed,
                StoryStatus::Cancelled,
            ],
            StoryStatus::Dividing,
        );
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                self.end_run(story_id);
                let current = self.load_story(story_id)?;
                return Err(match current.status {
                    StoryStatus::Completed => OrchestratorError::AlreadyCompleted(story_id),
                    status => OrchestratorError::AlreadyProcessing {
                        id: story_id,
                        status,
                    },
                });
            }
            Err(e) => {
                self.end_run(story_id);
                return Err(e.into());
            }
        }

        let retry = story.status != StoryStatus::Pending;
        if retry {
            if let Err(e) = self.reset_for_retry(&story) {
                tracing::error!(story_id = %story_id, "Failed to reset story for retry: {}", e);
                self.end_run(story_id);
                let failure = StoryFailure {
                    phase: Phase::Divide,
                    reason: e.to_string(),
                };
                if let Err(mark) = self.db.mark_story_failed(story_id, &failure) {
                    tracing::error!(story_id = %story_id, "Failed to record failure: {:#}", mark);
                }
                return Err(e);
            }
        }

        tracing::info!(story_id = %story_id, retry, "Story processing started");
        tokio::spawn(self.clone().start_run(story, retry));

        Ok(ProcessingStarted {
            status: "processing_started",
            story_id,
        })
    }

    /// Cancel a story. The running phase stops at its next check; open tasks
    /// are failed and, with `rollback`, the pre-story file state is restored.
    pub async fn cancel(&self, story_id: Uuid, rollback: bool) -> Result<CancelOutcome> {
        let story = self.load_story(story_id)?;
        if story.status == StoryStatus::Completed {
            return Err(OrchestratorError::AlreadyCompleted(story_id));
        }

        if let Some(run) = self.run(story_id) {
            run.token.cancel();
        }
        let outcome = self.snapshots.cancel(story.id, story.project_id, rollback);
        self.end_run(story_id);
        let outcome = outcome?;

        if let Some(report) = &outcome.rollback {
            self.publish_rollback(&story, report).await;
        }
        let payload = story_payload(&story)
            .with("rollback", rollback)
            .with("failedTasks", outcome.failed_tasks.len());
        if let Err(e) = self.bus.publish(EventType::StoryCancelled, payload).await {
            tracing::error!(story_id = %story_id, "Failed to publish cancellation: {}", e);
        }

        Ok(outcome)
    }

    async fn start_run(self: Arc<Self>, story: Story, retry: bool) {
        let Some(run) = self.run(story.id) else {
            return;
        };
        let payload = story_payload(&story).with("retry", retry);
        if let Err(e) = self
            .bus
            .publish(EventType::StoryProcessingStarted, payload)
            .await
        {
            tracing::error!(story_id = %story.id, "Failed to announce processing: {}", e);
            self.fail_or_log(story.id, run.id, Phase::Divide, e.to_string())
                .await;
            return;
        }

        self.run_phase(story.id, Phase::Divide).await;
    }

    /// Execute one phase and report its outcome on the bus.
    async fn run_phase(self: Arc<Self>, story_id: Uuid, phase: Phase) {
        let Some(run) = self.run(story_id) else {
            tracing::debug!(story_id = %story_id, "No active run, skipping {}", phase);
            return;
        };

        let (event_type, reason) = match self.execute_phase(story_id, phase, &run.token).await {
            Err(OrchestratorError::Cancelled(_)) => {
                tracing::info!(story_id = %story_id, "Stopped before finishing {}", phase);
                return;
            }
            _ if run.token.is_cancelled() => return,
            Ok(()) => (EventType::PhaseCompleted, None),
            Err(e) => {
                tracing::error!(story_id = %story_id, "Phase {} failed: {}", phase, e);
                (EventType::PhaseFailed, Some(e.to_string()))
            }
        };

        let story = match self.load_story(story_id) {
            Ok(story) => story,
            Err(e) => {
                tracing::error!(story_id = %story_id, "Cannot report {}: {}", phase, e);
                return;
            }
        };
        let mut payload = story_payload(&story)
            .with("phase", phase.as_str())
            .with("runId", run.id.to_string());
        if let Some(reason) = &reason {
            payload = payload.with("reason", reason.as_str());
        }

        if let Err(e) = self.bus.publish(event_type, payload).await {
            tracing::error!(story_id = %story_id, "Failed to report {}: {}", phase, e);
            let reason = reason.unwrap_or_else(|| e.to_string());
            self.fail_or_log(story_id, run.id, phase, reason).await;
        }
    }

    /// Compare-and-set the story status on behalf of `run_id`.
    ///
    /// The run table stays locked across the check and the write, so a cancel
    /// or a retry cannot slip in between.
    fn transition_for_run(
        &self,
        story_id: Uuid,
        run_id: Uuid,
        from: &[StoryStatus],
        to: StoryStatus,
    ) -> Result<bool> {
        let runs = self.runs.lock().expect("run table poisoned");
        if !runs.get(&story_id).is_some_and(|run| run.id == run_id) {
            return Ok(false);
        }
        Ok(self.db.transition_story(story_id, from, to)?)
    }

    /// React to a finished phase: start the next one, or complete the story.
    ///
    /// Only the status change happens inline; the follow-up work runs on its
    /// own task.
    fn advance(self: &Arc<Self>, story_id: Uuid, run_id: Uuid, phase: Phase) -> Result<()> {
        let from = match phase {
            Phase::Review => StoryStatus::TasksReady,
            other => other.story_status(),
        };
        let to = phase
            .next()
            .map_or(StoryStatus::Completed, |next| next.story_status());

        if !self.transition_for_run(story_id, run_id, &[from], to)? {
            tracing::debug!(story_id = %story_id, "Ignoring stale completion of {}", phase);
            return Ok(());
        }

        let this = self.clone();
        match phase.next() {
            Some(next) => {
                tracing::info!(story_id = %story_id, "Story advanced to {}", next);
                tokio::spawn(this.run_phase(story_id, next));
            }
            None => {
                tokio::spawn(async move {
                    if let Err(e) = this.finish_story(story_id).await {
                        tracing::error!(story_id = %story_id, "Failed to finish story: {}", e);
                    }
                    this.end_run(story_id);
                });
            }
        }
        Ok(())
    }

    async fn finish_story(&self, story_id: Uuid) -> Result<()> {
        self.snapshots.cleanup(story_id)?;
        let story = self.load_story(story_id)?;
        tracing::info!(story_id = %story_id, "Story completed");
        self.bus
            .publish(EventType::StoryCompleted, story_payload(&story))
            .await?;
        Ok(())
    }

    /// Move the story to `failed` after a failure of `phase`. Returns false
    /// when the run no longer owns the story or the story left the phase.
    fn claim_failure(&self, story_id: Uuid, run_id: Uuid, phase: Phase) -> Result<bool> {
        let from = match phase {
            Phase::Review => vec![StoryStatus::Reviewing, StoryStatus::TasksReady],
            other => vec![other.story_status()],
        };
        let claimed = self.transition_for_run(story_id, run_id, &from, StoryStatus::Failed)?;
        if !claimed {
            tracing::debug!(story_id = %story_id, "Ignoring stale failure of {}", phase);
        }
        Ok(claimed)
    }

    /// Roll back file changes, fail open tasks and record the failure of a
    /// story already moved to `failed`, then release its run.
    async fn fail_claimed(&self, story_id: Uuid, phase: Phase, reason: String) {
        if let Err(e) = self.record_failure(story_id, phase, reason).await {
            tracing::error!(story_id = %story_id, "Failed to record story failure: {}", e);
        }
        self.end_run(story_id);
    }

    async fn record_failure(&self, story_id: Uuid, phase: Phase, reason: String) -> Result<()> {
        let story = self.load_story(story_id)?;
        let failed_tasks = self.db.fail_open_tasks(story_id)?;
        let report = self.snapshots.rollback(story.id, story.project_id)?;

        self.db.mark_story_failed(
            story_id,
            &StoryFailure {
                phase,
                reason: reason.clone(),
            },
        )?;
        self.db
            .set_rollback_failures(story_id, &report.failed_paths())?;

        self.publish_rollback(&story, &report).await;

        tracing::warn!(
            story_id = %story_id,
            "Story failed in {} ({} open tasks failed): {}",
            phase,
            failed_tasks.len(),
            reason
        );
        let payload = story_payload(&story)
            .with("phase", phase.as_str())
            .with("reason", reason)
            .with("inconsistent", !report.is_complete());
        self.bus.publish(EventType::StoryFailed, payload).await?;
        Ok(())
    }

    async fn fail_or_log(&self, story_id: Uuid, run_id: Uuid, phase: Phase, reason: String) {
        match self.claim_failure(story_id, run_id, phase) {
            Ok(true) => self.fail_claimed(story_id, phase, reason).await,
            Ok(false) => {}
            Err(e) => tracing::error!(story_id = %story_id, "Failed to mark story failed: {}", e),
        }
    }

    async fn publish_rollback(&self, story: &Story, report: &RollbackReport) {
        let event_type = if report.is_complete() {
            EventType::RollbackCompleted
        } else {
            EventType::RollbackIncomplete
        };
        let failures = serde_json::to_value(&report.failures).unwrap_or_default();
        let payload = story_payload(story)
            .with("restored", report.restored)
            .with("deleted", report.deleted)
            .with("failures", failures);

        if let Err(e) = self.bus.publish(event_type, payload).await {
            tracing::error!(story_id = %story.id, "Failed to publish rollback result: {}", e);
        }
    }

    /// Revert files left behind by an incomplete rollback, then forget the
    /// previous attempt.
    fn reset_for_retry(&self, story: &Story) -> Result<()> {
        let mut remaining = Vec::new();
        if !self.db.get_snapshots(story.id)?.is_empty() {
            let report = self.snapshots.rollback(story.id, story.project_id)?;
            if !report.is_complete() {
                tracing::warn!(
                    story_id = %story.id,
                    "Retrying with {} files still unrestored",
                    report.failures.len()
                );
            }
            remaining = report.failed_paths();
        }

        let removed = self.db.delete_tasks_by_story(story.id)?;
        self.db.clear_story_failure(story.id)?;
        self.db.set_rollback_failures(story.id, &remaining)?;
        tracing::debug!(story_id = %story.id, "Discarded {} tasks from the previous attempt", removed);
        Ok(())
    }

    fn load_story(&self, story_id: Uuid) -> Result<Story> {
        self.db
            .get_story(story_id)?
            .ok_or(OrchestratorError::StoryNotFound(story_id))
    }

    fn begin_run(&self, story_id: Uuid) -> bool {
        let mut runs = self.runs.lock().expect("run table poisoned");
        if runs.contains_key(&story_id) {
            return false;
        }
        runs.insert(
            story_id,
            Run {
                id: Uuid::new_v4(),
                token: CancellationToken::new(),
            },
        );
        true
    }

    fn end_run(&self, story_id: Uuid) {
        self.runs
            .lock()
            .expect("run table poisoned")
            .remove(&story_id);
    }

    fn run(&self, story_id: Uuid) -> Option<Run> {
        self.runs
            .lock()
            .expect("run table poisoned")
            .get(&story_id)
            .cloned()
    }
}

fn story_payload(story: &Story) -> EventPayload {
    EventPayload::story(story.project_id, story.id)
}

/// Bus handler feeding phase outcomes back into the orchestrator.
///
/// Runs on the bus receive loop, so it only performs the status change and
/// leaves anything that publishes to spawned tasks.
struct PhaseEvents {
    orchestrator: Weak<Orchestrator>,
}

#[async_trait]
impl EventHandler for PhaseEvents {
    async fn handle(&self, event: &AgentEvent) -> anyhow::Result<()> {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return Ok(());
        };

        let story_id = event
            .payload
            .story_id
            .context("phase event without a story id")?;
        let phase = event
            .payload
            .field_str("phase")
            .and_then(Phase::from_str)
            .context("phase event without a valid phase")?;
        let run_id = event
            .payload
            .field_str("runId")
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .context("phase event without a run id")?;

        match event.event_type {
            EventType::PhaseCompleted => orchestrator.advance(story_id, run_id, phase)?,
            EventType::PhaseFailed => {
                let reason = event
                    .payload
                    .field_str("reason")
                    .unwrap_or("unknown failure")
                    .to_string();
                if orchestrator.claim_failure(story_id, run_id, phase)? {
                    tokio::spawn(async move {
                        orchestrator.fail_claimed(story_id, phase, reason).await;
                    });
                }
            }
            other => tracing::debug!("Phase handler ignoring {}", other),
        }
        Ok(())
    }
}
