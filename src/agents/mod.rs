//! Collaborator contracts for the pipeline phases.
//!
//! Each phase hands its work to an automated agent through one of these
//! traits. Agents are pure with respect to project state: they return file
//! changes and verdicts, and the orchestrator applies them through the
//! story's snapshot-tracked workspace.

mod completion;

pub use completion::*;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{FileChange, ProjectFile, Story, Task, TaskDraft};

/// Splits a story into an ordered batch of task drafts.
#[async_trait]
pub trait TaskDivider: Send + Sync {
    async fn divide(&self, story: &Story) -> anyhow::Result<Vec<TaskDraft>>;
}

/// Reviewer verdict for one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approve,
    /// Replace the task with smaller sub-tasks.
    Subdivide { tasks: Vec<TaskDraft> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskReview {
    pub task_id: Uuid,
    #[serde(flatten)]
    pub verdict: ReviewVerdict,
}

/// Approves tasks or asks for them to be subdivided. Tasks missing from the
/// returned list are approved.
#[async_trait]
pub trait TaskReviewer: Send + Sync {
    async fn review(&self, story: &Story, tasks: &[Task]) -> anyhow::Result<Vec<TaskReview>>;
}

/// Produces the file changes implementing one task.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(
        &self,
        story: &Story,
        task: &Task,
        files: &[ProjectFile],
    ) -> anyhow::Result<Vec<FileChange>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeReview {
    pub approved: bool,
    #[serde(default)]
    pub comments: String,
}

#[async_trait]
pub trait CodeReviewer: Send + Sync {
    async fn review_code(
        &self,
        story: &Story,
        task: &Task,
        files: &[ProjectFile],
    ) -> anyhow::Result<CodeReview>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestReport {
    pub passed: bool,
    #[serde(default)]
    pub summary: String,
}

/// Writes tests for a task, then runs them.
#[async_trait]
pub trait TestAuthor: Send + Sync {
    async fn write_tests(
        &self,
        story: &Story,
        task: &Task,
        files: &[ProjectFile],
    ) -> anyhow::Result<Vec<FileChange>>;

    async fn run_tests(
        &self,
        story: &Story,
        task: &Task,
        files: &[ProjectFile],
    ) -> anyhow::Result<TestReport>;
}

/// Ships the story. May return deployment files to add to the project.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(
        &self,
        story: &Story,
        tasks: &[Task],
        files: &[ProjectFile],
    ) -> anyhow::Result<Vec<FileChange>>;
}

/// The full set of collaborators a pipeline run needs.
#[derive(Clone)]
pub struct Agents {
    pub divider: Arc<dyn TaskDivider>,
    pub reviewer: Arc<dyn TaskReviewer>,
    pub generator: Arc<dyn CodeGenerator>,
    pub code_reviewer: Arc<dyn CodeReviewer>,
    pub tester: Arc<dyn TestAuthor>,
    pub deployer: Arc<dyn Deployer>,
}

impl Agents {
    /// Use one agent for every phase.
    pub fn uniform<A>(agent: Arc<A>) -> Self
    where
        A: TaskDivider + TaskReviewer + CodeGenerator + CodeReviewer + TestAuthor + Deployer + 'static,
    {
        Self {
            divider: agent.clone(),
            reviewer: agent.clone(),
            generator: agent.clone(),
            code_reviewer: agent.clone(),
            tester: agent.clone(),
            deployer: agent,
        }
    }
}
