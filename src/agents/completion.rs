//! Agents backed by a text-completion service.

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    CodeGenerator, CodeReview, CodeReviewer, Deployer, TaskDivider, TaskReview, TaskReviewer,
    TestAuthor, TestReport,
};
use crate::config::CompletionConfig;
use crate::error::OrchestratorError;
use crate::models::{FileChange, Phase, ProjectFile, Story, Task, TaskDraft};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionOptions {
    /// Pipeline phase the prompt belongs to.
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl CompletionOptions {
    /// Generation limits shared by every prompt.
    pub fn from_config(config: &CompletionConfig) -> Self {
        Self {
            phase: None,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    fn for_phase(&self, phase: Phase) -> Self {
        Self {
            phase: Some(phase),
            ..self.clone()
        }
    }
}

/// Produces structured output from a prompt.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Completion service reached over HTTP.
///
/// Sends `{model, prompt, options}` and expects `{output}` back, where
/// `output` is either JSON or a string containing JSON.
pub struct HttpCompletionService {
    url: String,
    model: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct CompletionResponse {
    output: serde_json::Value,
}

impl HttpCompletionService {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            api_key: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn from_config(config: &CompletionConfig) -> Option<Self> {
        let url = config.url.clone()?;
        let service = Self::new(url, config.model.clone());
        Some(match &config.api_key {
            Some(key) => service.with_api_key(key.clone()),
            None => service,
        })
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    async fn generate(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> anyhow::Result<serde_json::Value> {
        let body = serde_json::json!({
            "model": &self.model,
            "prompt": prompt,
            "options": options,
        });

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .context("Failed to call completion service")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Completion service error {status}: {body}");
        }

        let parsed = resp
            .json::<CompletionResponse>()
            .await
            .context("Failed to parse completion response")?;
        Ok(parsed.output)
    }
}

/// Interpret completion output as `T`, failing the phase when it does not fit.
pub fn parse_structured<T: DeserializeOwned>(
    phase: Phase,
    value: serde_json::Value,
) -> Result<T, OrchestratorError> {
    let value = match value {
        serde_json::Value::String(text) => {
            serde_json::from_str(strip_code_fence(&text)).map_err(|e| {
                OrchestratorError::malformed(phase, format!("output is not JSON: {}", e))
            })?
        }
        other => other,
    };

    serde_json::from_value(value).map_err(|e| OrchestratorError::malformed(phase, e))
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DividerOutput {
    List(Vec<TaskDraft>),
    Wrapped { tasks: Vec<TaskDraft> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChangesOutput {
    List(Vec<FileChange>),
    Wrapped { files: Vec<FileChange> },
}

impl ChangesOutput {
    fn into_changes(self) -> Vec<FileChange> {
        match self {
            Self::List(changes) | Self::Wrapped { files: changes } => changes,
        }
    }
}

#[derive(Deserialize)]
struct ReviewOutput {
    reviews: Vec<TaskReview>,
}

/// Implements every phase collaborator by prompting a [`CompletionService`]
/// and strictly parsing its JSON.
pub struct CompletionAgent<S> {
    service: S,
    options: CompletionOptions,
}

impl<S: CompletionService> CompletionAgent<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            options: CompletionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    async fn ask<T: DeserializeOwned>(&self, phase: Phase, prompt: String) -> anyhow::Result<T> {
        let value = self
            .service
            .generate(&prompt, &self.options.for_phase(phase))
            .await?;
        Ok(parse_structured(phase, value)?)
    }
}

fn describe_story(story: &Story) -> String {
    format!("Story: {}\n\n{}", story.title, story.description)
}

fn describe_task(task: &Task) -> String {
    format!(
        "Task {} ({}): {}\n\n{}",
        task.id,
        task.task_type.as_str(),
        task.title,
        task.description
    )
}

fn describe_files(files: &[ProjectFile]) -> String {
    files
        .iter()
        .map(|f| format!("--- {}\n{}", f.path, f.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl<S: CompletionService> TaskDivider for CompletionAgent<S> {
    async fn divide(&self, story: &Story) -> anyhow::Result<Vec<TaskDraft>> {
        let prompt = format!(
            "{}\n\nSplit this story into tasks. Reply with a JSON array of \
             {{title, description, type, priority, dependencies}} where dependencies \
             are titles of earlier tasks.",
            describe_story(story)
        );
        let tasks = match self.ask::<DividerOutput>(Phase::Divide, prompt).await? {
            DividerOutput::List(tasks) | DividerOutput::Wrapped { tasks } => tasks,
        };
        if tasks.is_empty() {
            return Err(OrchestratorError::malformed(Phase::Divide, "no tasks produced").into());
        }
        Ok(tasks)
    }
}

#[async_trait]
impl<S: CompletionService> TaskReviewer for CompletionAgent<S> {
    async fn review(&self, story: &Story, tasks: &[Task]) -> anyhow::Result<Vec<TaskReview>> {
        let listing = tasks
            .iter()
            .map(describe_task)
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = format!(
            "{}\n\n{}\n\nReview each task. Reply with {{\"reviews\": [{{task_id, verdict}}]}} \
             where verdict is \"approve\" or \"subdivide\" with a \"tasks\" array.",
            describe_story(story),
            listing
        );
        let output: ReviewOutput = self.ask(Phase::Review, prompt).await?;
        Ok(output.reviews)
    }
}

#[async_trait]
impl<S: CompletionService> CodeGenerator for CompletionAgent<S> {
    async fn generate(
        &self,
        story: &Story,
        task: &Task,
        files: &[ProjectFile],
    ) -> anyhow::Result<Vec<FileChange>> {
        let prompt = format!(
            "{}\n\n{}\n\nProject files:\n{}\n\nReply with {{\"files\": [{{action, path, content}}]}}.",
            describe_story(story),
            describe_task(task),
            describe_files(files)
        );
        let output: ChangesOutput = self.ask(Phase::Generate, prompt).await?;
        Ok(output.into_changes())
    }
}

#[async_trait]
impl<S: CompletionService> CodeReviewer for CompletionAgent<S> {
    async fn review_code(
        &self,
        story: &Story,
        task: &Task,
        files: &[ProjectFile],
    ) -> anyhow::Result<CodeReview> {
        let prompt = format!(
            "{}\n\n{}\n\nProject files:\n{}\n\nReply with {{approved, comments}}.",
            describe_story(story),
            describe_task(task),
            describe_files(files)
        );
        self.ask(Phase::CodeReview, prompt).await
    }
}

#[async_trait]
impl<S: CompletionService> TestAuthor for CompletionAgent<S> {
    async fn write_tests(
        &self,
        story: &Story,
        task: &Task,
        files: &[ProjectFile],
    ) -> anyhow::Result<Vec<FileChange>> {
        let prompt = format!(
            "{}\n\n{}\n\nProject files:\n{}\n\nWrite tests. Reply with {{\"files\": [{{action, path, content}}]}}.",
            describe_story(story),
            describe_task(task),
            describe_files(files)
        );
        let output: ChangesOutput = self.ask(Phase::Test, prompt).await?;
        Ok(output.into_changes())
    }

    async fn run_tests(
        &self,
        story: &Story,
        task: &Task,
        files: &[ProjectFile],
    ) -> anyhow::Result<TestReport> {
        let prompt = format!(
            "{}\n\n{}\n\nProject files:\n{}\n\nEvaluate the tests. Reply with {{passed, summary}}.",
            describe_story(story),
            describe_task(task),
            describe_files(files)
        );
        self.ask(Phase::Test, prompt).await
    }
}

#[async_trait]
impl<S: CompletionService> Deployer for CompletionAgent<S> {
    async fn deploy(
        &self,
        story: &Story,
        tasks: &[Task],
        files: &[ProjectFile],
    ) -> anyhow::Result<Vec<FileChange>> {
        let listing = tasks
            .iter()
            .map(|t| format!("- {}", t.title))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "{}\n\nImplemented tasks:\n{}\n\nProject files:\n{}\n\nPrepare deployment. \
             Reply with {{\"files\": [{{action, path, content}}]}}.",
            describe_story(story),
            listing,
            describe_files(files)
        );
        let output: ChangesOutput = self.ask(Phase::Deploy, prompt).await?;
        Ok(output.into_changes())
    }
}
