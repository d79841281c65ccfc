use thiserror::Error;
use uuid::Uuid;

use crate::models::{Phase, StoryStatus};

/// Failures raised by the orchestration engine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("story {0} not found")]
    StoryNotFound(Uuid),

    #[error("story {id} is already processing (status: {})", .status.as_str())]
    AlreadyProcessing { id: Uuid, status: StoryStatus },

    #[error("story {0} has already completed")]
    AlreadyCompleted(Uuid),

    #[error("dependency cycle between tasks: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("malformed {phase} output: {reason}")]
    MalformedOutput { phase: Phase, reason: String },

    #[error("{phase} collaborator failed: {reason}")]
    Collaborator { phase: Phase, reason: String },

    #[error("{phase} stalled: {blocked} tasks have unmet dependencies")]
    Blocked { phase: Phase, blocked: usize },

    #[error("story {0} was cancelled")]
    Cancelled(Uuid),

    #[error("{phase} collaborator timed out after {seconds}s")]
    CollaboratorTimeout { phase: Phase, seconds: u64 },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn malformed(phase: Phase, reason: impl std::fmt::Display) -> Self {
        Self::MalformedOutput {
            phase,
            reason: reason.to_string(),
        }
    }
}

/// Failures talking to the message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("broker rejected publish on channel {channel}: {reason}")]
    Publish { channel: String, reason: String },

    #[error("broker subscription to {channel} failed: {reason}")]
    Subscribe { channel: String, reason: String },
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
