//! Engine configuration loaded from environment variables.

use std::time::Duration;

use crate::resolver::ResolveMode;

/// Default broker channel carrying agent events.
pub const DEFAULT_EVENT_CHANNEL: &str = "agent-events";

const DEFAULT_BROKER_CAPACITY: usize = 1024;

/// Runtime settings for the orchestration engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Broker channel events are published on (from STORYLINE_EVENT_CHANNEL)
    pub event_channel: String,
    /// Buffer size of the in-memory broker (from STORYLINE_BROKER_CAPACITY)
    pub broker_capacity: usize,
    /// Upper bound for a single collaborator call. `None` waits indefinitely.
    /// (from STORYLINE_COLLABORATOR_TIMEOUT_SECS)
    pub collaborator_timeout: Option<Duration>,
    /// How task batches resolve dependency titles (from STORYLINE_RESOLVE_MODE:
    /// `validated` or `declaration_order`)
    pub resolve_mode: ResolveMode,
    pub completion: CompletionConfig,
}

/// Connection settings for the completion service.
#[derive(Clone, Debug)]
pub struct CompletionConfig {
    /// Endpoint accepting `{model, prompt, options}` (from STORYLINE_COMPLETION_URL)
    pub url: Option<String>,
    /// From STORYLINE_COMPLETION_MODEL
    pub model: String,
    /// From STORYLINE_COMPLETION_API_KEY
    pub api_key: Option<String>,
    /// From STORYLINE_COMPLETION_MAX_TOKENS
    pub max_tokens: Option<u32>,
    /// From STORYLINE_COMPLETION_TEMPERATURE
    pub temperature: Option<f32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel: DEFAULT_EVENT_CHANNEL.to_string(),
            broker_capacity: DEFAULT_BROKER_CAPACITY,
            collaborator_timeout: None,
            resolve_mode: ResolveMode::default(),
            completion: CompletionConfig::default(),
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            url: None,
            model: "default".to_string(),
            api_key: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let event_channel = lookup("STORYLINE_EVENT_CHANNEL")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.event_channel);

        let broker_capacity = lookup("STORYLINE_BROKER_CAPACITY")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.broker_capacity);

        let collaborator_timeout = lookup("STORYLINE_COLLABORATOR_TIMEOUT_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|n| *n > 0)
            .map(Duration::from_secs);

        let resolve_mode = match lookup("STORYLINE_RESOLVE_MODE") {
            Some(raw) => ResolveMode::from_str(raw.trim()).unwrap_or_else(|| {
                tracing::warn!("Unknown STORYLINE_RESOLVE_MODE {:?}, using validated", raw);
                defaults.resolve_mode
            }),
            None => defaults.resolve_mode,
        };

        let completion = CompletionConfig {
            url: lookup("STORYLINE_COMPLETION_URL"),
            model: lookup("STORYLINE_COMPLETION_MODEL").unwrap_or(defaults.completion.model),
            api_key: lookup("STORYLINE_COMPLETION_API_KEY"),
            max_tokens: lookup("STORYLINE_COMPLETION_MAX_TOKENS")
                .and_then(|s| s.parse::<u32>().ok())
                .filter(|n| *n > 0),
            temperature: lookup("STORYLINE_COMPLETION_TEMPERATURE")
                .and_then(|s| s.parse::<f32>().ok())
                .filter(|t| t.is_finite() && *t >= 0.0),
        };

        Self {
            event_channel,
            broker_capacity,
            collaborator_timeout,
            resolve_mode,
            completion,
        }
    }
}
