//! Error types for the dialogue core.

use thiserror::Error;

/// Problems with the conversation configuration. Detected before any
/// generation attempt starts and never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid custom stopping strings {input:?}: {reason}")]
    InvalidStopStrings { input: String, reason: String },

    #[error("turn template {template:?} is missing the {placeholder} placeholder")]
    MissingPlaceholder {
        placeholder: &'static str,
        template: String,
    },

    #[error("invalid chat state JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid character YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),
}

/// Failure reported by the inference collaborator.
#[derive(Debug, Error)]
#[error("inference failed: {0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Anything that can end a generation stream early.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Transcript (de)serialization errors.
#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("invalid transcript JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transcript views differ in length (internal {internal}, visible {visible})")]
    LengthMismatch { internal: usize, visible: usize },
}
