//! Contracts for the collaborators the dialogue core calls out to: the token
//! length function and the inference engine.

use futures_util::stream::BoxStream;

use crate::config::ChatState;
use crate::error::EngineError;

/// Text fragments produced by one generation call. Fragments are incremental
/// and are concatenated by the caller.
pub type FragmentStream<'a> = BoxStream<'a, Result<String, EngineError>>;

/// Measures prompt length in model tokens.
pub trait TokenCounter: Send + Sync {
    /// Number of tokens `text` encodes to.
    fn encoded_length(&self, text: &str) -> usize;

    /// Largest prompt the model accepts while leaving room for the reply.
    fn max_prompt_length(&self, state: &ChatState) -> usize {
        state.truncation_length.saturating_sub(state.max_new_tokens)
    }
}

/// Rough counter for when no tokenizer is at hand (about 4 chars per token).
#[derive(Debug, Clone, Copy)]
pub struct ApproxTokenCounter {
    pub chars_per_token: usize,
}

impl Default for ApproxTokenCounter {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl TokenCounter for ApproxTokenCounter {
    fn encoded_length(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token.max(1))
    }
}

/// One call into the inference engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineRequest<'a> {
    pub prompt: &'a str,
    pub state: &'a ChatState,
    /// Token the engine should treat as end of sequence (`"\n"` in
    /// stop-at-newline mode).
    pub eos_token: Option<&'a str>,
    pub stopping_strings: &'a [String],
}

/// External text generator.
pub trait InferenceEngine: Send + Sync {
    /// Whether a model is available. Generation is skipped when it is not.
    fn is_loaded(&self) -> bool {
        true
    }

    fn generate<'a>(&'a self, request: EngineRequest<'a>) -> FragmentStream<'a>;
}
