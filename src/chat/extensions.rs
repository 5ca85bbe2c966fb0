// Pluggable text transforms applied at fixed points of prompt building and
// generation. Implementations must not touch the transcript.

use super::prompt::PromptOptions;
use crate::config::ChatState;

pub trait ChatExtensions: Send + Sync {
    /// Applied to user text before it enters the internal transcript.
    fn transform_input(&self, text: &str) -> String {
        text.to_string()
    }

    /// Applied to generated text before it is shown.
    fn transform_output(&self, text: &str) -> String {
        text.to_string()
    }

    /// Applied to the bot prefix where generation starts.
    fn transform_bot_prefix(&self, prefix: &str) -> String {
        prefix.to_string()
    }

    /// Replaces the assembled prompt entirely when `Some`.
    fn custom_chat_prompt(&self, _text: &str, _state: &ChatState, _options: &PromptOptions) -> Option<String> {
        None
    }
}

/// Identity transforms.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExtensions;

impl ChatExtensions for NoExtensions {}
