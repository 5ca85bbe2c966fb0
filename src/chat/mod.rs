// Dialogue core: turn templates, stop sequences, prompt assembly and reply
// generation.

pub mod engine;
pub mod extensions;
pub mod generation;
pub mod prompt;
pub mod scripted;
pub mod stop_conditions;
pub mod templates;

pub use engine::{ApproxTokenCounter, EngineRequest, FragmentStream, InferenceEngine, TokenCounter};
pub use extensions::{ChatExtensions, NoExtensions};
pub use generation::{CancellationFlag, ChatGenerator, ReplyKind, PROCESSING_MESSAGE};
pub use prompt::{generate_chat_prompt, ChatPrompt, PromptOptions, PROMPT_PLACEHOLDER};
pub use scripted::ScriptedEngine;
pub use stop_conditions::{
    extract_message_from_reply, get_stopping_strings, parse_custom_stopping_strings, ExtractedReply,
};
pub use templates::{get_turn_substrings, TurnSubstrings};
