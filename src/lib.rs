//! Chat dialogue core for local LLM chat: renders conversation history into
//! a bounded prompt and turns streamed model output into transcript updates.

pub mod character;
pub mod chat;
pub mod config;
pub mod error;
pub mod logger;
pub mod transcript;

pub use chat::{
    generate_chat_prompt, get_stopping_strings, get_turn_substrings, CancellationFlag, ChatExtensions, ChatGenerator,
    ChatPrompt, InferenceEngine, PromptOptions, ReplyKind, TokenCounter,
};
pub use character::CharacterCard;
pub use config::{ChatMode, ChatState};
pub use error::{ConfigError, EngineError, GenerationError, TranscriptError};
pub use transcript::{Exchange, Transcript, Turn};
