// Conversation state: participant names, templates, budgets and flags.
//
// Every field has a serde default so partial JSON documents (or `{}`) load.

use serde::{Deserialize, Serialize};

use crate::chat::{get_stopping_strings, get_turn_substrings};
use crate::error::ConfigError;

/// Dialogue convention used to flatten the transcript into text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ChatMode {
    /// `Name: message` lines.
    #[default]
    #[serde(rename = "chat")]
    Chat,
    /// Model-specific turn template with instruct names.
    #[serde(rename = "instruct")]
    Instruct,
    /// Plain chat dialogue wrapped in a single instruct turn.
    #[serde(rename = "chat-instruct")]
    ChatInstruct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatState {
    #[serde(default = "default_name1")]
    pub name1: String,
    #[serde(default = "default_name2")]
    pub name2: String,
    #[serde(default)]
    pub name1_instruct: String,
    #[serde(default)]
    pub name2_instruct: String,
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(default)]
    pub context_instruct: String,
    #[serde(default)]
    pub greeting: String,
    /// Instruct turn template; literal `\n` sequences are unescaped on use.
    #[serde(default)]
    pub turn_template: String,
    #[serde(default)]
    pub mode: ChatMode,
    #[serde(default = "default_chat_prompt_size")]
    pub chat_prompt_size: usize,
    #[serde(default = "default_generation_attempts")]
    pub chat_generation_attempts: usize,
    #[serde(default)]
    pub stop_at_newline: bool,
    /// Comma separated string literals, e.g. `"\n###", 'END'`.
    #[serde(default)]
    pub custom_stopping_strings: String,
    #[serde(default = "default_truncation_length")]
    pub truncation_length: usize,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    /// Tokens reserved for a loaded soft prompt.
    #[serde(default)]
    pub soft_prompt_length: usize,
}

fn default_name1() -> String {
    "You".to_string()
}

fn default_name2() -> String {
    "Assistant".to_string()
}

fn default_context() -> String {
    "This is a conversation with your Assistant. It is a computer program designed to help you with various tasks such as answering questions, providing recommendations, and helping with decision making. You can ask it anything you want and it will do its best to give you accurate and relevant information.".to_string()
}

fn default_chat_prompt_size() -> usize {
    2048
}

fn default_generation_attempts() -> usize {
    1
}

fn default_truncation_length() -> usize {
    2048
}

fn default_max_new_tokens() -> usize {
    200
}

impl Default for ChatState {
    fn default() -> Self {
        Self {
            name1: default_name1(),
            name2: default_name2(),
            name1_instruct: String::new(),
            name2_instruct: String::new(),
            context: default_context(),
            context_instruct: String::new(),
            greeting: String::new(),
            turn_template: String::new(),
            mode: ChatMode::default(),
            chat_prompt_size: default_chat_prompt_size(),
            chat_generation_attempts: default_generation_attempts(),
            stop_at_newline: false,
            custom_stopping_strings: String::new(),
            truncation_length: default_truncation_length(),
            max_new_tokens: default_max_new_tokens(),
            soft_prompt_length: 0,
        }
    }
}

impl ChatState {
    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let state: ChatState = serde_json::from_str(json)?;
        state.validate()?;
        Ok(state)
    }

    /// Check templates and custom stop strings so bad configuration fails
    /// before a generation attempt.
    pub fn validate(&self) -> Result<(), ConfigError> {
        get_turn_substrings(self, false)?;
        if self.mode != ChatMode::Chat {
            get_turn_substrings(self, true)?;
        }
        get_stopping_strings(self)?;
        Ok(())
    }

    pub fn is_instruct(&self) -> bool {
        self.mode == ChatMode::Instruct
    }
}
