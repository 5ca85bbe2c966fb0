// Conversation history with a generation-facing ("internal") and a
// display-facing ("visible") view of every turn.
//
// Both views live in one `Turn` record, so they always have the same length.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::chat::ChatExtensions;
use crate::config::ChatMode;
use crate::error::TranscriptError;
use crate::{log_info, log_warn};

/// Internal user text of the scripted greeting turn.
pub const GREETING_SENTINEL: &str = "<|BEGIN-VISIBLE-CHAT|>";

lazy_static::lazy_static! {
    static ref ANON_LABEL: Regex = Regex::new(r"(\n|^)[Aa]non:").expect("valid regex");
    static ref CHARACTER_LABEL: Regex = Regex::new(r"(\n|^)\[CHARACTER\]:").expect("valid regex");
}

/// One request/response pair. Serialized as a two element array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[String; 2]", into = "[String; 2]")]
pub struct Exchange {
    pub user: String,
    pub bot: String,
}

impl Exchange {
    pub fn new(user: impl Into<String>, bot: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            bot: bot.into(),
        }
    }
}

impl From<[String; 2]> for Exchange {
    fn from([user, bot]: [String; 2]) -> Self {
        Self { user, bot }
    }
}

impl From<Exchange> for [String; 2] {
    fn from(exchange: Exchange) -> Self {
        [exchange.user, exchange.bot]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Turn {
    /// Exact text fed back into future prompts.
    pub internal: Exchange,
    /// Text shown to the user.
    pub visible: Exchange,
}

impl Turn {
    pub fn new(internal: Exchange, visible: Exchange) -> Self {
        Self { internal, visible }
    }

    /// A turn whose views are identical.
    pub fn from_pair(user: impl Into<String>, bot: impl Into<String>) -> Self {
        let exchange = Exchange::new(user, bot);
        Self {
            internal: exchange.clone(),
            visible: exchange,
        }
    }

    pub fn is_greeting(&self) -> bool {
        self.internal.user == GREETING_SENTINEL
    }
}

/// On-disk layout shared with existing chat logs.
#[derive(Serialize, Deserialize)]
struct HistoryDocument {
    data: Vec<Exchange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_visible: Option<Vec<Exchange>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Display view of every turn.
    pub fn visible(&self) -> Vec<Exchange> {
        self.turns.iter().map(|t| t.visible.clone()).collect()
    }

    /// Generation view of every turn.
    pub fn internal(&self) -> Vec<Exchange> {
        self.turns.iter().map(|t| t.internal.clone()).collect()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn pop(&mut self) -> Option<Turn> {
        self.turns.pop()
    }

    /// Overwrite the newest turn; appends when the transcript is empty.
    pub fn set_last(&mut self, internal: Exchange, visible: Exchange) {
        match self.turns.last_mut() {
            Some(last) => *last = Turn::new(internal, visible),
            None => self.turns.push(Turn::new(internal, visible)),
        }
    }

    /// Drop the newest turn and return its visible user text. The greeting
    /// turn is never removed.
    pub fn remove_last_message(&mut self) -> String {
        match self.turns.last() {
            Some(last) if !last.is_greeting() => self.turns.pop().map(|t| t.visible.user).unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// Internal text of the newest reply.
    pub fn last_reply(&self) -> &str {
        self.turns.last().map(|t| t.internal.bot.as_str()).unwrap_or_default()
    }

    /// Replace the newest reply with hand-written text.
    pub fn replace_last_reply(&mut self, text: &str, extensions: &dyn ChatExtensions) {
        if let Some(last) = self.turns.last_mut() {
            last.visible.bot = text.to_string();
            last.internal.bot = extensions.transform_input(text);
        }
    }

    /// Add a user message without generating a reply.
    pub fn send_dummy_message(&mut self, text: &str, extensions: &dyn ChatExtensions) {
        self.turns.push(Turn::new(
            Exchange::new(extensions.transform_input(text), ""),
            Exchange::new(text, ""),
        ));
    }

    /// Add a scripted reply, opening a new turn when the newest one already
    /// has a reply.
    pub fn send_dummy_reply(&mut self, text: &str, extensions: &dyn ChatExtensions) {
        if self.turns.last().is_none_or(|t| !t.visible.bot.is_empty()) {
            self.turns.push(Turn::default());
        }
        if let Some(last) = self.turns.last_mut() {
            last.visible.bot = text.to_string();
            last.internal.bot = extensions.transform_input(text);
        }
    }

    /// Reset the conversation, seeding the greeting outside instruct mode.
    pub fn clear_chat_log(&mut self, greeting: &str, mode: ChatMode, extensions: &dyn ChatExtensions) {
        self.turns.clear();
        if mode != ChatMode::Instruct && !greeting.is_empty() {
            self.turns.push(Turn::new(
                Exchange::new(GREETING_SENTINEL, greeting),
                Exchange::new("", extensions.transform_output(greeting)),
            ));
        }
    }

    pub fn to_json(&self) -> Result<String, TranscriptError> {
        let document = HistoryDocument {
            data: self.internal(),
            data_visible: Some(self.visible()),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Parse a `{"data": ..., "data_visible": ...}` document. The visible
    /// view defaults to a copy of the internal one.
    pub fn from_json(json: &str) -> Result<Self, TranscriptError> {
        let document: HistoryDocument = serde_json::from_str(json)?;
        let visible = document.data_visible.unwrap_or_else(|| document.data.clone());
        if visible.len() != document.data.len() {
            return Err(TranscriptError::LengthMismatch {
                internal: document.data.len(),
                visible: visible.len(),
            });
        }

        let turns = document
            .data
            .into_iter()
            .zip(visible)
            .map(|(internal, visible)| Turn::new(internal, visible))
            .collect();
        Ok(Self { turns })
    }

    /// Replace the history with a saved chat: a JSON document, or plain
    /// `Name: message` dialogue when the text is not JSON. JSON without a
    /// `data` key, or with unusable data, leaves the history unchanged.
    pub fn load_history(&mut self, text: &str, name1: &str, name2: &str) {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(document) if document.get("data").is_none() => {
                log_warn!("JSON history has no \"data\" key, keeping the current chat");
            }
            Ok(_) => match Self::from_json(text) {
                Ok(transcript) => *self = transcript,
                Err(e) => log_warn!("Cannot load JSON history, keeping the current chat: {}", e),
            },
            Err(e) => {
                log_info!("History is not a JSON document ({}), parsing it as dialogue", e);
                self.turns = tokenize_dialogue(text, name1, name2)
                    .into_iter()
                    .map(|exchange| Turn::new(exchange.clone(), exchange))
                    .collect();
            }
        }
    }
}

/// Split plain dialogue text into user/bot exchanges.
///
/// Lines starting with `{name1}:` or `{name2}:` open a message; a bot message
/// closes the current exchange.
pub fn tokenize_dialogue(dialogue: &str, name1: &str, name2: &str) -> Vec<Exchange> {
    let dialogue = dialogue.replace("<START>", "").replace("<start>", "");
    let dialogue = ANON_LABEL.replace_all(&dialogue, "${1}You:");
    let dialogue = CHARACTER_LABEL.replace_all(&dialogue, format!("${{1}}{name2}:").as_str());

    let pattern = format!("(^|\n)({}|{}):", regex::escape(name1), regex::escape(name2));
    let speaker = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            log_warn!("Cannot build speaker pattern for {:?}/{:?}: {}", name1, name2, e);
            return Vec::new();
        }
    };

    let starts: Vec<usize> = speaker.find_iter(&dialogue).map(|m| m.start()).collect();
    let ends = starts.iter().skip(1).copied().chain(std::iter::once(dialogue.len()));
    let user_label = format!("{name1}:");
    let bot_label = format!("{name2}:");

    let mut history = Vec::new();
    let mut entry = Exchange::default();
    for (start, end) in starts.iter().copied().zip(ends) {
        let message = dialogue[start..end].trim();
        if let Some(text) = message.strip_prefix(&user_label) {
            entry.user = text.trim().to_string();
        } else if let Some(text) = message.strip_prefix(&bot_label) {
            entry.bot = text.trim().to_string();
            let finished = std::mem::take(&mut entry);
            if !(finished.user.is_empty() && finished.bot.is_empty()) {
                history.push(finished);
            }
        }
    }

    history
}
