use crate::config::ChatState;
use crate::error::ConfigError;

pub const USER_TAG: &str = "<|user|>";
pub const BOT_TAG: &str = "<|bot|>";
pub const USER_MESSAGE: &str = "<|user-message|>";
pub const BOT_MESSAGE: &str = "<|bot-message|>";
pub const ROUND: &str = "<|round|>";

/// `Name: message` convention used outside instruct mode.
pub const CHAT_TURN_TEMPLATE: &str = "<|user|>: <|user-message|>\n<|bot|>: <|bot-message|>\n";

/// Instruct template used when the state does not carry one.
pub const DEFAULT_INSTRUCT_TEMPLATE: &str = "<|user|>\n<|user-message|>\n<|bot|>\n<|bot-message|>\n";

/// The four reusable pieces of a turn template.
///
/// `user_turn` keeps the `<|user-message|>` placeholder and `bot_turn` keeps
/// `<|bot-message|>`; the stripped variants end right before them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnSubstrings {
    pub user_turn: String,
    pub bot_turn: String,
    pub user_turn_stripped: String,
    pub bot_turn_stripped: String,
}

impl TurnSubstrings {
    /// Render a user row for `message` at turn index `round`.
    pub fn render_user(&self, message: &str, round: usize) -> String {
        replace_all(
            &self.user_turn,
            &[(USER_MESSAGE, message.trim()), (ROUND, &round.to_string())],
        )
    }

    /// Render a complete bot row for `reply`.
    pub fn render_bot(&self, reply: &str) -> String {
        self.bot_turn.replace(BOT_MESSAGE, reply.trim())
    }
}

/// Apply `(placeholder, value)` pairs in order.
pub fn replace_all(text: &str, replacements: &[(&str, &str)]) -> String {
    replacements
        .iter()
        .fold(text.to_string(), |acc, (from, to)| acc.replace(from, to))
}

/// Turn literal two-character `\n` escapes into real newlines.
pub fn unescape_newlines(template: &str) -> String {
    template.replace("\\n", "\n")
}

/// The template text for the requested convention, still escaped.
pub(crate) fn raw_template(state: &ChatState, instruct: bool) -> &str {
    if !instruct {
        CHAT_TURN_TEMPLATE
    } else if state.turn_template.is_empty() {
        DEFAULT_INSTRUCT_TEMPLATE
    } else {
        &state.turn_template
    }
}

/// Split the active turn template into its user and bot fragments with the
/// participant names substituted.
pub fn get_turn_substrings(state: &ChatState, instruct: bool) -> Result<TurnSubstrings, ConfigError> {
    let template = unescape_newlines(raw_template(state, instruct));

    let (user_name, bot_name) = if instruct {
        (state.name1_instruct.trim(), state.name2_instruct.trim())
    } else {
        (state.name1.trim(), state.name2.trim())
    };

    let mut parts = template.split(BOT_TAG);
    let user_part = parts.next().unwrap_or_default();
    let bot_part = parts.next().ok_or_else(|| missing(BOT_TAG, &template))?;

    let Some((user_stripped, _)) = user_part.split_once(USER_MESSAGE) else {
        return Err(missing(USER_MESSAGE, &template));
    };
    let Some((bot_stripped, _)) = bot_part.split_once(BOT_MESSAGE) else {
        return Err(missing(BOT_MESSAGE, &template));
    };

    let names = [(USER_TAG, user_name), (BOT_TAG, bot_name)];
    Ok(TurnSubstrings {
        user_turn: replace_all(user_part, &names),
        bot_turn: replace_all(&format!("{BOT_TAG}{bot_part}"), &names),
        user_turn_stripped: replace_all(user_stripped, &names),
        bot_turn_stripped: replace_all(&format!("{BOT_TAG}{bot_stripped}"), &names),
    })
}

fn missing(placeholder: &'static str, template: &str) -> ConfigError {
    ConfigError::MissingPlaceholder {
        placeholder,
        template: template.to_string(),
    }
}
