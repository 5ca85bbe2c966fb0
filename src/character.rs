// Character cards: name placeholders, Pygmalion-style persona context and
// loading a card into the chat state.

use serde::Deserialize;

use crate::chat::templates::replace_all;
use crate::config::ChatState;
use crate::error::ConfigError;
use crate::log_info;

/// Substitute `{{user}}`/`<USER>` with `name1` and `{{char}}`/`<BOT>` with
/// `name2`.
pub fn replace_character_names(text: &str, name1: &str, name2: &str) -> String {
    replace_all(
        text,
        &[("{{user}}", name1), ("{{char}}", name2), ("<USER>", name1), ("<BOT>", name2)],
    )
}

/// Context block for cards that describe the character by persona and
/// scenario instead of a ready-made context.
pub fn build_pygmalion_style_context(char_name: &str, char_persona: &str, world_scenario: &str) -> String {
    let mut context = String::new();
    if !char_persona.is_empty() {
        context.push_str(&format!("{char_name}'s Persona: {char_persona}\n"));
    }
    if !world_scenario.is_empty() {
        context.push_str(&format!("Scenario: {world_scenario}\n"));
    }
    format!("{}\n<START>\n", context.trim())
}

/// Character definition as stored in JSON or YAML character files. Both the plain
/// (`context`/`greeting`) and the Pygmalion (`char_persona`/`char_greeting`)
/// layouts are accepted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CharacterCard {
    pub name: String,
    pub bot: String,
    #[serde(rename = "<|bot|>")]
    pub bot_tag: String,
    pub char_name: String,
    pub your_name: String,
    pub user: String,
    #[serde(rename = "<|user|>")]
    pub user_tag: String,
    pub context: Option<String>,
    pub greeting: Option<String>,
    pub example_dialogue: Option<String>,
    pub char_persona: Option<String>,
    pub char_greeting: Option<String>,
    pub world_scenario: String,
    pub turn_template: Option<String>,
}

impl CharacterCard {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load the card into `state`. Instruct cards fill the instruct names and
    /// context; other cards fill the chat names, context and greeting.
    pub fn apply_to(&self, state: &mut ChatState) {
        let instruct = state.is_instruct();
        let (mut name1, mut name2) = if instruct {
            (state.name1_instruct.clone(), state.name2_instruct.clone())
        } else {
            (state.name1.clone(), state.name2.clone())
        };
        if let Some(name) = first_non_empty(&[&self.name, &self.bot, &self.bot_tag, &self.char_name]) {
            name2 = name.to_string();
        }
        if let Some(name) = first_non_empty(&[&self.your_name, &self.user, &self.user_tag]) {
            name1 = name.to_string();
        }
        let names = |text: &str| replace_character_names(text, &name1, &name2);

        let mut greeting = self.greeting.as_deref();
        let mut context = match (&self.context, &self.char_persona) {
            (Some(context), _) if instruct => names(context.as_str()),
            (Some(context), _) => format!("{}\n\n", names(context.as_str()).trim()),
            (None, Some(persona)) => {
                greeting = self.char_greeting.as_deref();
                build_pygmalion_style_context(&self.char_name, &names(persona.as_str()), &names(self.world_scenario.as_str()))
            }
            (None, None) => String::new(),
        };
        if let Some(example) = &self.example_dialogue {
            context.push_str(&format!("{}\n", names(example.as_str()).trim()));
        }

        log_info!("Loaded character {:?} (user {:?})", name2, name1);
        state.turn_template = self.turn_template.clone().unwrap_or_default();
        if instruct {
            state.context_instruct = context;
            state.name1_instruct = name1;
            state.name2_instruct = name2;
        } else {
            state.greeting = greeting.map(names).unwrap_or_default();
            state.context = context;
            state.name1 = name1;
            state.name2 = name2;
        }
    }
}

fn first_non_empty<'a>(candidates: &[&'a String]) -> Option<&'a str> {
    candidates.iter().copied().find(|s| !s.is_empty()).map(String::as_str)
}
