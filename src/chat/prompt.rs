use super::engine::TokenCounter;
use super::extensions::ChatExtensions;
use super::templates::{get_turn_substrings, TurnSubstrings};
use crate::config::{ChatMode, ChatState};
use crate::error::ConfigError;
use crate::transcript::{Turn, GREETING_SENTINEL};
use crate::{log_debug, log_warn};

/// Marks where the flattened dialogue goes inside the wrapper.
pub const PROMPT_PLACEHOLDER: &str = "<|prompt|>";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromptOptions {
    /// Render the newest reply as an open turn so generation extends it.
    pub continue_last: bool,
    /// Generate on behalf of the user side instead of the bot.
    pub impersonate: bool,
    /// Keep the rows that were concatenated into the prompt.
    pub also_return_rows: bool,
}

/// An assembled prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPrompt {
    pub prompt: String,
    /// Outer text with a single `<|prompt|>` placeholder.
    pub wrapper: String,
    /// Rows in prompt order; row 0 is the context block.
    pub rows: Option<Vec<String>>,
}

impl ChatPrompt {
    /// Rebuild the prompt from wrapper and rows.
    pub fn reassemble(&self) -> Option<String> {
        self.rows.as_ref().map(|rows| fill_wrapper(&self.wrapper, rows))
    }
}

fn fill_wrapper(wrapper: &str, rows: &[String]) -> String {
    wrapper.replace(PROMPT_PLACEHOLDER, &rows.concat())
}

/// Flatten `history` plus the new user input into a prompt that fits the
/// token budget.
///
/// Turns are added newest first for as long as the prompt measures below the
/// budget. Rows are then evicted oldest first (the context block in row 0 is
/// kept) until the prompt fits or only the rows around the generation point
/// remain. In that last case the prompt is returned even though it is over
/// budget.
pub fn generate_chat_prompt(
    user_input: &str,
    state: &ChatState,
    history: &[Turn],
    counter: &dyn TokenCounter,
    extensions: &dyn ChatExtensions,
    options: &PromptOptions,
) -> Result<ChatPrompt, ConfigError> {
    let is_instruct = state.is_instruct();
    let max_length = counter
        .max_prompt_length(state)
        .min(state.chat_prompt_size.saturating_sub(state.soft_prompt_length));

    let substrings = get_turn_substrings(state, is_instruct)?;
    let wrapper = build_wrapper(state, &substrings, extensions, options)?;
    let measure = |rows_text: &str| counter.encoded_length(&wrapper.replace(PROMPT_PLACEHOLDER, rows_text));

    let head = if is_instruct {
        state.context_instruct.clone()
    } else {
        format!("{}\n", state.context.trim())
    };

    // Rendered turns, newest first; each turn's rows stay in prompt order.
    let candidates: Vec<Vec<String>> = history
        .iter()
        .enumerate()
        .rev()
        .map(|(round, turn)| render_turn(&substrings, turn, round, options.continue_last && round + 1 == history.len()))
        .collect();

    let mut included = 0;
    let mut history_text = String::new();
    while included < candidates.len() && measure(&format!("{head}{history_text}")) < max_length {
        history_text.insert_str(0, &candidates[included].concat());
        included += 1;
    }

    let mut rows = vec![head];
    rows.extend(candidates[..included].iter().rev().flatten().cloned());

    let mut min_rows = 3;
    if options.impersonate {
        if state.mode == ChatMode::ChatInstruct {
            min_rows = 1;
        } else {
            min_rows = 2;
            rows.push(substrings.user_turn_stripped.trim_end_matches(' ').to_string());
        }
    } else if !options.continue_last {
        if !user_input.is_empty() {
            rows.push(substrings.render_user(user_input, history.len()));
        }
        if state.mode != ChatMode::ChatInstruct {
            rows.push(extensions.transform_bot_prefix(substrings.bot_turn_stripped.trim_end_matches(' ')));
        }
    }

    while rows.len() > min_rows && measure(&rows.concat()) >= max_length {
        rows.remove(1);
    }

    let prompt = fill_wrapper(&wrapper, &rows);
    let length = counter.encoded_length(&prompt);
    if length >= max_length {
        log_warn!(
            "Prompt still measures {} tokens with only {} required rows left (budget {})",
            length,
            rows.len(),
            max_length
        );
    }
    log_debug!(
        "Built {:?} prompt: {} of {} turns, {} rows, {} tokens (budget {})",
        state.mode,
        included,
        history.len(),
        rows.len(),
        length,
        max_length
    );

    Ok(ChatPrompt {
        prompt,
        wrapper,
        rows: options.also_return_rows.then_some(rows),
    })
}

/// In chat-instruct mode the whole dialogue becomes the user message of a
/// single instruct turn that asks for the next reply.
fn build_wrapper(
    state: &ChatState,
    substrings: &TurnSubstrings,
    extensions: &dyn ChatExtensions,
    options: &PromptOptions,
) -> Result<String, ConfigError> {
    if state.mode != ChatMode::ChatInstruct {
        return Ok(PROMPT_PLACEHOLDER.to_string());
    }

    let instruct = get_turn_substrings(state, true)?;
    let character = if options.impersonate { &state.name1 } else { &state.name2 };
    let generation_prefix = if options.impersonate {
        substrings.user_turn_stripped.trim_end_matches(' ').to_string()
    } else {
        extensions.transform_bot_prefix(substrings.bot_turn_stripped.trim_end_matches(' '))
    };

    Ok(format!(
        "{}{}Continue the chat dialogue below. Write a single reply for the character \"{}\".\n\n{}\n{}{}",
        state.context_instruct,
        instruct.user_turn_stripped,
        character,
        PROMPT_PLACEHOLDER,
        instruct.bot_turn_stripped,
        generation_prefix
    ))
}

fn render_turn(substrings: &TurnSubstrings, turn: &Turn, round: usize, open_reply: bool) -> Vec<String> {
    let exchange = &turn.internal;
    let mut rows = Vec::with_capacity(2);
    if !exchange.user.is_empty() && exchange.user != GREETING_SENTINEL {
        rows.push(substrings.render_user(&exchange.user, round));
    }
    if open_reply {
        rows.push(format!("{}{}", substrings.bot_turn_stripped, exchange.bot.trim()));
    } else {
        rows.push(substrings.render_bot(&exchange.bot));
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::extensions::NoExtensions;

    /// One token per character, fixed budget.
    struct CharCounter {
        max: usize,
    }

    impl TokenCounter for CharCounter {
        fn encoded_length(&self, text: &str) -> usize {
            text.chars().count()
        }

        fn max_prompt_length(&self, _state: &ChatState) -> usize {
            self.max
        }
    }

    struct ShoutingPrefix;

    impl ChatExtensions for ShoutingPrefix {
        fn transform_bot_prefix(&self, prefix: &str) -> String {
            prefix.to_uppercase()
        }
    }

    fn bob_state(context: &str) -> ChatState {
        ChatState {
            name1: "You".to_string(),
            name2: "Bob".to_string(),
            context: context.to_string(),
            ..ChatState::default()
        }
    }

    fn history(pairs: &[(&str, &str)]) -> Vec<Turn> {
        pairs.iter().map(|(u, b)| Turn::from_pair(*u, *b)).collect()
    }

    fn with_rows() -> PromptOptions {
        PromptOptions {
            also_return_rows: true,
            ..PromptOptions::default()
        }
    }

    fn build(input: &str, state: &ChatState, turns: &[Turn], budget: usize, options: PromptOptions) -> ChatPrompt {
        generate_chat_prompt(input, state, turns, &CharCounter { max: budget }, &NoExtensions, &options).unwrap()
    }

    #[test]
    fn test_first_message_leaves_bot_turn_open() {
        let result = build("Hi", &bob_state("You are Bob."), &[], 10_000, PromptOptions::default());
        assert!(result.prompt.ends_with("You: Hi\nBob:"));
        assert_eq!(result.prompt, "You are Bob.\nYou: Hi\nBob:");
        assert!(result.rows.is_none());
    }

    #[test]
    fn test_rows_reassemble_to_prompt() {
        let turns = history(&[("u0", "b0"), ("u1", "b1")]);
        let result = build("Hi", &bob_state("Ctx"), &turns, 10_000, with_rows());
        assert_eq!(result.reassemble().as_deref(), Some(result.prompt.as_str()));
        assert_eq!(
            result.rows.unwrap(),
            vec!["Ctx\n", "You: u0\n", "Bob: b0\n", "You: u1\n", "Bob: b1\n", "You: Hi\n", "Bob:"]
        );
    }

    #[test]
    fn test_oldest_rows_are_evicted_first() {
        let turns = history(&[("u0", "b0"), ("u1", "b1"), ("u2", "b2")]);
        let result = build("Hi", &bob_state("Ctx"), &turns, 40, with_rows());
        assert_eq!(result.prompt, "Ctx\nYou: u2\nBob: b2\nYou: Hi\nBob:");
        assert_eq!(result.rows.unwrap().len(), 5);
    }

    #[test]
    fn test_budget_floor_keeps_required_rows() {
        let turns = history(&[("u0", "b0"), ("u1", "b1")]);
        let result = build("Hi", &bob_state("Ctx"), &turns, 1, with_rows());
        assert_eq!(result.prompt, "Ctx\nYou: Hi\nBob:");
        assert_eq!(result.rows.unwrap().len(), 3);
    }

    #[test]
    fn test_larger_budget_never_keeps_fewer_rows() {
        let turns = history(&[("u0", "b0"), ("u1", "b1"), ("u2", "b2"), ("u3", "b3")]);
        let state = bob_state("Ctx");
        let mut previous = 0;
        for budget in 0..120 {
            let rows = build("Hi", &state, &turns, budget, with_rows()).rows.unwrap().len();
            assert!(rows >= previous, "budget {budget} kept {rows} rows, fewer than {previous}");
            previous = rows;
        }
        assert_eq!(previous, 11);
    }

    #[test]
    fn test_soft_prompt_reduces_budget() {
        let turns = history(&[("u0", "b0"), ("u1", "b1"), ("u2", "b2")]);
        let state = ChatState {
            chat_prompt_size: 64,
            soft_prompt_length: 24,
            ..bob_state("Ctx")
        };
        let result = build("Hi", &state, &turns, 10_000, PromptOptions::default());
        assert_eq!(result.prompt, "Ctx\nYou: u2\nBob: b2\nYou: Hi\nBob:");
    }

    #[test]
    fn test_continue_renders_open_reply() {
        let turns = history(&[("u0", "b0"), ("Hi", "Part of a ")]);
        let options = PromptOptions {
            continue_last: true,
            ..with_rows()
        };
        let result = build("", &bob_state("Ctx"), &turns, 10_000, options);
        assert_eq!(result.prompt, "Ctx\nYou: u0\nBob: b0\nYou: Hi\nBob: Part of a");
        assert_eq!(result.rows.unwrap().len(), 5);
    }

    #[test]
    fn test_impersonate_leaves_user_turn_open() {
        let turns = history(&[("u0", "b0")]);
        let options = PromptOptions {
            impersonate: true,
            ..with_rows()
        };
        let result = build("ignored", &bob_state("Ctx"), &turns, 10_000, options);
        assert_eq!(result.prompt, "Ctx\nYou: u0\nBob: b0\nYou:");

        let result = build("ignored", &bob_state("Ctx"), &turns, 1, options);
        assert_eq!(result.rows.unwrap(), vec!["Ctx\n", "You:"]);
    }

    #[test]
    fn test_greeting_has_no_user_row() {
        let turns = history(&[(GREETING_SENTINEL, "Hello!")]);
        let result = build("Hi", &bob_state("Ctx"), &turns, 10_000, PromptOptions::default());
        assert_eq!(result.prompt, "Ctx\nBob: Hello!\nYou: Hi\nBob:");
    }

    #[test]
    fn test_empty_input_adds_only_bot_prefix() {
        let turns = history(&[("u0", "b0")]);
        let result = build("", &bob_state("Ctx"), &turns, 10_000, PromptOptions::default());
        assert_eq!(result.prompt, "Ctx\nYou: u0\nBob: b0\nBob:");
    }

    #[test]
    fn test_bot_prefix_transform() {
        let state = bob_state("Ctx");
        let result = generate_chat_prompt(
            "Hi",
            &state,
            &[],
            &CharCounter { max: 10_000 },
            &ShoutingPrefix,
            &PromptOptions::default(),
        )
        .unwrap();
        assert_eq!(result.prompt, "Ctx\nYou: Hi\nBOB:");
    }

    #[test]
    fn test_instruct_mode() {
        let state = ChatState {
            mode: ChatMode::Instruct,
            context_instruct: "Below is an instruction.\n\n".to_string(),
            name1_instruct: "### Instruction:".to_string(),
            name2_instruct: "### Response:".to_string(),
            turn_template: r"<|user|>\n<|user-message|>\n\n<|bot|>\n<|bot-message|>\n\n".to_string(),
            ..ChatState::default()
        };
        let result = build("Hi", &state, &[], 10_000, PromptOptions::default());
        assert_eq!(
            result.prompt,
            "Below is an instruction.\n\n### Instruction:\nHi\n\n### Response:\n"
        );
    }

    #[test]
    fn test_chat_instruct_wrapper() {
        let state = ChatState {
            mode: ChatMode::ChatInstruct,
            name1_instruct: "USER:".to_string(),
            name2_instruct: "ASSISTANT:".to_string(),
            ..bob_state("You are Bob.")
        };
        let result = build("Hi", &state, &[], 10_000, with_rows());
        assert_eq!(
            result.prompt,
            "USER:\nContinue the chat dialogue below. Write a single reply for the character \"Bob\".\n\n\
             You are Bob.\nYou: Hi\n\nASSISTANT:\nBob:"
        );
        assert_eq!(result.rows.as_ref().unwrap().len(), 2);
        assert_eq!(result.reassemble().as_deref(), Some(result.prompt.as_str()));

        let options = PromptOptions {
            impersonate: true,
            ..PromptOptions::default()
        };
        let result = build("", &state, &[], 10_000, options);
        assert!(result.wrapper.contains("for the character \"You\""));
        assert!(result.prompt.ends_with("ASSISTANT:\nYou:"));
    }

    #[test]
    fn test_chat_instruct_impersonation_keeps_only_context_when_tight() {
        let state = ChatState {
            mode: ChatMode::ChatInstruct,
            name1_instruct: "USER:".to_string(),
            name2_instruct: "ASSISTANT:".to_string(),
            ..bob_state("You are Bob.")
        };
        let turns = history(&[("u0", "b0"), ("u1", "b1")]);
        let options = PromptOptions {
            impersonate: true,
            also_return_rows: true,
            ..PromptOptions::default()
        };

        let result = build("", &state, &turns, 1, options);
        assert_eq!(result.rows.as_deref(), Some(&["You are Bob.\n".to_string()][..]));
        assert!(result.wrapper.ends_with("ASSISTANT:\nYou:"));
        assert!(result.prompt.ends_with("ASSISTANT:\nYou:"));
        assert_eq!(result.reassemble().as_deref(), Some(result.prompt.as_str()));

        // Wrapper plus context alone measure `floor`; one more token still
        // leaves no room for a turn.
        let floor = result.prompt.chars().count();
        let result = build("", &state, &turns, floor + 1, options);
        assert_eq!(result.rows.unwrap().len(), 1);

        // Room for the newest turn only.
        let result = build("", &state, &turns, floor + 17, options);
        assert_eq!(result.rows.unwrap(), vec!["You are Bob.\n", "You: u1\n", "Bob: b1\n"]);
    }
}
