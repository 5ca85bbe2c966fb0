// Stop sequences for the current speaker and reply extraction from a
// (possibly still streaming) generation.

use std::iter::Peekable;
use std::str::Chars;

use super::templates::{raw_template, replace_all, unescape_newlines, BOT_MESSAGE, BOT_TAG, USER_MESSAGE, USER_TAG};
use crate::config::{ChatMode, ChatState};
use crate::error::ConfigError;

/// Result of trimming a reply against the stop sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedReply {
    /// Text that may be shown to the user.
    pub text: String,
    /// Whether the start of the next turn was seen.
    pub boundary_found: bool,
}

/// Strings that mark the end of the current speaker's turn, followed by the
/// user's custom stop strings.
pub fn get_stopping_strings(state: &ChatState) -> Result<Vec<String>, ConfigError> {
    let mut stopping_strings = if state.mode == ChatMode::Instruct {
        instruct_stopping_strings(state)?
    } else {
        vec![format!("\n{}:", state.name1), format!("\n{}:", state.name2)]
    };

    stopping_strings.extend(parse_custom_stopping_strings(&state.custom_stopping_strings)?);
    Ok(stopping_strings)
}

/// "Bot turn after a user message" and "user turn after a bot message",
/// cut from the raw instruct template.
fn instruct_stopping_strings(state: &ChatState) -> Result<Vec<String>, ConfigError> {
    let template = raw_template(state, true);
    let missing = |placeholder| ConfigError::MissingPlaceholder {
        placeholder,
        template: template.to_string(),
    };

    let after_user = template.split(USER_MESSAGE).nth(1).ok_or_else(|| missing(USER_MESSAGE))?;
    let after_bot = template.split(BOT_MESSAGE).nth(1).ok_or_else(|| missing(BOT_MESSAGE))?;
    let user_to_bot = format!("{}{BOT_TAG}", after_user.split(BOT_TAG).next().unwrap_or_default());
    let bot_to_user = format!("{after_bot}{USER_TAG}");

    let names = [
        (USER_TAG, state.name1_instruct.as_str()),
        (BOT_TAG, state.name2_instruct.as_str()),
    ];
    Ok([user_to_bot, bot_to_user]
        .iter()
        .map(|s| unescape_newlines(replace_all(s, &names).trim_end_matches(' ')))
        .collect())
}

/// Parse a comma separated list of quoted string literals such as
/// `"\n###", 'END'`. Blank input yields an empty list. Adjacent literals
/// (`'a' 'b'`) join into one string.
pub fn parse_custom_stopping_strings(input: &str) -> Result<Vec<String>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidStopStrings {
        input: input.to_string(),
        reason,
    };

    let mut chars = input.chars().peekable();
    let mut strings = Vec::new();

    loop {
        skip_whitespace(&mut chars);
        match chars.next() {
            None => break,
            Some(quote @ ('"' | '\'')) => {
                let mut value = parse_literal(&mut chars, quote).map_err(invalid)?;
                loop {
                    skip_whitespace(&mut chars);
                    let Some(quote) = chars.next_if(|c| matches!(c, '"' | '\'')) else {
                        break;
                    };
                    value.push_str(&parse_literal(&mut chars, quote).map_err(invalid)?);
                }
                strings.push(value);
            }
            Some(other) => return Err(invalid(format!("expected a quoted string, found {other:?}"))),
        }

        match chars.next() {
            None => break,
            Some(',') => continue,
            Some(other) => return Err(invalid(format!("expected ',' between strings, found {other:?}"))),
        }
    }

    Ok(strings)
}

fn skip_whitespace(chars: &mut Peekable<Chars<'_>>) {
    while chars.next_if(|c| c.is_whitespace()).is_some() {}
}

fn parse_literal(chars: &mut Peekable<Chars<'_>>, quote: char) -> Result<String, String> {
    let mut value = String::new();
    loop {
        match chars.next() {
            None | Some('\n') => return Err("unterminated string literal".to_string()),
            Some(c) if c == quote => return Ok(value),
            Some('\\') => match chars.next() {
                None => return Err("unterminated string literal".to_string()),
                // Escaped line break continues the literal.
                Some('\n') => {}
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some('r') => value.push('\r'),
                Some('a') => value.push('\x07'),
                Some('b') => value.push('\x08'),
                Some('f') => value.push('\x0c'),
                Some('v') => value.push('\x0b'),
                Some('\\') => value.push('\\'),
                Some('\'') => value.push('\''),
                Some('"') => value.push('"'),
                Some(digit @ '0'..='7') => value.push(parse_octal_escape(chars, digit)?),
                Some('x') => value.push(parse_hex_escape(chars, 2)?),
                Some('u') if chars.peek() == Some(&'{') => value.push(parse_braced_escape(chars)?),
                Some('u') => value.push(parse_hex_escape(chars, 4)?),
                Some('U') => value.push(parse_hex_escape(chars, 8)?),
                // Unknown escapes are kept verbatim.
                Some(other) => {
                    value.push('\\');
                    value.push(other);
                }
            },
            Some(c) => value.push(c),
        }
    }
}

/// `\o`, `\oo` or `\ooo`; `first` is already consumed.
fn parse_octal_escape(chars: &mut Peekable<Chars<'_>>, first: char) -> Result<char, String> {
    let mut digits = String::from(first);
    while digits.len() < 3 {
        match chars.next_if(|c| c.is_digit(8)) {
            Some(c) => digits.push(c),
            None => break,
        }
    }
    u32::from_str_radix(&digits, 8)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| format!("invalid octal escape {digits:?}"))
}

fn parse_hex_escape(chars: &mut Peekable<Chars<'_>>, digits: usize) -> Result<char, String> {
    let mut hex = String::new();
    while hex.len() < digits {
        match chars.next_if(char::is_ascii_hexdigit) {
            Some(c) => hex.push(c),
            None => return Err(format!("truncated hex escape {hex:?}, expected {digits} digits")),
        }
    }
    hex_to_char(&hex)
}

/// `\u{...}` with one to six hex digits.
fn parse_braced_escape(chars: &mut Peekable<Chars<'_>>) -> Result<char, String> {
    chars.next();
    let mut hex = String::new();
    loop {
        match chars.next() {
            Some('}') if !hex.is_empty() => return hex_to_char(&hex),
            Some(c) if c.is_ascii_hexdigit() && hex.len() < 6 => hex.push(c),
            _ => return Err(format!("malformed \\u{{...}} escape after {hex:?}")),
        }
    }
}

fn hex_to_char(hex: &str) -> Result<char, String> {
    u32::from_str_radix(hex, 16)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| format!("invalid escape value {hex:?}"))
}

/// Cut `reply` at the end of the current turn.
///
/// With `stop_at_newline` only the first line is kept. Otherwise the reply is
/// truncated at each stop string it contains; when none is complete yet, a
/// trailing partial stop string is removed so a streaming display never shows
/// half of the next speaker's label.
pub fn extract_message_from_reply(
    reply: &str,
    stopping_strings: &[String],
    stop_at_newline: bool,
) -> ExtractedReply {
    if stop_at_newline {
        let mut lines = reply.split('\n');
        let first = lines.next().unwrap_or_default().trim().to_string();
        return ExtractedReply {
            text: first,
            boundary_found: lines.next().is_some(),
        };
    }

    let mut text = reply;
    let mut boundary_found = false;
    for stop in stopping_strings.iter().filter(|s| !s.is_empty()) {
        if let Some(idx) = text.find(stop.as_str()) {
            text = &text[..idx];
            boundary_found = true;
        }
    }

    if !boundary_found {
        // Only the first partial match is stripped.
        if let Some(partial) = stopping_strings.iter().find_map(|stop| partial_stop_suffix(text, stop)) {
            text = &text[..text.len() - partial];
        }
    }

    ExtractedReply {
        text: text.to_string(),
        boundary_found,
    }
}

/// Byte length of the longest proper prefix of `stop` that `text` ends with.
fn partial_stop_suffix(text: &str, stop: &str) -> Option<usize> {
    stop.char_indices()
        .map(|(idx, _)| idx)
        .filter(|&idx| idx > 0)
        .rev()
        .find(|&idx| text.ends_with(&stop[..idx]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_partial_stop_string_is_stripped() {
        let result = extract_message_from_reply("Hello there\nAl", &stops(&["\nAlice:"]), false);
        assert_eq!(result.text, "Hello there");
        assert!(!result.boundary_found);
    }

    #[test]
    fn test_full_stop_string_found() {
        let result = extract_message_from_reply("Hello there\nAlice:", &stops(&["\nAlice:"]), false);
        assert_eq!(result.text, "Hello there");
        assert!(result.boundary_found);
    }

    #[test]
    fn test_text_after_stop_string_is_dropped() {
        let result = extract_message_from_reply("Sure.\nYou: and then\nBob: more", &stops(&["\nYou:", "\nBob:"]), false);
        assert_eq!(result.text, "Sure.");
        assert!(result.boundary_found);
    }

    #[test]
    fn test_earliest_stop_string_wins() {
        let result = extract_message_from_reply("a\nBob: b\nYou: c", &stops(&["\nYou:", "\nBob:"]), false);
        assert_eq!(result.text, "a");
        assert!(result.boundary_found);
    }

    #[test]
    fn test_only_first_partial_match_is_removed() {
        // "x\nY" matches a prefix of both; the first stop string in order decides.
        let result = extract_message_from_reply("x\nY", &stops(&["\nYou:", "\nYa:"]), false);
        assert_eq!(result.text, "x");

        let result = extract_message_from_reply("ends with <", &stops(&["\nYou:", "</s>"]), false);
        assert_eq!(result.text, "ends with ");
    }

    #[test]
    fn test_no_match() {
        let result = extract_message_from_reply("Hello, I am", &stops(&["\nYou:"]), false);
        assert_eq!(result.text, "Hello, I am");
        assert!(!result.boundary_found);
    }

    #[test]
    fn test_empty_stop_string_is_ignored() {
        let result = extract_message_from_reply("Hello", &stops(&["", "\nYou:"]), false);
        assert_eq!(result.text, "Hello");
        assert!(!result.boundary_found);
    }

    #[test]
    fn test_partial_match_respects_char_boundaries() {
        let result = extract_message_from_reply("café\nJö", &stops(&["\nJörg:"]), false);
        assert_eq!(result.text, "café");
    }

    #[test]
    fn test_stop_at_newline() {
        let result = extract_message_from_reply("Hi\nExtra", &[], true);
        assert_eq!(result, ExtractedReply { text: "Hi".to_string(), boundary_found: true });

        let result = extract_message_from_reply("Hi", &[], true);
        assert_eq!(result, ExtractedReply { text: "Hi".to_string(), boundary_found: false });
    }

    #[test]
    fn test_chat_mode_stopping_strings() {
        let state = ChatState {
            name1: "You".to_string(),
            name2: "Bob".to_string(),
            ..ChatState::default()
        };
        assert_eq!(get_stopping_strings(&state).unwrap(), stops(&["\nYou:", "\nBob:"]));
    }

    #[test]
    fn test_instruct_mode_stopping_strings() {
        let state = ChatState {
            mode: ChatMode::Instruct,
            name1_instruct: "### Human:".to_string(),
            name2_instruct: "### Assistant:".to_string(),
            turn_template: r"<|user|> <|user-message|>\n<|bot|> <|bot-message|>\n".to_string(),
            ..ChatState::default()
        };
        assert_eq!(
            get_stopping_strings(&state).unwrap(),
            stops(&["\n### Assistant:", "\n### Human:"])
        );
    }

    #[test]
    fn test_instruct_default_template_stopping_strings() {
        let state = ChatState {
            mode: ChatMode::Instruct,
            name1_instruct: "USER:".to_string(),
            name2_instruct: "ASSISTANT:".to_string(),
            ..ChatState::default()
        };
        assert_eq!(get_stopping_strings(&state).unwrap(), stops(&["\nASSISTANT:", "\nUSER:"]));
    }

    #[test]
    fn test_custom_stopping_strings_are_appended() {
        let state = ChatState {
            name1: "You".to_string(),
            name2: "Bob".to_string(),
            custom_stopping_strings: r#""\n###", 'END',"#.to_string(),
            ..ChatState::default()
        };
        assert_eq!(
            get_stopping_strings(&state).unwrap(),
            stops(&["\nYou:", "\nBob:", "\n###", "END"])
        );
    }

    #[test]
    fn test_parse_custom_stopping_strings() {
        assert!(parse_custom_stopping_strings("").unwrap().is_empty());
        assert!(parse_custom_stopping_strings("   ").unwrap().is_empty());
        assert_eq!(
            parse_custom_stopping_strings(r#"'it\'s', "say \"hi\"", "\x41é""#).unwrap(),
            stops(&["it's", "say \"hi\"", "Aé"])
        );
        assert_eq!(parse_custom_stopping_strings(r"'a\qb'").unwrap(), stops(&["a\\qb"]));
    }

    #[test]
    fn test_parse_custom_stopping_strings_escapes() {
        let cases = [
            (r"'\012'", "\n"),
            (r"'\0'", "\0"),
            (r"'\101\1012'", "AA2"),
            (r"'\a\b\f\v'", "\x07\x08\x0c\x0b"),
            (r#""\u{41}\u{1F600}""#, "A\u{1F600}"),
            (r"'\u00e9'", "é"),
            (r"'\U0001F600'", "\u{1F600}"),
            ("'line\\\nbreak'", "linebreak"),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_custom_stopping_strings(input).unwrap(), stops(&[expected]), "{input:?}");
        }
    }

    #[test]
    fn test_adjacent_literals_join() {
        assert_eq!(
            parse_custom_stopping_strings(r#"'a' "b", 'c'  'd',"#).unwrap(),
            stops(&["ab", "cd"])
        );
    }

    #[test]
    fn test_parse_custom_stopping_strings_rejects_malformed() {
        for bad in ["END", "'open", "'a' b", ",'a'", "'a',,'b'", r"'\x4'", r"'\x4g'", r"'\u{}'", r"'\u{110000}'", r"'\u{41'", r"'\U0011000'"] {
            let result = parse_custom_stopping_strings(bad);
            assert!(
                matches!(result, Err(ConfigError::InvalidStopStrings { .. })),
                "{bad:?} should be rejected"
            );
        }
    }
}
