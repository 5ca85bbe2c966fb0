// Reply generation: drives the inference engine, trims each partial reply at
// the next speaker's label and publishes transcript snapshots while the reply
// grows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::stream::{Stream, StreamExt};
use regex::{NoExpand, Regex};

use super::engine::{ApproxTokenCounter, EngineRequest, InferenceEngine, TokenCounter};
use super::extensions::{ChatExtensions, NoExtensions};
use super::prompt::{generate_chat_prompt, ChatPrompt, PromptOptions};
use super::stop_conditions::{extract_message_from_reply, get_stopping_strings};
use crate::config::ChatState;
use crate::error::{ConfigError, GenerationError};
use crate::logger::preview;
use crate::transcript::{Exchange, Transcript, Turn};
use crate::{log_debug, log_error, log_info, log_warn};

/// Shown as the reply while the first fragment is pending.
pub const PROCESSING_MESSAGE: &str = "*Is typing...*";

/// Set to `true` to stop an in-flight generation after the current fragment.
pub type CancellationFlag = Arc<AtomicBool>;

lazy_static::lazy_static! {
    static ref USER_PLACEHOLDER: Regex = Regex::new(r"(<USER>|<user>|\{\{user\}\})").expect("valid regex");
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyKind {
    /// Answer a new user message.
    #[default]
    Generate,
    /// Drop the newest reply and answer the same message again.
    Regenerate,
    /// Extend the newest reply in place.
    Continue,
}

#[derive(Clone)]
pub struct ChatGenerator {
    engine: Arc<dyn InferenceEngine>,
    counter: Arc<dyn TokenCounter>,
    extensions: Arc<dyn ChatExtensions>,
}

impl ChatGenerator {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        counter: Arc<dyn TokenCounter>,
        extensions: Arc<dyn ChatExtensions>,
    ) -> Self {
        Self {
            engine,
            counter,
            extensions,
        }
    }

    /// Generator with the approximate token counter and no extensions.
    pub fn with_engine(engine: Arc<dyn InferenceEngine>) -> Self {
        Self::new(engine, Arc::new(ApproxTokenCounter::default()), Arc::new(NoExtensions))
    }

    /// Prompt the engine receives for a `kind` request on `transcript`,
    /// without touching it.
    pub fn chat_prompt(
        &self,
        text: &str,
        state: &ChatState,
        transcript: &Transcript,
        kind: ReplyKind,
        also_return_rows: bool,
    ) -> Result<ChatPrompt, ConfigError> {
        let text = self.request_text(text, transcript, kind);
        self.build_prompt(&text, state, transcript, kind, also_return_rows)
    }

    /// Prompt used to draft the user's next message.
    pub fn impersonation_prompt(
        &self,
        state: &ChatState,
        transcript: &Transcript,
        also_return_rows: bool,
    ) -> Result<ChatPrompt, ConfigError> {
        let options = PromptOptions {
            impersonate: true,
            also_return_rows,
            ..PromptOptions::default()
        };
        generate_chat_prompt(
            "",
            state,
            transcript.turns(),
            self.counter.as_ref(),
            self.extensions.as_ref(),
            &options,
        )
    }

    /// Internal user text the reply answers: the transformed new message, or
    /// the newest turn's message when reworking a reply.
    fn request_text(&self, text: &str, transcript: &Transcript, kind: ReplyKind) -> String {
        match kind {
            ReplyKind::Generate => self.extensions.transform_input(text),
            ReplyKind::Regenerate | ReplyKind::Continue => {
                transcript.last().map(|t| t.internal.user.clone()).unwrap_or_default()
            }
        }
    }

    fn build_prompt(
        &self,
        text: &str,
        state: &ChatState,
        transcript: &Transcript,
        kind: ReplyKind,
        also_return_rows: bool,
    ) -> Result<ChatPrompt, ConfigError> {
        let options = PromptOptions {
            continue_last: kind == ReplyKind::Continue,
            also_return_rows,
            ..PromptOptions::default()
        };
        if let Some(prompt) = self.extensions.custom_chat_prompt(text, state, &options) {
            return Ok(ChatPrompt {
                wrapper: prompt.clone(),
                prompt,
                rows: None,
            });
        }

        // Regenerating answers the newest message again, without its reply.
        let history = match kind {
            ReplyKind::Regenerate => &transcript.turns()[..transcript.len().saturating_sub(1)],
            _ => transcript.turns(),
        };
        generate_chat_prompt(text, state, history, self.counter.as_ref(), self.extensions.as_ref(), &options)
    }

    /// Produce a reply and stream visible transcript snapshots as it grows.
    ///
    /// The first snapshot shows a typing indicator, the last one the finished
    /// reply. Configuration errors are reported before the transcript is
    /// touched; engine errors end the stream and leave whatever was already
    /// written. A raised `cancel` flag ends the stream without writing the
    /// pending fragment and without a final snapshot.
    pub fn generate_chat_reply<'a>(
        &'a self,
        text: &'a str,
        state: &'a ChatState,
        transcript: &'a mut Transcript,
        kind: ReplyKind,
        cancel: CancellationFlag,
    ) -> impl Stream<Item = Result<Vec<Exchange>, GenerationError>> + 'a {
        try_stream! {
            let last_turn = transcript.last().cloned();
            if kind != ReplyKind::Generate && !has_reply_to_rework(transcript) {
                log_warn!("{:?} requested but there is no reply to work on", kind);
                yield transcript.visible();
                return;
            }
            if !self.engine.is_loaded() {
                log_error!("No model is loaded, cannot generate a reply");
                yield transcript.visible();
                return;
            }

            let stopping_strings = get_stopping_strings(state).map_err(GenerationError::from)?;
            let eos_token = state.stop_at_newline.then_some("\n");

            // Continuing keeps the reply being extended.
            let (visible_text, continued) = match kind {
                ReplyKind::Generate => (text.to_string(), None),
                ReplyKind::Regenerate => (last_turn.unwrap_or_default().visible.user, None),
                ReplyKind::Continue => {
                    let last = last_turn.unwrap_or_default();
                    (last.visible.user.clone(), Some(last))
                }
            };
            let text = self.request_text(text, transcript, kind);
            let prompt = self
                .build_prompt(&text, state, transcript, kind, false)
                .map_err(GenerationError::from)?
                .prompt;
            log_debug!("Chat prompt ({:?}): {}", kind, preview(&prompt, 200));

            let mut typing = match &continued {
                Some(last) => {
                    let mut snapshot = transcript.visible();
                    if let Some(exchange) = snapshot.last_mut() {
                        exchange.bot = format!("{}...", last.visible.bot);
                    }
                    snapshot
                }
                None => {
                    if kind == ReplyKind::Regenerate {
                        transcript.pop();
                    }
                    transcript.push(Turn::new(Exchange::new(&text, ""), Exchange::new(&visible_text, "")));
                    transcript.visible()
                }
            };
            if continued.is_none() {
                if let Some(exchange) = typing.last_mut() {
                    exchange.bot = PROCESSING_MESSAGE.to_string();
                }
            }
            yield typing;

            let mut cumulative_reply = String::new();
            for attempt in 0..state.chat_generation_attempts.max(1) {
                let input = format!("{prompt}{cumulative_reply}");
                let request = EngineRequest {
                    prompt: &input,
                    state,
                    eos_token,
                    stopping_strings: &stopping_strings,
                };
                let mut fragments = self.engine.generate(request);

                let mut generated = String::new();
                let mut reply: Option<String> = None;
                let mut first_fragment = true;
                while let Some(fragment) = fragments.next().await {
                    let fragment = fragment.map_err(|e| {
                        log_error!("Generation attempt {} failed: {}", attempt + 1, e);
                        GenerationError::from(e)
                    })?;
                    generated.push_str(&fragment);

                    let extracted = extract_message_from_reply(
                        &format!("{cumulative_reply}{generated}"),
                        &stopping_strings,
                        state.stop_at_newline,
                    );
                    let visible_reply = USER_PLACEHOLDER.replace_all(&extracted.text, NoExpand(&state.name1));
                    let visible_reply = self.extensions.transform_output(&visible_reply);

                    if cancel.load(Ordering::SeqCst) {
                        log_info!("Generation cancelled");
                        return;
                    }

                    if let Some(last) = &continued {
                        transcript.set_last(
                            Exchange::new(&text, format!("{}{}", last.internal.bot, extracted.text)),
                            Exchange::new(&visible_text, format!("{}{}", last.visible.bot, visible_reply)),
                        );
                        yield transcript.visible();
                    } else if !(first_fragment && visible_reply.trim().is_empty()) {
                        transcript.set_last(
                            Exchange::new(&text, extracted.text.as_str()),
                            Exchange::new(&visible_text, visible_reply),
                        );
                        yield transcript.visible();
                    }
                    first_fragment = false;

                    let boundary_found = extracted.boundary_found;
                    reply = Some(extracted.text);
                    if boundary_found {
                        break;
                    }
                }

                match reply {
                    Some(reply) if !reply.is_empty() => cumulative_reply = reply,
                    _ => break,
                }
            }

            log_debug!("Reply finished: {}", preview(transcript.last_reply(), 120));
            yield transcript.visible();
        }
    }

    /// Draft the user's next message. Yields `text...` first, then every
    /// partial draft, then the accumulated draft.
    pub fn impersonate_reply<'a>(
        &'a self,
        text: &'a str,
        state: &'a ChatState,
        transcript: &'a Transcript,
        cancel: CancellationFlag,
    ) -> impl Stream<Item = Result<String, GenerationError>> + 'a {
        try_stream! {
            if !self.engine.is_loaded() {
                log_error!("No model is loaded, cannot impersonate");
                yield String::new();
                return;
            }

            let stopping_strings = get_stopping_strings(state).map_err(GenerationError::from)?;
            let eos_token = state.stop_at_newline.then_some("\n");
            let prompt = self
                .impersonation_prompt(state, transcript, false)
                .map_err(GenerationError::from)?
                .prompt;

            yield format!("{text}...");

            let mut cumulative_reply = text.to_string();
            for _ in 0..state.chat_generation_attempts.max(1) {
                let input = format!("{prompt}{cumulative_reply}");
                let request = EngineRequest {
                    prompt: &input,
                    state,
                    eos_token,
                    stopping_strings: &stopping_strings,
                };
                let mut fragments = self.engine.generate(request);

                let mut generated = String::new();
                let mut reply: Option<String> = None;
                while let Some(fragment) = fragments.next().await {
                    generated.push_str(&fragment.map_err(GenerationError::from)?);
                    let extracted = extract_message_from_reply(
                        &format!("{cumulative_reply}{generated}"),
                        &stopping_strings,
                        state.stop_at_newline,
                    );
                    if cancel.load(Ordering::SeqCst) {
                        log_info!("Impersonation cancelled");
                        return;
                    }

                    yield extracted.text.clone();
                    let boundary_found = extracted.boundary_found;
                    reply = Some(extracted.text);
                    if boundary_found {
                        break;
                    }
                }

                match reply {
                    Some(reply) if !reply.is_empty() => cumulative_reply = reply,
                    _ => break,
                }
            }

            yield cumulative_reply;
        }
    }
}

/// Regenerate and continue need a turn beyond a lone greeting (a single
/// turn without visible user text).
fn has_reply_to_rework(transcript: &Transcript) -> bool {
    match transcript.turns() {
        [] => false,
        [only] => !only.visible.user.is_empty(),
        _ => true,
    }
}
