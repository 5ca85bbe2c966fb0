// Replay engine: serves canned fragment sequences instead of running a model.
// Used by the CLI's replay mode and by the orchestrator tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures_util::stream::{self, StreamExt};

use super::engine::{EngineRequest, FragmentStream, InferenceEngine};
use crate::error::EngineError;
use crate::log_debug;
use crate::logger::preview;

type ScriptedAttempt = Vec<Result<String, EngineError>>;

/// Each `generate` call consumes the next scripted attempt; once the script is
/// exhausted calls produce no fragments.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    attempts: Mutex<VecDeque<ScriptedAttempt>>,
    prompts: Mutex<Vec<String>>,
    unloaded: bool,
}

impl ScriptedEngine {
    pub fn new<I, A, S>(attempts: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let attempts = attempts
            .into_iter()
            .map(|fragments| fragments.into_iter().map(|f| Ok(f.into())).collect())
            .collect();
        Self {
            attempts: Mutex::new(attempts),
            ..Self::default()
        }
    }

    /// An engine reporting that no model is loaded.
    pub fn unloaded() -> Self {
        Self {
            unloaded: true,
            ..Self::default()
        }
    }

    /// Queue an attempt that emits `fragments` and then fails.
    pub fn push_failure<S: Into<String>>(&self, fragments: Vec<S>, message: &str) {
        let mut attempt: ScriptedAttempt = fragments.into_iter().map(|f| Ok(f.into())).collect();
        attempt.push(Err(EngineError::new(message)));
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push_back(attempt);
        }
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl InferenceEngine for ScriptedEngine {
    fn is_loaded(&self) -> bool {
        !self.unloaded
    }

    fn generate<'a>(&'a self, request: EngineRequest<'a>) -> FragmentStream<'a> {
        log_debug!(
            "Scripted generation (eos: {:?}, {} stop strings): {}",
            request.eos_token,
            request.stopping_strings.len(),
            preview(request.prompt, 120)
        );
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.to_string());
        }

        let attempt = self
            .attempts
            .lock()
            .ok()
            .and_then(|mut attempts| attempts.pop_front())
            .unwrap_or_default();

        stream::iter(attempt).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatState;

    #[tokio::test]
    async fn test_attempts_are_served_in_order() {
        let engine = ScriptedEngine::new(vec![vec!["a", "b"], vec!["c"]]);
        let state = ChatState::default();
        let request = EngineRequest {
            prompt: "p",
            state: &state,
            eos_token: None,
            stopping_strings: &[],
        };

        let first: Vec<_> = engine.generate(request).collect().await;
        let second: Vec<_> = engine.generate(request).collect().await;
        let third: Vec<_> = engine.generate(request).collect().await;

        assert_eq!(first.len(), 2);
        assert_eq!(second[0].as_deref().unwrap(), "c");
        assert!(third.is_empty());
        assert_eq!(engine.prompts(), vec!["p", "p", "p"]);
    }

    #[tokio::test]
    async fn test_failure_is_emitted_last() {
        let engine = ScriptedEngine::default();
        engine.push_failure(vec!["partial"], "device lost");
        let state = ChatState::default();
        let request = EngineRequest {
            prompt: "p",
            state: &state,
            eos_token: None,
            stopping_strings: &[],
        };

        let items: Vec<_> = engine.generate(request).collect().await;
        assert!(items[0].is_ok());
        assert_eq!(items[1].as_ref().unwrap_err().to_string(), "inference failed: device lost");
        assert!(!ScriptedEngine::unloaded().is_loaded());
    }
}
