//! Deterministic provider that replays canned responses

use super::{LLMError, LLMProvider, Message};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

type Responder = Box<dyn Fn(&[Message]) -> Option<String> + Send + Sync>;

enum Script {
    Queue(Mutex<VecDeque<String>>),
    Fn(Responder),
}

/// Provider for tests and offline runs
///
/// Either pops responses from a queue in order, or answers each call with a
/// closure over the conversation. Every call is recorded.
pub struct ScriptedProvider {
    script: Script,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    /// Reply with `responses` in order; further calls fail
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Script::Queue(Mutex::new(responses.into_iter().map(Into::into).collect())),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reply by inspecting the conversation; `None` fails the call
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&[Message]) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            script: Script::Fn(Box::new(responder)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Conversations received so far
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[Message], _json_mode: bool) -> super::Result<String> {
        let seen = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| LLMError::ParseError("call log poisoned".to_string()))?;
            calls.push(messages.to_vec());
            calls.len()
        };

        let reply = match &self.script {
            Script::Queue(queue) => queue
                .lock()
                .map_err(|_| LLMError::ParseError("script poisoned".to_string()))?
                .pop_front(),
            Script::Fn(responder) => responder(messages),
        };

        reply.ok_or(LLMError::ScriptExhausted(seen - 1))
    }
}
