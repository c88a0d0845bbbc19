//! LLM Provider Abstraction Layer
//!
//! The planner, the tool generator and the phrase extractor talk to a language
//! model through the `LLMProvider` trait. `OpenAICompatProvider` speaks the
//! chat-completions protocol; `ScriptedProvider` replays canned responses for
//! tests and offline runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shield_sdk::errors::ShieldError;
use std::fmt;
use std::time::Duration;

pub mod openai;
pub mod scripted;

pub use openai::OpenAICompatProvider;
pub use scripted::ScriptedProvider;

/// Result type for LLM operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Script exhausted after {0} responses")]
    ScriptExhausted(usize),
}

impl LLMError {
    /// Failures that may clear up if the same request is sent again
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError(_) | Self::RateLimitExceeded)
    }
}

impl From<LLMError> for ShieldError {
    fn from(e: LLMError) -> Self {
        ShieldError::Llm(e.to_string())
    }
}

/// Message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// LLM Provider trait that all providers must implement
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Returns the name of the provider
    fn name(&self) -> &str;

    /// Generate a completion for the conversation
    ///
    /// With `json_mode` set the provider asks the model for a single JSON
    /// object. Callers parse the reply with [`extract_json`].
    async fn complete(&self, messages: &[Message], json_mode: bool) -> Result<String>;
}

/// Run a completion under a deadline
///
/// Expiry maps to `ExecutionTimeout` so it feeds the retry policy like any
/// other slow stage.
pub async fn complete_with_timeout(
    provider: &dyn LLMProvider,
    messages: &[Message],
    json_mode: bool,
    timeout: Duration,
    stage: &str,
) -> std::result::Result<String, ShieldError> {
    match tokio::time::timeout(timeout, provider.complete(messages, json_mode)).await {
        Ok(result) => result.map_err(ShieldError::from),
        Err(_) => {
            tracing::warn!(provider = provider.name(), stage, "LLM call timed out");
            Err(ShieldError::ExecutionTimeout {
                stage: stage.to_string(),
                secs: timeout.as_secs(),
            })
        }
    }
}

/// Extract the first JSON value from model output.
///
/// Handles raw JSON, fenced JSON (with or without trailing prose), and JSON
/// embedded in prose. Objects and arrays are both accepted.
pub fn extract_json(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(inner) = extract_fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(inner.trim()) {
            return Some(value);
        }
    }

    // First `{` or `[` that starts a balanced, parseable value
    for (pos, ch) in trimmed.char_indices() {
        if ch == '{' || ch == '[' {
            if let Some(candidate) = extract_balanced_json(&trimmed[pos..]) {
                if let Ok(value) = serde_json::from_str(candidate) {
                    return Some(value);
                }
            }
        }
    }

    None
}

/// Strip a surrounding markdown fence from generated source, if present
pub fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();
    match extract_fenced_block(trimmed) {
        Some(inner) => inner.trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
/// Returns `None` if no fenced block is found.
fn extract_fenced_block(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced JSON object or array starting at position 0 of `s`.
///
/// Counts bracket depth, respecting string literals, to find the matching
/// close.
fn extract_balanced_json(s: &str) -> Option<&str> {
    let (open, close) = match s.chars().next()? {
        '{' => ('{', '}'),
        '[' => ('[', ']'),
        _ => return None,
    };
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transient_errors() {
        assert!(LLMError::NetworkError("reset".into()).is_transient());
        assert!(LLMError::RateLimitExceeded.is_transient());
        assert!(!LLMError::AuthenticationFailed("bad key".into()).is_transient());
        assert!(!LLMError::InvalidRequest("500".into()).is_transient());
    }

    #[test]
    fn test_message_creation() {
        let msg = Message::system("You are a planner");
        assert_eq!(msg.role, MessageRole::System);
        assert_eq!(Message::user("hi").role.to_string(), "user");
    }

    #[test]
    fn test_extract_raw_json() {
        let v = extract_json(r#"{"pipeline": []}"#).unwrap();
        assert_eq!(v, json!({"pipeline": []}));
    }

    #[test]
    fn test_extract_fenced_json_with_trailing_prose() {
        let content = "```json\n[\"123 Main Street\"]\n```\nThese are the phrases.";
        assert_eq!(extract_json(content).unwrap(), json!(["123 Main Street"]));
    }

    #[test]
    fn test_extract_json_embedded_in_prose() {
        let content = r#"Sure! Here is the plan: {"pipeline": [{"tool": "blur_faces", "args": {}}]} Hope it helps."#;
        let v = extract_json(content).unwrap();
        assert_eq!(v["pipeline"][0]["tool"], "blur_faces");
    }

    #[test]
    fn test_balanced_respects_strings() {
        let content = r#"note {"a": "}{", "b": [1, 2]} tail"#;
        let v = extract_json(content).unwrap();
        assert_eq!(v, json!({"a": "}{", "b": [1, 2]}));
    }

    #[test]
    fn test_extract_json_none() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{unclosed").is_none());
    }

    #[test]
    fn test_strip_code_fences() {
        let src = "```python\nname = \"blur_plates\"\n```";
        assert_eq!(strip_code_fences(src), "name = \"blur_plates\"");
        assert_eq!(strip_code_fences("x = 1\n"), "x = 1");
    }

    #[tokio::test]
    async fn test_timeout_maps_to_execution_timeout() {
        struct Slow;

        #[async_trait]
        impl LLMProvider for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            async fn complete(&self, _: &[Message], _: bool) -> Result<String> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(String::new())
            }
        }

        let err = complete_with_timeout(&Slow, &[], false, Duration::from_millis(10), "plan")
            .await
            .unwrap_err();
        assert!(matches!(err, ShieldError::ExecutionTimeout { .. }));
    }
}
