//! Sensitive-phrase extraction through the language model

use serde_json::Value;
use shield_sdk::errors::ShieldError;
use std::time::Duration;
use tracing::{debug, warn};

use super::localize::normalize;
use crate::llm::{complete_with_timeout, extract_json, LLMProvider, Message};

const SYSTEM_PROMPT: &str = "You find sensitive content in speech transcripts. \
Given a transcript and what the user wants removed, reply with a JSON object \
{\"phrases\": [...]} listing every phrase to redact, copied exactly as it \
appears in the transcript. Reply with {\"phrases\": []} when nothing matches.";

/// Ask the model which transcript phrases the user's intent covers
pub async fn extract_phrases(
    llm: &dyn LLMProvider,
    transcript: &str,
    intent: &str,
    timeout: Duration,
) -> Result<Vec<String>, ShieldError> {
    let messages = vec![
        Message::system(SYSTEM_PROMPT),
        Message::user(format!(
            "Request: {}\n\nTranscript:\n{}",
            intent, transcript
        )),
    ];
    let reply = complete_with_timeout(llm, &messages, true, timeout, "extract").await?;
    let phrases = parse_phrases(&reply)?;

    let haystack = normalize(transcript);
    for p in &phrases {
        if !haystack.contains(&normalize(p)) {
            warn!(phrase = %p, "Extracted phrase not verbatim in transcript");
        }
    }
    debug!(count = phrases.len(), "Extracted sensitive phrases");
    Ok(phrases)
}

/// Accepts `{"phrases": [...]}` or a bare array of strings
pub fn parse_phrases(reply: &str) -> Result<Vec<String>, ShieldError> {
    let value = extract_json(reply)
        .ok_or_else(|| ShieldError::Llm(format!("no JSON in phrase reply: {}", reply)))?;
    let list = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("phrases") {
            Some(Value::Array(items)) => items,
            _ => return Err(ShieldError::Llm("reply lacks a 'phrases' array".to_string())),
        },
        _ => return Err(ShieldError::Llm("phrase reply is not a list".to_string())),
    };
    Ok(list
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        })
        .collect())
}
