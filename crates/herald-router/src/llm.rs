//! Text-generation collaborator boundary.
//!
//! The backend is assumed unreliable: every response is extracted and
//! validated against a fixed schema before it is trusted, and every caller
//! keeps a non-generative fallback.

use async_trait::async_trait;
use herald_bus::validate_segment;
use herald_core::types::Parameters;
use herald_storage::HistoryRecord;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// System hint sent with intent classification prompts.
pub const INTENT_SYSTEM_HINT: &str = "You classify commands for a personal assistant. \
Reply with a single JSON object and nothing else: \
{\"action\": string, \"target\": string, \"parameters\": object, \"confidence\": number between 0 and 1}. \
Common actions: fetch, search, send, reply, create, summarize, archive, mark_read, schedule.";

/// Validated classification fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentFields {
    pub action: String,
    pub target: String,
    pub parameters: Parameters,
    pub confidence: f64,
}

/// A text-generation backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, system_hint: &str) -> Result<String, LlmError>;

    /// Ask for a structured classification of `prompt`, given recent turns.
    async fn classify_intent(
        &self,
        prompt: &str,
        context: &[HistoryRecord],
    ) -> Result<IntentFields, LlmError> {
        let mut full = String::new();
        if !context.is_empty() {
            full.push_str("Recent conversation:\n");
            for turn in context {
                full.push_str(&format!("- [{}] {}\n", turn.kind, turn.text));
            }
            full.push('\n');
        }
        full.push_str(prompt);
        let response = self.generate(&full, INTENT_SYSTEM_HINT).await?;
        parse_intent_response(&response)
    }
}

/// Slice from the first `open` to the last `close`, inclusive.
pub fn extract_delimited(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Parse and validate a classification response.
///
/// Requires `action` (non-empty string), `target` (string), `parameters`
/// (object) and `confidence` (number within `[0, 1]`).
pub fn parse_intent_response(text: &str) -> Result<IntentFields, LlmError> {
    let json = extract_delimited(text, '{', '}')
        .ok_or_else(|| LlmError::Malformed("no JSON object in response".into()))?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| LlmError::Malformed(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| LlmError::Malformed("response is not an object".into()))?;

    let action = obj
        .get("action")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LlmError::Invalid("action must be a non-empty string".into()))?;
    if validate_segment(&action).is_err() {
        return Err(LlmError::Invalid(format!(
            "action '{}' must be a single word",
            action
        )));
    }
    let target = obj
        .get("target")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
        .ok_or_else(|| LlmError::Invalid("target must be a string".into()))?;
    if !target.is_empty() && validate_segment(&target).is_err() {
        return Err(LlmError::Invalid(format!(
            "target '{}' must be a single word",
            target
        )));
    }
    let parameters = obj
        .get("parameters")
        .and_then(|v| v.as_object())
        .cloned()
        .ok_or_else(|| LlmError::Invalid("parameters must be an object".into()))?;
    let confidence = obj
        .get("confidence")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| LlmError::Invalid("confidence must be a number".into()))?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(LlmError::Invalid(format!(
            "confidence {} outside [0, 1]",
            confidence
        )));
    }

    Ok(IntentFields {
        action,
        target,
        parameters,
        confidence,
    })
}
