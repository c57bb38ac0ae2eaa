//! In-process mail and chat services backed by an inbox and an outbox.

use std::sync::Mutex;

use async_trait::async_trait;
use herald_core::types::{Message, Parameters, Timestamp};
use herald_router::{Capability, CapabilityError};
use serde_json::{json, Value};
use tracing::debug;

/// A capability whose inbox is filled by `:message` lines and whose outbox
/// records every outbound action.
pub struct LocalCapability {
    name: String,
    inbox: Mutex<Vec<Message>>,
    outbox: Mutex<Vec<Value>>,
}

impl LocalCapability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inbox: Mutex::new(Vec::new()),
            outbox: Mutex::new(Vec::new()),
        }
    }

    pub fn deliver(&self, message: Message) {
        self.inbox
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(message);
    }

    pub fn inbox(&self) -> Vec<Message> {
        self.inbox.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn outbox(&self) -> Vec<Value> {
        self.outbox.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn matches(message: &Message, params: &Parameters) -> bool {
        let text = message.full_text().to_lowercase();
        let sender_ok = params
            .get("sender")
            .and_then(Value::as_str)
            .map_or(true, |s| message.sender.to_lowercase().contains(&s.to_lowercase()));
        let subject_ok = params
            .get("subject")
            .or_else(|| params.get("query"))
            .and_then(Value::as_str)
            .map_or(true, |s| text.contains(&s.to_lowercase()));
        sender_ok && subject_ok
    }
}

/// Ids named directly or carried in an earlier step's records.
fn referenced_ids(data: &Parameters) -> Vec<String> {
    let mut ids: Vec<String> = data
        .get("id")
        .and_then(Value::as_str)
        .map(|s| vec![s.to_string()])
        .unwrap_or_default();
    if let Some(records) = data
        .get("previous_result")
        .and_then(|p| p.get("records"))
        .and_then(Value::as_array)
    {
        ids.extend(
            records
                .iter()
                .filter_map(|r| r.get("id").and_then(Value::as_str))
                .map(str::to_string),
        );
    }
    ids
}

#[async_trait]
impl Capability for LocalCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self) -> Result<bool, CapabilityError> {
        Ok(true)
    }

    async fn fetch(&self, params: &Parameters) -> Result<Vec<Value>, CapabilityError> {
        let inbox = self.inbox();
        let mut found: Vec<&Message> = inbox.iter().filter(|m| Self::matches(m, params)).collect();
        if let Some(limit) = params.get("limit").and_then(Value::as_u64) {
            let limit = usize::try_from(limit).unwrap_or(usize::MAX);
            let skip = found.len().saturating_sub(limit);
            found.drain(..skip);
        }
        debug!(capability = %self.name, found = found.len(), "Inbox searched");
        found
            .into_iter()
            .map(|m| serde_json::to_value(m).map_err(|e| CapabilityError::Other(e.to_string())))
            .collect()
    }

    async fn act(&self, action: &str, data: &Parameters) -> Result<bool, CapabilityError> {
        match action {
            "send" | "reply" => {
                let addressed = ["recipient", "channel"]
                    .iter()
                    .any(|k| data.get(*k).and_then(Value::as_str).is_some_and(|v| !v.is_empty()));
                if !addressed {
                    return Err(CapabilityError::InvalidParameters(format!(
                        "{} needs a recipient or channel",
                        action
                    )));
                }
            }
            "create" | "schedule" | "summarize" => {}
            "archive" | "mark_read" => {
                let ids = referenced_ids(data);
                if action == "archive" && !ids.is_empty() {
                    self.inbox
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .retain(|m| !ids.contains(&m.id));
                }
            }
            _ => {
                return Err(CapabilityError::Unsupported {
                    capability: self.name.clone(),
                    action: action.to_string(),
                })
            }
        }
        self.outbox
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(json!({"action": action, "data": data, "at": Timestamp::now()}));
        Ok(true)
    }
}
