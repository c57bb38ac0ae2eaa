//! Intent classification with a guaranteed rule-based fallback.

use std::sync::Arc;
use std::time::Duration;

use herald_core::config::RouterConfig;
use herald_core::types::Intent;
use herald_storage::{HistoryRecord, Persistence};
use tracing::{debug, info, warn};

use crate::llm::{IntentFields, TextGenerator};
use crate::rules::RuleMatcher;

/// Converts raw text plus recent context into an [`Intent`].
///
/// The text generator is tried first, under a timeout; any failure or
/// schema violation falls back to the [`RuleMatcher`]. Classification
/// itself never fails.
pub struct IntentClassifier {
    generator: Option<Arc<dyn TextGenerator>>,
    rules: RuleMatcher,
    history: Option<Arc<dyn Persistence>>,
    llm_timeout: Duration,
    context_turns: usize,
}

impl IntentClassifier {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            generator: None,
            rules: RuleMatcher::new(config.fallback_max_confidence),
            history: None,
            llm_timeout: Duration::from_secs(config.llm_timeout_secs),
            context_turns: config.context_turns,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn Persistence>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn rules(&self) -> &RuleMatcher {
        &self.rules
    }

    pub fn generator(&self) -> Option<&Arc<dyn TextGenerator>> {
        self.generator.as_ref()
    }

    /// Last `context_turns` records for a context. Storage failures are
    /// logged and yield an empty window.
    pub async fn recent_context(&self, context_id: &str) -> Vec<HistoryRecord> {
        let Some(history) = &self.history else {
            return Vec::new();
        };
        match history.query_recent(context_id, self.context_turns).await {
            Ok(records) => records,
            Err(e) => {
                warn!(context_id, error = %e, "Could not load recent context");
                Vec::new()
            }
        }
    }

    /// Append the user's turn and the classified intent to the history.
    pub async fn record_turn(&self, intent: &Intent) {
        let Some(history) = &self.history else {
            return;
        };
        let record = HistoryRecord::new("user", intent.raw_input.clone()).with_data(
            serde_json::json!({
                "action": intent.action,
                "target": intent.target,
                "confidence": intent.confidence,
            }),
        );
        if let Err(e) = history.append_history(&intent.context_id, record).await {
            warn!(context_id = %intent.context_id, error = %e, "Could not record turn");
        }
    }

    /// Classify `raw` given an explicit context window.
    ///
    /// `targets` lists the registered capabilities and is included in the
    /// generation prompt.
    pub async fn classify(
        &self,
        raw: &str,
        context_id: &str,
        recent: &[HistoryRecord],
        targets: &[String],
    ) -> Intent {
        let fields = match self.classify_with_generator(raw, recent, targets).await {
            Some(fields) => fields,
            None => {
                let fields = self.rules.classify(raw);
                debug!(
                    action = %fields.action,
                    target = %fields.target,
                    confidence = fields.confidence,
                    "Rule-based classification"
                );
                fields
            }
        };
        let intent = Intent::new(
            fields.action,
            fields.target,
            fields.parameters,
            fields.confidence,
            context_id,
            raw,
        );
        info!(
            action = %intent.action,
            target = %intent.target,
            confidence = intent.confidence,
            "Intent classified"
        );
        intent
    }

    async fn classify_with_generator(
        &self,
        raw: &str,
        recent: &[HistoryRecord],
        targets: &[String],
    ) -> Option<IntentFields> {
        let generator = self.generator.as_ref()?;
        if raw.trim().is_empty() {
            return None;
        }
        let prompt = format!(
            "Available targets: {}\nCommand: {}",
            targets.join(", "),
            raw
        );
        let window = &recent[recent.len().saturating_sub(self.context_turns)..];
        match tokio::time::timeout(self.llm_timeout, generator.classify_intent(&prompt, window))
            .await
        {
            Ok(Ok(mut fields)) => {
                fields.target = RuleMatcher::canonical_target(&fields.target);
                // Fill slots the generator left out.
                for (k, v) in self.rules.extract_slots(raw) {
                    fields.parameters.entry(k).or_insert(v);
                }
                Some(fields)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Generator classification failed, using rules");
                None
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.llm_timeout.as_secs(),
                    "Generator classification timed out, using rules"
                );
                None
            }
        }
    }
}
