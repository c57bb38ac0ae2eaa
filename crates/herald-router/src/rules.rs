//! Deterministic rule-based intent matcher.
//!
//! Used whenever text generation is unavailable or returns something that
//! fails validation. Never fails: unmatched input yields an `unknown`
//! intent with low confidence, which the router turns into a clarification.

use std::sync::LazyLock;

use herald_core::types::Parameters;
use regex::Regex;
use serde_json::Value;

use crate::llm::IntentFields;

/// Confidence contributed by an unmatched action or target.
pub const UNMATCHED_CONFIDENCE: f64 = 0.2;

struct Rule {
    regex: Regex,
    name: &'static str,
    confidence: f64,
}

fn compile(table: &[(&str, &'static str, f64)]) -> Vec<Rule> {
    table
        .iter()
        .map(|(pat, name, confidence)| Rule {
            regex: Regex::new(pat).expect("Invalid rule regex"),
            name: *name,
            confidence: *confidence,
        })
        .collect()
}

// =============================================================================
// Action synonyms
// =============================================================================

static ACTION_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    compile(&[
        (r"(?i)\b(?:reply|respond|answer|write\s+back)\b", "reply", 0.9),
        (r"(?i)\bmark\s+(?:\w+\s+){0,3}?(?:as\s+)?read\b", "mark_read", 0.9),
        (r"(?i)\b(?:summari[sz]e|summary|recap|digest|tl;?dr)\b", "summarize", 0.9),
        (r"(?i)\b(?:archive|file\s+away|clean\s+up)\b", "archive", 0.9),
        (r"(?i)\b(?:send|forward|dm|share)\b", "send", 0.9),
        (r"(?i)\be-?mail\s+(?:it|this|that|them|him|her|to)\b", "send", 0.85),
        (r"(?i)\b(?:write|tell|notify|message|post)\b", "send", 0.75),
        (r"(?i)\b(?:find|search|look\s+(?:for|up)|locate)\b", "search", 0.85),
        (r"(?i)\b(?:schedule|book|set\s+up\s+a\s+meeting)\b", "schedule", 0.85),
        (r"(?i)\b(?:create|add|open\s+a|file\s+a|raise|new)\b", "create", 0.8),
        (r"(?i)\b(?:check|read|show|get|fetch|list|view|any\s+new)\b", "fetch", 0.8),
    ])
});

// =============================================================================
// Target keywords
// =============================================================================

static TARGET_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    compile(&[
        (r"(?i)\b(?:e-?mails?|mail|inbox|gmail|outlook)\b", "mail", 0.9),
        (r"(?i)\b(?:slack|chat|channel|dm|teams)\b", "chat", 0.9),
        (r"(?:^|\s)#[\w-]+", "chat", 0.9),
        (r"(?i)\b(?:jira|tickets?|issues?|bugs?|tracker|tasks?)\b", "tracker", 0.85),
        (r"(?i)\b(?:calendar|meetings?|events?|appointments?)\b", "calendar", 0.85),
        (r"[\w.+-]+@[\w-]+(?:\.[\w-]+)+", "mail", 0.8),
    ])
});

/// Aliases that map service names onto canonical targets.
const TARGET_ALIASES: &[(&str, &str)] = &[
    ("gmail", "mail"),
    ("email", "mail"),
    ("e-mail", "mail"),
    ("outlook", "mail"),
    ("slack", "chat"),
    ("teams", "chat"),
    ("jira", "tracker"),
    ("tickets", "tracker"),
];

// =============================================================================
// Slot extraction
// =============================================================================

struct SlotPatterns {
    email: Regex,
    to_name: Regex,
    channel: Regex,
    from_name: Regex,
    quoted: Regex,
    about: Regex,
    limit: Regex,
}

static SLOTS: LazyLock<SlotPatterns> = LazyLock::new(|| SlotPatterns {
    email: Regex::new(r"[\w.+-]+@[\w-]+(?:\.[\w-]+)+").expect("Invalid email regex"),
    to_name: Regex::new(r"\b(?:to|for)\s+([A-Z][\w'-]*)").expect("Invalid recipient regex"),
    channel: Regex::new(r"(?:^|\s)#([\w-]+)").expect("Invalid channel regex"),
    from_name: Regex::new(r"\b[Ff]rom\s+([A-Z][\w'-]*)").expect("Invalid sender regex"),
    quoted: Regex::new(r#""([^"]+)"|“([^”]+)”"#).expect("Invalid quote regex"),
    about: Regex::new(r"(?i)\babout\s+([^.,;!?]+)").expect("Invalid subject regex"),
    limit: Regex::new(r"(?i)\b(?:last|latest|top|recent|first)\s+(\d{1,4})\b")
        .expect("Invalid limit regex"),
});

/// Keyword/synonym matcher producing lower-confidence intents.
#[derive(Debug, Clone)]
pub struct RuleMatcher {
    max_confidence: f64,
}

impl Default for RuleMatcher {
    fn default() -> Self {
        Self::new(0.8)
    }
}

impl RuleMatcher {
    /// `max_confidence` caps every rule-based result.
    pub fn new(max_confidence: f64) -> Self {
        Self {
            max_confidence: max_confidence.clamp(0.0, 1.0),
        }
    }

    /// Map a service name or alias onto a canonical target.
    pub fn canonical_target(name: &str) -> String {
        let lower = name.trim().to_lowercase();
        TARGET_ALIASES
            .iter()
            .find(|(alias, _)| *alias == lower)
            .map(|(_, target)| target.to_string())
            .unwrap_or(lower)
    }

    pub fn match_action(&self, text: &str) -> Option<(&'static str, f64)> {
        best_rule(&ACTION_RULES, text)
    }

    pub fn match_target(&self, text: &str) -> Option<(&'static str, f64)> {
        best_rule(&TARGET_RULES, text)
    }

    /// Extract well-known parameter slots from free text.
    pub fn extract_slots(&self, text: &str) -> Parameters {
        let mut params = Parameters::new();

        if let Some(m) = SLOTS.email.find(text) {
            params.insert("recipient".into(), Value::String(m.as_str().to_string()));
        } else if let Some(c) = SLOTS.to_name.captures(text) {
            params.insert("recipient".into(), Value::String(c[1].to_string()));
        }
        if let Some(c) = SLOTS.channel.captures(text) {
            params.insert("channel".into(), Value::String(c[1].to_string()));
        }
        if let Some(c) = SLOTS.from_name.captures(text) {
            params.insert("sender".into(), Value::String(c[1].to_string()));
        }
        if let Some(c) = SLOTS.quoted.captures(text) {
            if let Some(m) = c.get(1).or_else(|| c.get(2)) {
                params.insert("content".into(), Value::String(m.as_str().to_string()));
            }
        }
        if let Some(c) = SLOTS.about.captures(text) {
            let subject = c[1].trim();
            if !subject.is_empty() {
                params.insert("subject".into(), Value::String(subject.to_string()));
            }
        }
        if let Some(n) = SLOTS
            .limit
            .captures(text)
            .and_then(|c| c[1].parse::<u64>().ok())
        {
            params.insert("limit".into(), Value::from(n));
        }
        params
    }

    /// Classify `text` without any external help.
    ///
    /// Confidence is the lower of the action and target match confidences,
    /// capped at the configured maximum.
    pub fn classify(&self, text: &str) -> IntentFields {
        if text.trim().is_empty() {
            return IntentFields {
                action: "unknown".into(),
                target: "unknown".into(),
                parameters: Parameters::new(),
                confidence: 0.0,
            };
        }
        let (action, action_conf) = self
            .match_action(text)
            .unwrap_or(("unknown", UNMATCHED_CONFIDENCE));
        let (target, target_conf) = self
            .match_target(text)
            .unwrap_or(("unknown", UNMATCHED_CONFIDENCE));
        IntentFields {
            action: action.to_string(),
            target: target.to_string(),
            parameters: self.extract_slots(text),
            confidence: action_conf.min(target_conf).min(self.max_confidence),
        }
    }
}

/// Highest-confidence rule; ties go to the earliest match in the text.
fn best_rule(rules: &[Rule], text: &str) -> Option<(&'static str, f64)> {
    rules
        .iter()
        .filter_map(|r| r.regex.find(text).map(|m| (r, m.start())))
        .min_by(|(a, pa), (b, pb)| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(pa.cmp(pb))
        })
        .map(|(r, _)| (r.name, r.confidence))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_mail_with_address() {
        let m = RuleMatcher::default();
        let fields = m.classify("send an email to bob@example.com about the budget");
        assert_eq!(fields.action, "send");
        assert_eq!(fields.target, "mail");
        assert_eq!(fields.parameters["recipient"], "bob@example.com");
        assert_eq!(fields.parameters["subject"], "the budget");
        assert!((fields.confidence - 0.8).abs() < 1e-9, "capped at max");
    }

    #[test]
    fn test_chat_channel_slot() {
        let m = RuleMatcher::default();
        let fields = m.classify("post \"deploy done\" in #releases");
        assert_eq!(fields.action, "send");
        assert_eq!(fields.target, "chat");
        assert_eq!(fields.parameters["channel"], "releases");
        assert_eq!(fields.parameters["content"], "deploy done");
    }

    #[test]
    fn test_find_report_from_sender() {
        let m = RuleMatcher::default();
        let fields = m.classify("find the report from Alice in my inbox");
        assert_eq!(fields.action, "search");
        assert_eq!(fields.target, "mail");
        assert_eq!(fields.parameters["sender"], "Alice");
    }

    #[test]
    fn test_email_it_to_name() {
        let m = RuleMatcher::default();
        let fields = m.classify("email it to Bob");
        assert_eq!(fields.action, "send");
        assert_eq!(fields.target, "mail");
        assert_eq!(fields.parameters["recipient"], "Bob");
    }

    #[test]
    fn test_limit_slot() {
        let m = RuleMatcher::default();
        let fields = m.classify("summarize my last 5 emails");
        assert_eq!(fields.action, "summarize");
        assert_eq!(fields.parameters["limit"], 5);
    }

    #[test]
    fn test_unmatched_target_is_low_confidence() {
        let m = RuleMatcher::default();
        let fields = m.classify("send it");
        assert_eq!(fields.action, "send");
        assert_eq!(fields.target, "unknown");
        assert!((fields.confidence - UNMATCHED_CONFIDENCE).abs() < 1e-9);
    }

    #[test]
    fn test_gibberish_never_fails() {
        let m = RuleMatcher::default();
        let fields = m.classify("blorp zzt");
        assert_eq!(fields.action, "unknown");
        assert_eq!(fields.target, "unknown");
        assert!(fields.confidence <= UNMATCHED_CONFIDENCE);
        assert_eq!(m.classify("   ").confidence, 0.0);
    }

    #[test]
    fn test_canonical_target_aliases() {
        assert_eq!(RuleMatcher::canonical_target("Gmail"), "mail");
        assert_eq!(RuleMatcher::canonical_target("slack"), "chat");
        assert_eq!(RuleMatcher::canonical_target("jira"), "tracker");
        assert_eq!(RuleMatcher::canonical_target("calendar"), "calendar");
    }

    #[test]
    fn test_max_confidence_cap() {
        let m = RuleMatcher::new(0.5);
        let fields = m.classify("check my inbox");
        assert_eq!(fields.action, "fetch");
        assert!((fields.confidence - 0.5).abs() < 1e-9);
    }
}
