use std::fmt;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form key/value parameters carried by intents and sub-tasks.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Timestamp
// =============================================================================

/// Seconds since the Unix epoch (UTC).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }

    /// Seconds elapsed between `earlier` and `self`, never negative.
    pub fn seconds_since(&self, earlier: Timestamp) -> i64 {
        (self.0 - earlier.0).max(0)
    }

    pub fn plus_secs(&self, secs: i64) -> Self {
        Self(self.0 + secs)
    }
}

// =============================================================================
// Intent
// =============================================================================

/// A structured command extracted from raw input.
///
/// Invariant: `confidence` is always within `[0, 1]`; constructors clamp it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub action: String,
    pub target: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub confidence: f64,
    pub context_id: String,
    pub raw_input: String,
}

impl Intent {
    pub fn new(
        action: impl Into<String>,
        target: impl Into<String>,
        parameters: Parameters,
        confidence: f64,
        context_id: impl Into<String>,
        raw_input: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            target: target.into(),
            parameters,
            confidence: clamp_unit(confidence),
            context_id: context_id.into(),
            raw_input: raw_input.into(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_unit(confidence);
        self
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// =============================================================================
// Messages and scoring
// =============================================================================

/// An inbound message from a communication capability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub text: String,
    /// Capability that produced the message (e.g. "mail").
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub received_at: Timestamp,
}

impl Message {
    pub fn new(sender: impl Into<String>, text: impl Into<String>, received_at: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            text: text.into(),
            source: String::new(),
            subject: None,
            received_at,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Subject and body joined, used for text analysis.
    pub fn full_text(&self) -> String {
        match &self.subject {
            Some(subject) if !subject.is_empty() => format!("{}\n{}", subject, self.text),
            _ => self.text.clone(),
        }
    }
}

/// Per-component signals that produced a [`PriorityScore`], each in `[0, 1]`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub sender_weight: f64,
    pub urgency: f64,
    pub keyword_signal: f64,
    pub time_decay: f64,
    /// True when the sender profile was not yet trusted and the neutral
    /// weight was used instead.
    pub cold_start: bool,
    /// True when upstream analysis classified the message as urgent outright.
    pub explicit_urgent: bool,
}

/// Fused importance of a message. `value` is always within `[0, 100]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriorityScore {
    pub message_id: String,
    pub value: f64,
    pub breakdown: ScoreBreakdown,
}

impl PriorityScore {
    pub fn band(&self, high_threshold: f64, urgent_threshold: f64) -> PriorityBand {
        PriorityBand::from_score(self.value, high_threshold, urgent_threshold)
    }
}

/// Coarse priority classification derived from a score.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityBand {
    Low,
    Normal,
    High,
    Urgent,
}

impl PriorityBand {
    /// Scores below 40 are low, below `high` normal, below `urgent` high.
    pub fn from_score(score: f64, high: f64, urgent: f64) -> Self {
        if score >= urgent {
            PriorityBand::Urgent
        } else if score >= high {
            PriorityBand::High
        } else if score >= 40.0 {
            PriorityBand::Normal
        } else {
            PriorityBand::Low
        }
    }
}

impl fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityBand::Low => write!(f, "low"),
            PriorityBand::Normal => write!(f, "normal"),
            PriorityBand::High => write!(f, "high"),
            PriorityBand::Urgent => write!(f, "urgent"),
        }
    }
}

// =============================================================================
// Sender profiles
// =============================================================================

/// Weight assigned to senders that have no trusted history.
pub const NEUTRAL_WEIGHT: f64 = 50.0;

/// Learned interaction profile for one sender.
///
/// Invariant: `weight` is always within `[0, 100]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SenderProfile {
    pub sender: String,
    pub weight: f64,
    pub replies: u32,
    pub ignores: u32,
    pub archives: u32,
    pub priority_marks: u32,
    pub first_seen: Timestamp,
    pub last_interaction: Option<Timestamp>,
}

impl SenderProfile {
    pub fn new(sender: impl Into<String>, now: Timestamp) -> Self {
        Self {
            sender: sender.into(),
            weight: NEUTRAL_WEIGHT,
            replies: 0,
            ignores: 0,
            archives: 0,
            priority_marks: 0,
            first_seen: now,
            last_interaction: None,
        }
    }

    /// Total number of observed reactions.
    pub fn interactions(&self) -> u32 {
        self.replies + self.ignores + self.archives + self.priority_marks
    }

    pub fn set_weight(&mut self, weight: f64) {
        self.weight = if weight.is_nan() {
            NEUTRAL_WEIGHT
        } else {
            weight.clamp(0.0, 100.0)
        };
    }
}

/// A user reaction to a message, fed to the learning engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    Reply,
    Ignore,
    Archive,
    PriorityMark,
}

impl fmt::Display for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reaction::Reply => write!(f, "reply"),
            Reaction::Ignore => write!(f, "ignore"),
            Reaction::Archive => write!(f, "archive"),
            Reaction::PriorityMark => write!(f, "priority"),
        }
    }
}

impl std::str::FromStr for Reaction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reply" => Ok(Reaction::Reply),
            "ignore" => Ok(Reaction::Ignore),
            "archive" => Ok(Reaction::Archive),
            "priority" | "priority_mark" => Ok(Reaction::PriorityMark),
            _ => Err(format!("Unknown reaction: {}", s)),
        }
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// Quiet-hour window in local wall-clock time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuietHoursPolicy {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub urgent_override: bool,
}

impl QuietHoursPolicy {
    /// Whether `time` falls inside `[start, end)`.
    ///
    /// Windows with `start > end` wrap past midnight; `start == end` is empty.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start == self.end {
            false
        } else if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A single message delivered immediately.
    Single,
    /// Several low/normal messages aggregated over the batching window.
    Batch,
    /// Everything queued during quiet hours.
    QuietDigest,
}

/// One line inside a notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationItem {
    pub message_id: String,
    pub sender: String,
    pub preview: String,
    pub score: f64,
    pub band: PriorityBand,
}

/// A user-facing notification emitted on `notification.new`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub band: PriorityBand,
    pub items: Vec<NotificationItem>,
    pub created_at: Timestamp,
}
