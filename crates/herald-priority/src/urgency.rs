//! Urgency and tone analysis of message text.
//!
//! Combines three cues into a single urgency value in `[0, 1]`:
//! weighted urgency terms (plus a small bonus for their density),
//! repeated `!`/`?` punctuation, and the capitalization ratio.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Urgency terms and their weights, strongest first.
const URGENCY_TERMS: &[(&str, f64)] = &[
    ("urgent", 1.0),
    ("asap", 1.0),
    ("immediately", 1.0),
    ("critical", 0.9),
    ("emergency", 0.9),
    ("important", 0.8),
    ("priority", 0.7),
    ("today", 0.7),
    ("now", 0.7),
    ("soon", 0.6),
    ("tomorrow", 0.5),
    ("this week", 0.4),
];

static URGENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(urgent|asap|immediately|critical|emergency|important|priority|today|now|soon|tomorrow|this\s+week)\b",
    )
    .expect("Invalid urgency term regex")
});

static NEGATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(problem|issue|error|failed|broken|wrong|bug|crash|down|not\s+working)\b")
        .expect("Invalid negative term regex")
});

static POSITIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(thanks|thank\s+you|great|excellent|awesome|perfect|good\s+job|well\s+done|appreciate)\b",
    )
    .expect("Invalid positive term regex")
});

static REPEATED_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!{2,}|\?{2,}").expect("Invalid punctuation regex"));

const PUNCTUATION_URGENCY: f64 = 0.6;
const SHOUTING_URGENCY: f64 = 0.7;
/// Minimum letters before the capitalization ratio counts as shouting.
const SHOUTING_MIN_LETTERS: usize = 10;
const SHOUTING_RATIO: f64 = 0.7;
const MAX_DENSITY_BONUS: f64 = 0.1;
const MAX_KEYWORDS: usize = 5;

/// Overall tone of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Urgent,
    Negative,
    Positive,
    Neutral,
}

/// Result of analysing one message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UrgencyAnalysis {
    /// Normalized urgency in `[0, 1]`.
    pub urgency: f64,
    pub tone: Tone,
    /// Up to five matched terms, strongest urgency terms first.
    pub keywords: Vec<String>,
    /// Upstream classification of the message as urgent outright.
    pub explicit_urgent: bool,
    pub caps_ratio: f64,
    pub repeated_punctuation: bool,
}

/// Stateless urgency analyser.
#[derive(Clone, Debug)]
pub struct UrgencyAnalyzer {
    explicit_threshold: f64,
}

impl Default for UrgencyAnalyzer {
    fn default() -> Self {
        Self {
            explicit_threshold: 0.9,
        }
    }
}

impl UrgencyAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn analyze(&self, text: &str) -> UrgencyAnalysis {
        let mut urgency_hits: Vec<(String, f64)> = URGENCY
            .find_iter(text)
            .map(|m| {
                let term = normalize(m.as_str());
                let weight = term_weight(&term);
                (term, weight)
            })
            .collect();

        let term_score = urgency_hits.iter().map(|(_, w)| *w).fold(0.0, f64::max);
        let words = text.split_whitespace().count().max(1);
        let density_bonus = (urgency_hits.len() as f64 / words as f64 * 0.5).min(MAX_DENSITY_BONUS);

        let repeated_punctuation = REPEATED_PUNCTUATION.is_match(text);
        let caps_ratio = caps_ratio(text);
        let letters = text.chars().filter(|c| c.is_alphabetic()).count();
        let shouting = letters >= SHOUTING_MIN_LETTERS && caps_ratio >= SHOUTING_RATIO;

        let mut base = term_score;
        if repeated_punctuation {
            base = base.max(PUNCTUATION_URGENCY);
        }
        if shouting {
            base = base.max(SHOUTING_URGENCY);
        }
        let urgency = (base + density_bonus).clamp(0.0, 1.0);

        let negatives: Vec<String> = NEGATIVE.find_iter(text).map(|m| normalize(m.as_str())).collect();
        let positives: Vec<String> = POSITIVE.find_iter(text).map(|m| normalize(m.as_str())).collect();

        let tone = if urgency >= 0.8 {
            Tone::Urgent
        } else if negatives.len() > positives.len() {
            Tone::Negative
        } else if positives.len() > negatives.len() {
            Tone::Positive
        } else {
            Tone::Neutral
        };

        // Stable sort keeps order of appearance among equal weights.
        urgency_hits.sort_by(|a, b| b.1.total_cmp(&a.1));
        let mut keywords: Vec<String> = Vec::with_capacity(MAX_KEYWORDS);
        for term in urgency_hits
            .into_iter()
            .map(|(t, _)| t)
            .chain(negatives)
            .chain(positives)
        {
            if keywords.len() == MAX_KEYWORDS {
                break;
            }
            if !keywords.contains(&term) {
                keywords.push(term);
            }
        }

        UrgencyAnalysis {
            urgency,
            tone,
            keywords,
            explicit_urgent: urgency >= self.explicit_threshold,
            caps_ratio,
            repeated_punctuation,
        }
    }
}

fn normalize(term: &str) -> String {
    term.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn term_weight(term: &str) -> f64 {
    URGENCY_TERMS
        .iter()
        .find(|(t, _)| *t == term)
        .map(|(_, w)| *w)
        .unwrap_or(0.0)
}

/// Share of uppercase letters among all letters; 0 for text without letters.
fn caps_ratio(text: &str) -> f64 {
    let (upper, letters) = text
        .chars()
        .filter(|c| c.is_alphabetic())
        .fold((0usize, 0usize), |(u, l), c| (u + usize::from(c.is_uppercase()), l + 1));
    if letters == 0 {
        0.0
    } else {
        upper as f64 / letters as f64
    }
}
