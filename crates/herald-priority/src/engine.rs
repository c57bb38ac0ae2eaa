//! Weighted fusion of priority signals.

use herald_core::config::{FusionWeights, PriorityConfig};
use herald_core::types::{
    Message, PriorityBand, PriorityScore, ScoreBreakdown, SenderProfile, Timestamp, NEUTRAL_WEIGHT,
};
use tracing::debug;

use crate::urgency::{UrgencyAnalysis, UrgencyAnalyzer};

/// Keyword hits at which the keyword signal saturates.
const KEYWORD_SATURATION: f64 = 2.0;

/// Scores messages as
/// `100 * (w_s * sender + w_u * urgency + w_k * keywords + w_r * exp(-age / half_life))`.
///
/// Sender profiles below the cold-start interaction count contribute the
/// neutral weight instead of their learned one. Scoring has no side effects,
/// so identical inputs always give identical scores.
#[derive(Clone, Debug)]
pub struct PriorityEngine {
    weights: FusionWeights,
    half_life_secs: f64,
    keywords: Vec<String>,
    urgent_threshold: f64,
    cold_start_interactions: u32,
    analyzer: UrgencyAnalyzer,
}

impl PriorityEngine {
    pub fn new(config: &PriorityConfig, cold_start_interactions: u32) -> Self {
        Self {
            weights: config.weights,
            half_life_secs: config.half_life_secs,
            keywords: config
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            urgent_threshold: config.urgent_threshold,
            cold_start_interactions,
            analyzer: UrgencyAnalyzer::new(),
        }
    }

    pub fn urgent_threshold(&self) -> f64 {
        self.urgent_threshold
    }

    /// Whether a profile has enough history to influence scoring.
    pub fn is_trusted(&self, profile: &SenderProfile) -> bool {
        profile.interactions() >= self.cold_start_interactions
    }

    pub fn analyze(&self, message: &Message) -> UrgencyAnalysis {
        self.analyzer.analyze(&message.full_text())
    }

    pub fn score(
        &self,
        message: &Message,
        profile: Option<&SenderProfile>,
        now: Timestamp,
    ) -> PriorityScore {
        let analysis = self.analyze(message);

        let trusted = profile.filter(|p| self.is_trusted(p));
        let sender_weight = trusted.map(|p| p.weight).unwrap_or(NEUTRAL_WEIGHT) / 100.0;
        let keyword_signal = (self.keyword_hits(message) as f64 / KEYWORD_SATURATION).min(1.0);
        let age = now.seconds_since(message.received_at) as f64;
        let time_decay = (-age / self.half_life_secs.max(f64::EPSILON)).exp();

        let w = &self.weights;
        let fused = w.sender * sender_weight
            + w.urgency * analysis.urgency
            + w.keyword * keyword_signal
            + w.recency * time_decay;
        let value = if fused.is_nan() {
            0.0
        } else {
            (fused * 100.0).clamp(0.0, 100.0)
        };

        debug!(
            message_id = %message.id,
            sender = %message.sender,
            value,
            cold_start = trusted.is_none(),
            "Message scored"
        );

        PriorityScore {
            message_id: message.id.clone(),
            value,
            breakdown: ScoreBreakdown {
                sender_weight,
                urgency: analysis.urgency,
                keyword_signal,
                time_decay,
                cold_start: trusted.is_none(),
                explicit_urgent: analysis.explicit_urgent,
            },
        }
    }

    /// Band of a score, treating explicitly urgent messages as urgent.
    pub fn band(&self, score: &PriorityScore, high_threshold: f64) -> PriorityBand {
        if score.breakdown.explicit_urgent {
            PriorityBand::Urgent
        } else {
            score.band(high_threshold, self.urgent_threshold)
        }
    }

    fn keyword_hits(&self, message: &Message) -> usize {
        let text = message.full_text().to_lowercase();
        self.keywords
            .iter()
            .filter(|k| text.contains(k.as_str()))
            .count()
    }
}
