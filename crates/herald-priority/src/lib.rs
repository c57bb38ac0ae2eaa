//! Message prioritization and sender learning.
//!
//! [`PriorityEngine`] fuses sender weight, urgency, keyword hits and message
//! age into a score in `[0, 100]`. It is a pure function of its inputs and is
//! recomputed on every request. [`LearningEngine`] owns the only mutable
//! shared state, the per-sender [`ProfileStore`], and writes every update
//! through to persistence with a bounded write-behind buffer for outages.

pub mod engine;
pub mod error;
pub mod learning;
pub mod profiles;
pub mod urgency;

pub use engine::PriorityEngine;
pub use error::LearningError;
pub use learning::{LearningEngine, LearningStats};
pub use profiles::{ProfileGuard, ProfileStore};
pub use urgency::{Tone, UrgencyAnalysis, UrgencyAnalyzer};
