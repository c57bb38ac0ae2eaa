use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{HeraldError, Result};
use crate::types::QuietHoursPolicy;

/// Top-level configuration for the Herald assistant core.
///
/// Loaded from `~/.herald/config.toml` by default. Each section corresponds
/// to one component; missing sections and fields fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl HeraldConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HeraldConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist, cannot be parsed, or is invalid.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.router.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(HeraldError::Config(format!(
                "router.confidence_threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        if self.bus.queue_capacity == 0 {
            return Err(HeraldError::Config("bus.queue_capacity must be > 0".into()));
        }
        if self.coordinator.max_parallel == 0 {
            return Err(HeraldError::Config(
                "coordinator.max_parallel must be > 0".into(),
            ));
        }
        if self.coordinator.history_limit == 0 {
            return Err(HeraldError::Config(
                "coordinator.history_limit must be > 0".into(),
            ));
        }
        self.priority.weights.validate()?;
        if self.priority.half_life_secs <= 0.0 {
            return Err(HeraldError::Config(
                "priority.half_life_secs must be > 0".into(),
            ));
        }
        let alpha = self.learning.alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(HeraldError::Config(format!(
                "learning.alpha must be within (0, 1], got {}",
                alpha
            )));
        }
        if self.learning.buffer_capacity == 0 {
            return Err(HeraldError::Config(
                "learning.buffer_capacity must be > 0".into(),
            ));
        }
        self.notifications.policy()?;
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite store.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.herald".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl GeneralConfig {
    /// `data_dir` with a leading `~` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }
}

/// Expand a leading `~` using the `HOME` (or `USERPROFILE`) variable.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        let rest = rest.trim_start_matches(['/', '\\']);
        if rest.is_empty() {
            PathBuf::from(home)
        } else {
            PathBuf::from(home).join(rest)
        }
    } else {
        PathBuf::from(path)
    }
}

/// Event channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum number of queued events before publishers suspend.
    pub queue_capacity: usize,
    /// Deliver queued events on shutdown instead of discarding them.
    pub drain_on_shutdown: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            drain_on_shutdown: true,
        }
    }
}

/// Intent classification and routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Intents below this confidence trigger a clarification request.
    pub confidence_threshold: f64,
    /// Number of recent turns supplied to the classifier.
    pub context_turns: usize,
    /// First topic segment for routed intents.
    pub capability_namespace: String,
    /// Timeout for a single text-generation call.
    pub llm_timeout_secs: u64,
    /// Upper bound on confidence produced by the rule-based matcher.
    pub fallback_max_confidence: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            context_turns: 10,
            capability_namespace: "agent".to_string(),
            llm_timeout_secs: 15,
            fallback_max_confidence: 0.8,
        }
    }
}

/// How a compound command reacts to a failing step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// The first failure cancels every pending step.
    #[default]
    FailFast,
    /// Steps that do not depend on the failure keep running.
    BestEffort,
}

/// Multi-step command execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub failure_mode: FailureMode,
    /// Bound on each capability invocation.
    pub capability_timeout_secs: u64,
    /// Retries for retryable failures (attempts = 1 + max_retries).
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Number of finished commands kept for auditing.
    pub history_limit: usize,
    /// Maximum independent steps in flight at once.
    pub max_parallel: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::FailFast,
            capability_timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 5000,
            history_limit: 10,
            max_parallel: 4,
        }
    }
}

/// Fusion weights for the priority score. Must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionWeights {
    pub sender: f64,
    pub urgency: f64,
    pub keyword: f64,
    pub recency: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            sender: 0.30,
            urgency: 0.35,
            keyword: 0.15,
            recency: 0.20,
        }
    }
}

impl FusionWeights {
    pub fn sum(&self) -> f64 {
        self.sender + self.urgency + self.keyword + self.recency
    }

    pub fn validate(&self) -> Result<()> {
        let parts = [self.sender, self.urgency, self.keyword, self.recency];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(HeraldError::Config(
                "priority.weights must be finite and non-negative".into(),
            ));
        }
        if (self.sum() - 1.0).abs() > 1e-6 {
            return Err(HeraldError::Config(format!(
                "priority.weights must sum to 1, got {:.6}",
                self.sum()
            )));
        }
        Ok(())
    }
}

/// Message prioritization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub weights: FusionWeights,
    /// Age at which the recency signal has decayed to 1/e.
    pub half_life_secs: f64,
    /// Terms that mark a message as important.
    pub keywords: Vec<String>,
    /// Scores at or above this are urgent.
    pub urgent_threshold: f64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            weights: FusionWeights::default(),
            half_life_secs: 3600.0,
            keywords: [
                "asap",
                "urgent",
                "deadline",
                "important",
                "critical",
                "invoice",
                "meeting",
                "contract",
                "action required",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            urgent_threshold: 90.0,
        }
    }
}

/// Sender profile learning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// EMA smoothing factor.
    pub alpha: f64,
    /// Interactions required before a profile influences scoring.
    pub cold_start_interactions: u32,
    /// Days without interaction before a profile drifts back to neutral.
    pub inactivity_days: u32,
    /// Half-life of the drift toward neutral once inactive.
    pub neutral_pull_half_life_days: f64,
    /// Maximum number of unpersisted profile updates kept in memory.
    pub buffer_capacity: usize,
    pub persist_timeout_ms: u64,
    pub retry_interval_secs: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            cold_start_interactions: 5,
            inactivity_days: 30,
            neutral_pull_half_life_days: 30.0,
            buffer_capacity: 256,
            persist_timeout_ms: 500,
            retry_interval_secs: 30,
        }
    }
}

/// Notification timing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Start of the quiet window, local time, `HH:MM`.
    pub quiet_start: String,
    /// End of the quiet window (exclusive), local time, `HH:MM`.
    pub quiet_end: String,
    pub urgent_override: bool,
    pub batch_window_secs: u64,
    /// Scores at or above this are delivered without batching.
    pub high_threshold: f64,
    pub history_limit: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            quiet_start: "22:00".to_string(),
            quiet_end: "08:00".to_string(),
            urgent_override: true,
            batch_window_secs: 60,
            high_threshold: 70.0,
            history_limit: 50,
        }
    }
}

impl NotificationConfig {
    /// Parse the configured window into a [`QuietHoursPolicy`].
    pub fn policy(&self) -> Result<QuietHoursPolicy> {
        Ok(QuietHoursPolicy {
            start: parse_clock(&self.quiet_start)?,
            end: parse_clock(&self.quiet_end)?,
            urgent_override: self.urgent_override,
        })
    }
}

fn parse_clock(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| HeraldError::Config(format!("invalid time '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = HeraldConfig::default();
        assert_eq!(config.general.data_dir, "~/.herald");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.bus.queue_capacity, 1000);
        assert!(config.bus.drain_on_shutdown);
        assert!((config.router.confidence_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.router.capability_namespace, "agent");
        assert_eq!(config.coordinator.failure_mode, FailureMode::FailFast);
        assert_eq!(config.coordinator.history_limit, 10);
        assert!((config.learning.alpha - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.learning.cold_start_interactions, 5);
        assert_eq!(config.notifications.batch_window_secs, 60);
        assert!((config.priority.urgent_threshold - 90.0).abs() < f64::EPSILON);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let w = FusionWeights::default();
        assert!((w.sum() - 1.0).abs() < 1e-9);
        w.validate().unwrap();
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let content = r#"
[router]
confidence_threshold = 0.6

[coordinator]
failure_mode = "best_effort"
"#;
        let file = create_temp_config(content);
        let config = HeraldConfig::load(file.path()).unwrap();
        assert!((config.router.confidence_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.coordinator.failure_mode, FailureMode::BestEffort);
        // Remaining fields use defaults
        assert_eq!(config.coordinator.max_retries, 3);
        assert_eq!(config.bus.queue_capacity, 1000);
    }

    #[test]
    fn test_load_rejects_weights_not_summing_to_one() {
        let content = r#"
[priority.weights]
sender = 0.5
urgency = 0.5
keyword = 0.5
recency = 0.5
"#;
        let file = create_temp_config(content);
        let err = HeraldConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("sum to 1"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HeraldConfig::default();
        config.router.confidence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = HeraldConfig::default();
        config.learning.alpha = 0.0;
        assert!(config.validate().is_err());

        let mut config = HeraldConfig::default();
        config.bus.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = HeraldConfig::default();
        config.notifications.quiet_start = "25:99".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = HeraldConfig::load_or_default(Path::new("/nonexistent/herald.toml"));
        assert_eq!(config.general.data_dir, "~/.herald");
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("this is {{ not valid TOML");
        assert!(HeraldConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_save_creates_parent_dirs_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        let mut config = HeraldConfig::default();
        config.notifications.quiet_start = "23:30".into();
        config.save(&path).unwrap();

        assert!(path.exists());
        let reloaded = HeraldConfig::load(&path).unwrap();
        assert_eq!(reloaded.notifications.quiet_start, "23:30");
        assert_eq!(reloaded.priority.keywords, config.priority.keywords);
        assert_eq!(reloaded.priority.weights, config.priority.weights);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let file = create_temp_config("");
        let config = HeraldConfig::load(file.path()).unwrap();
        assert_eq!(config.learning.buffer_capacity, 256);
        assert_eq!(config.notifications.quiet_end, "08:00");
    }

    #[test]
    fn test_notification_policy_parses_window() {
        let policy = NotificationConfig::default().policy().unwrap();
        assert_eq!(policy.start, NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        assert_eq!(policy.end, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert!(policy.urgent_override);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/var/lib/herald"), PathBuf::from("/var/lib/herald"));
        let expanded = expand_home("~/.herald");
        assert!(expanded.ends_with(".herald"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }
}
