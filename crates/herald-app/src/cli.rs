//! CLI argument definitions for the Herald binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

/// Herald - a personal assistant that routes commands to your services and
/// decides which messages deserve your attention.
#[derive(Parser, Debug)]
#[command(name = "herald", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Data directory for the SQLite store.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Keep profiles and history in memory only.
    #[arg(long = "in-memory")]
    pub in_memory: bool,

    /// Base URL of an Ollama-style text-generation server
    /// (e.g. http://localhost:11434). Rules only when absent.
    #[arg(long = "llm-url")]
    pub llm_url: Option<String>,

    /// Model name sent to the text-generation server.
    #[arg(long = "llm-model", default_value = "llama3.2:3b")]
    pub llm_model: String,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > HERALD_CONFIG env var > ~/.herald/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("HERALD_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Data directory override, if given.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Log level override, if given.
    pub fn resolve_log_level(&self) -> Option<String> {
        self.log_level.clone()
    }

    /// Text-generation endpoint: --llm-url flag > HERALD_LLM_URL env var.
    pub fn resolve_llm_url(&self) -> Option<String> {
        self.llm_url
            .clone()
            .or_else(|| std::env::var("HERALD_LLM_URL").ok())
            .filter(|u| !u.trim().is_empty())
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".herald").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".herald").join("config.toml");
    }
    PathBuf::from("config.toml")
}
