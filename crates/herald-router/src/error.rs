//! Error types for capabilities, text generation and routing.

use herald_bus::BusError;
use herald_core::error::HeraldError;

/// Failure of a capability invocation.
///
/// Split into retryable (timeouts, transient network trouble, rate limits)
/// and non-retryable (everything else) classes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    #[error("Authentication failed for {0}")]
    Authentication(String),
    #[error("Rate limited by {0}")]
    RateLimited(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Capability call timed out after {0} ms")]
    Timeout(u64),
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("{capability} does not support action '{action}'")]
    Unsupported { capability: String, action: String },
    #[error("{capability} rejected action '{action}'")]
    Rejected { capability: String, action: String },
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),
    #[error("Capability failed: {0}")]
    Other(String),
}

impl CapabilityError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CapabilityError::Timeout(_)
                | CapabilityError::Network(_)
                | CapabilityError::RateLimited(_)
        )
    }
}

/// Failure of the text-generation collaborator. Always recovered by the
/// rule-based fallback.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlmError {
    #[error("Text generation unavailable: {0}")]
    Unavailable(String),
    #[error("Text generation timed out after {0} ms")]
    Timeout(u64),
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Response failed validation: {0}")]
    Invalid(String),
}

/// Errors surfaced by the router.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("I can't perform that action: unknown service '{0}'")]
    UnknownTarget(String),
    #[error("I can't perform that action: '{0}' is not a valid action")]
    InvalidAction(String),
    #[error("Event channel error: {0}")]
    Bus(#[from] BusError),
}

impl From<CapabilityError> for HeraldError {
    fn from(err: CapabilityError) -> Self {
        HeraldError::Routing(err.to_string())
    }
}

impl From<RouterError> for HeraldError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::Bus(bus) => bus.into(),
            other => HeraldError::Routing(other.to_string()),
        }
    }
}
