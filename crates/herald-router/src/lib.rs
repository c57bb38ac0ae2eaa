//! Intent classification and routing for Herald.
//!
//! Turns raw text into a structured [`Intent`](herald_core::Intent) using a
//! text-generation collaborator with a deterministic rule-based fallback,
//! then publishes it on `<namespace>.<target>.<action>` or asks the user to
//! rephrase. Capabilities are reached only through the [`Capability`]
//! contract, resolved by name in a [`CapabilityRegistry`].

pub mod capability;
pub mod classifier;
pub mod dispatcher;
pub mod error;
pub mod llm;
pub mod router;
pub mod rules;

pub use capability::{Capability, CapabilityOutput, CapabilityRegistry};
pub use classifier::IntentClassifier;
pub use dispatcher::CapabilityDispatcher;
pub use error::{CapabilityError, LlmError, RouterError};
pub use llm::{IntentFields, TextGenerator};
pub use router::{RouteOutcome, Router};
pub use rules::RuleMatcher;
