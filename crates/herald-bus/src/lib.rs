//! Event channel for Herald.
//!
//! A bounded, topic-based publish/subscribe backbone. Publishers enqueue
//! events and return; a single dispatch loop delivers each event to every
//! matching subscription in subscription order, isolating handler failures.

pub mod channel;
pub mod error;
pub mod handler;
pub mod topic;

pub use channel::{ChannelStats, EventChannel, SubscriptionId};
pub use error::{BusError, HandlerError};
pub use handler::{handler_fn, EventHandler};
pub use topic::{topic_matches, validate_segment};
