//! Notification scheduling for Herald.
//!
//! [`SchedulerCore`] makes every delivery decision from an explicit clock
//! value: immediate delivery for high and urgent messages, rolling batches
//! for the rest, and a single digest for everything held back during quiet
//! hours. [`NotificationScheduler`] wraps it for the running system,
//! publishing on `notification.new` and driving the clock from a tick loop.

pub mod engine;
pub mod error;
pub mod scheduler;

pub use engine::{Disposition, SchedulerCore, SchedulerStats};
pub use error::NotifyError;
pub use scheduler::NotificationScheduler;
