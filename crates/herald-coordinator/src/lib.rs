//! Multi-step command coordination for Herald.
//!
//! A compound instruction ("find the report from Alice, then email it to
//! Bob") is decomposed into [`SubTask`]s linked by `depends_on`, then driven
//! through a monotonic state machine. Steps run as soon as their dependency
//! completes, results flow forward through a shared state map, and each
//! command ends with exactly one [`CommandReport`].

pub mod coordinator;
pub mod decompose;
pub mod error;
pub mod executor;
pub mod state_machine;
pub mod template;
pub mod types;

pub use coordinator::{ActiveCommand, CancelHandle, Coordinator};
pub use decompose::Decomposer;
pub use error::CoordinatorError;
pub use executor::{BusExecutor, RegistryExecutor, SubTaskExecutor};
pub use types::{
    CommandReport, CommandStatus, CompoundCommand, CoordinatorStats, SubTask, SubTaskStatus,
};
