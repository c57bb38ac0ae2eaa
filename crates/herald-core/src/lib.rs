pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::HeraldConfig;
pub use error::{HeraldError, Result};
pub use events::{topics, DomainEvent, Event};
pub use types::*;
