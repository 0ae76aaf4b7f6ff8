pub mod clock;
pub mod config;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod store;
pub mod utils;

pub use config::HubConfig;
pub use error::{HubError, Result};
pub use hub::{MessageHub, PublishOutcome};
