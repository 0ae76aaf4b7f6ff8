mod manager;
mod record;

pub use manager::{RedeliveryOutcome, RetryConfig, RetryDispatcher, RetryManager, RetryMetrics};
pub use record::{RetryRecord, RetryStatus};
