mod manager;
mod quota;
pub mod scoring;

pub use manager::{
    PriorityQueueManager, QueueConfig, QueueCounters, QueueMetrics, QueueState, QueueStatus,
};
pub use quota::{QuotaGrant, QuotaLimiter};
