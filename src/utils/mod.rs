pub mod circuit_breaker;
pub mod retry;
pub mod tasks;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerManager,
    CircuitSnapshot, CircuitState, RouteKey,
};
pub use retry::{retry_on_transient, BackoffPolicy, IsTransient, RetryResult};
pub use tasks::BackgroundTasks;
