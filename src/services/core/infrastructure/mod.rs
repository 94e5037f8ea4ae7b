// Infrastructure primitives shared by the notification pipeline.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;
pub mod service_container;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitState, CircuitStateInfo,
};
pub use rate_limiter::{RateLimitStatus, RateLimiter, RateLimiterConfig};
pub use retry::RetryPolicy;
pub use service_container::{ServiceConfig, ServiceContainer};
