pub mod circuit_breaker;
pub mod health;
pub mod loadbalance;
pub mod pool;

pub use circuit_breaker::CircuitBreaker;
pub use loadbalance::{ConnGuard, LoadBalancer, Target};
pub use pool::{RetryPlan, Upstream, UpstreamStore};
