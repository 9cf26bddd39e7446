pub mod circuit_breaker;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod extract;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
