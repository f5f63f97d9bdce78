//! Harness — resilience infrastructure for the Jira API client: sliding-
//! window rate limiting and a circuit breaker around each HTTP attempt,
//! plus cooperative shutdown coordination for the daemon's background
//! loops.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod shutdown;
