//! Reliability patterns for process execution
//!
//! This module provides:
//! - [`CircuitBreaker`] - Fail-fast guard around an unhealthy dependency
//! - [`CircuitBreakerConfig`] - Circuit breaker configuration

mod circuit_breaker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStats,
    CircuitEvent, CircuitEventKind, CircuitOpenError, CircuitPermit, CircuitState,
};
