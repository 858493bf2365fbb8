//! # Resilience Module
//!
//! ## Components
//! - `CircuitBreaker`: fails price pulls fast after repeated exchange failures.

pub mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
