//! Tether Failover - one request surface over several tether endpoints.
//!
//! [`FailoverManager`] owns a pool of endpoints, each with its own
//! transport, health record and circuit breaker. A selection strategy picks
//! the endpoint for each attempt; failed attempts move on to an endpoint
//! not yet tried for that request.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::{ProviderRequest, TransportOptions, TransportSelector};
//! use tether_failover::{EndpointConfig, FailoverConfig, FailoverManager, SelectionStrategy};
//!
//! let config = FailoverConfig::default()
//!     .with_strategy(SelectionStrategy::LeastLatency)
//!     .with_endpoint(
//!         EndpointConfig::new("primary", "grpc://10.0.0.1:50051").with_route("/llm.Llm/Complete"),
//!     )
//!     .with_endpoint(EndpointConfig::new("backup", "wss://backup.example/chat"));
//! let selector = TransportSelector::new(TransportOptions::new());
//! let manager = FailoverManager::from_config(config, &selector)?;
//! let response = manager.complete(&ProviderRequest::new("m", "hello")).await?;
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod health;
pub mod manager;
pub mod retry;
pub mod strategy;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use config::{EndpointConfig, FailoverConfig};
pub use health::EndpointHealth;
pub use manager::FailoverManager;
pub use retry::RetryPolicy;
pub use strategy::{Candidate, SelectionStrategy};
