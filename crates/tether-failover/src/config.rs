//! Failover configuration.
//!
//! Loaded from JSON; every field has a default so partial documents work.

use crate::strategy::SelectionStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tether_core::{Result, TetherError, TransportKind, TransportPreference};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub strategy: SelectionStrategy,
    /// Attempts per logical request, across all endpoints.
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_delay_ms: u64,
    /// Consecutive errors that mark an endpoint unhealthy and open its
    /// breaker.
    pub circuit_breaker_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    /// Route called by `health_check` with an empty body.
    pub health_check_route: String,
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            max_retries: 3,
            retry_delay_ms: 1_000,
            circuit_breaker_threshold: 5,
            recovery_timeout_ms: 30_000,
            health_check_interval_ms: 30_000,
            health_check_route: "health".to_string(),
            endpoints: Vec::new(),
        }
    }
}

/// One remote endpoint in the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub uri: String,
    /// Explicit adapter; chosen from the URI scheme when absent.
    #[serde(default)]
    pub transport: Option<TransportKind>,
    /// Route passed to `unary`/`server_stream`.
    #[serde(default)]
    pub route: String,
    /// Relative price per request, used by `cost_optimized`.
    #[serde(default)]
    pub unit_cost: f64,
    /// Overrides the adapter's connect/unary deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            transport: None,
            route: String::new(),
            unit_cost: 0.0,
            timeout_ms: None,
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn with_unit_cost(mut self, cost: f64) -> Self {
        self.unit_cost = cost;
        self
    }

    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport = Some(kind);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn preference(&self) -> TransportPreference {
        self.transport.into()
    }
}

impl FailoverConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| TetherError::Config {
            message: format!("invalid failover config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn with_circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.recovery_timeout_ms = timeout_ms;
        self
    }

    pub fn with_health_check_interval_ms(mut self, interval_ms: u64) -> Self {
        self.health_check_interval_ms = interval_ms;
        self
    }

    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Reject configurations the manager cannot run.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(TetherError::Config { message });
        if self.endpoints.is_empty() {
            return fail("at least one endpoint is required".to_string());
        }
        if self.circuit_breaker_threshold == 0 {
            return fail("circuit_breaker_threshold must be at least 1".to_string());
        }
        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            if !names.insert(endpoint.name.as_str()) {
                return fail(format!("duplicate endpoint name {:?}", endpoint.name));
            }
            if !endpoint.unit_cost.is_finite() || endpoint.unit_cost < 0.0 {
                return fail(format!(
                    "endpoint {:?} has invalid unit_cost {}",
                    endpoint.name, endpoint.unit_cost
                ));
            }
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}
