//! Endpoint health bookkeeping.

use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Health of one endpoint as seen by the failover manager.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointHealth {
    pub name: String,
    /// Cleared once `consecutive_errors` reaches the breaker threshold, set
    /// again by any success.
    pub is_healthy: bool,
    pub last_latency: Option<Duration>,
    pub consecutive_errors: u32,
    pub last_health_check: Option<Instant>,
    pub total_requests: u64,
    pub successful_requests: u64,
}

impl EndpointHealth {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_healthy: true,
            last_latency: None,
            consecutive_errors: 0,
            last_health_check: None,
            total_requests: 0,
            successful_requests: 0,
        }
    }

    pub fn record_success(&mut self, latency: Duration) {
        if !self.is_healthy {
            info!("Endpoint {} is healthy again", self.name);
        }
        self.total_requests += 1;
        self.successful_requests += 1;
        self.consecutive_errors = 0;
        self.last_latency = Some(latency);
        self.is_healthy = true;
    }

    /// Count a failure; returns true when this one made the endpoint
    /// unhealthy.
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.total_requests += 1;
        self.consecutive_errors += 1;
        if self.is_healthy && self.consecutive_errors >= threshold {
            self.is_healthy = false;
            warn!(
                "Endpoint {} marked unhealthy after {} consecutive errors",
                self.name, self.consecutive_errors
            );
            return true;
        }
        false
    }

    /// Fraction of requests that succeeded; 1.0 before any request.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    pub fn check_due(&self, interval: Duration, now: Instant) -> bool {
        match self.last_health_check {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= interval,
        }
    }
}
