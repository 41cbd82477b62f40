//! FailoverManager - one call surface over a pool of endpoints.
//!
//! Each logical request tries endpoints strictly one after another. The
//! configured strategy picks among eligible endpoints that have not been
//! tried yet for this request; the endpoint's circuit breaker may veto the
//! attempt. Successes and failures update the endpoint's health and
//! breaker together.
//!
//! # Thread Safety
//!
//! All methods take `&self`. Every transport sits behind its own async
//! mutex, so concurrent requests that land on the same endpoint are
//! serialized on its connection.

use crate::circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
use crate::config::{EndpointConfig, FailoverConfig};
use crate::health::EndpointHealth;
use crate::retry::RetryPolicy;
use crate::strategy::Candidate;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tether_core::{
    Endpoint, Event, EventHandler, JsonPassthrough, PayloadTranslator, ProviderRequest,
    ProviderResponse, Result, StreamEnd, TetherError, Transport, TransportSelector,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

struct ManagedEndpoint {
    config: EndpointConfig,
    endpoint: Endpoint,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    health: Mutex<EndpointHealth>,
    breaker: CircuitBreaker,
}

impl ManagedEndpoint {
    fn health(&self) -> MutexGuard<'_, EndpointHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Healthy, or unhealthy with a recovery trial available.
    fn is_eligible(&self) -> bool {
        self.health().is_healthy || self.breaker.state() == CircuitState::HalfOpen
    }

    async fn unary(&self, route: &str, body: &[u8]) -> Result<Vec<u8>> {
        let mut transport = self.transport.lock().await;
        if !transport.is_connected() {
            transport.connect(&self.endpoint).await?;
        }
        transport.unary(route, body).await
    }

    async fn server_stream(
        &self,
        body: &[u8],
        handler: &mut EventHandler<'_>,
    ) -> Result<StreamEnd> {
        let mut transport = self.transport.lock().await;
        if !transport.is_connected() {
            transport.connect(&self.endpoint).await?;
        }
        transport.server_stream(&self.config.route, body, handler).await
    }
}

/// One admitted call on an endpoint. Dropping it without an outcome, as
/// when the caller's future is cancelled, hands a half-open trial back to
/// the breaker.
struct Attempt<'a> {
    ep: &'a ManagedEndpoint,
    admission: Admission,
    failure_threshold: u32,
    resolved: bool,
}

impl Attempt<'_> {
    fn succeed(mut self, latency: Duration) {
        self.resolved = true;
        self.ep.health().record_success(latency);
        self.ep.breaker.record_success();
    }

    fn fail(mut self) {
        self.resolved = true;
        self.ep.health().record_failure(self.failure_threshold);
        self.ep.breaker.record_failure();
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.admission == Admission::Trial {
            self.ep.breaker.release_trial();
        }
    }
}

/// Routes requests across endpoints with health tracking and circuit
/// breaking.
pub struct FailoverManager {
    config: FailoverConfig,
    endpoints: Vec<ManagedEndpoint>,
    /// Round-robin position.
    cursor: AtomicUsize,
    retry: RetryPolicy,
    translator: Arc<dyn PayloadTranslator>,
}

impl std::fmt::Debug for FailoverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverManager")
            .field("strategy", &self.config.strategy)
            .field("endpoints", &self.endpoint_names())
            .finish()
    }
}

impl FailoverManager {
    /// Pair each configured endpoint with an adapter, in order. Adapters are
    /// connected lazily on first use.
    pub fn new(config: FailoverConfig, transports: Vec<Box<dyn Transport>>) -> Result<Self> {
        config.validate()?;
        if transports.len() != config.endpoints.len() {
            return Err(TetherError::Config {
                message: format!(
                    "{} endpoints configured but {} transports supplied",
                    config.endpoints.len(),
                    transports.len()
                ),
            });
        }

        let breaker_config = CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_threshold,
            recovery_timeout: config.recovery_timeout(),
        };
        let endpoints = config
            .endpoints
            .iter()
            .cloned()
            .zip(transports)
            .map(|(endpoint_config, transport)| {
                let endpoint = Endpoint::parse(&endpoint_config.uri)?;
                Ok(ManagedEndpoint {
                    health: Mutex::new(EndpointHealth::new(endpoint_config.name.clone())),
                    breaker: CircuitBreaker::with_config(
                        endpoint_config.name.clone(),
                        breaker_config.clone(),
                    ),
                    transport: tokio::sync::Mutex::new(transport),
                    endpoint,
                    config: endpoint_config,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Failover manager ready: {} endpoints, strategy {}, {} attempts",
            endpoints.len(),
            config.strategy,
            config.max_retries
        );
        Ok(Self {
            retry: RetryPolicy::from_config(&config),
            config,
            endpoints,
            cursor: AtomicUsize::new(0),
            translator: Arc::new(JsonPassthrough),
        })
    }

    /// Build every endpoint's adapter through `selector`, applying the
    /// endpoint's transport preference and timeout.
    pub fn from_config(config: FailoverConfig, selector: &TransportSelector) -> Result<Self> {
        config.validate()?;
        let transports = config
            .endpoints
            .iter()
            .map(|endpoint_config| {
                let endpoint = Endpoint::parse(&endpoint_config.uri)?;
                let mut options = selector.options().clone();
                if let Some(timeout_ms) = endpoint_config.timeout_ms {
                    options = options.with_timeout_ms(timeout_ms);
                }
                let selector = selector.clone().with_options(options);
                let kind = selector.resolve(&endpoint, endpoint_config.preference());
                debug!("Endpoint {} uses {} transport", endpoint_config.name, kind);
                Ok(selector.build(kind))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(config, transports)
    }

    pub fn with_translator(mut self, translator: Arc<dyn PayloadTranslator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub fn endpoint_names(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.config.name.as_str()).collect()
    }

    /// Index of the endpoint the strategy picks next.
    pub fn select(&self) -> usize {
        self.select_excluding(&[])
    }

    fn select_excluding(&self, tried: &[usize]) -> usize {
        let eligible: Vec<Candidate> = self
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, ep)| ep.is_eligible())
            .map(|(index, ep)| Candidate {
                index,
                latency: ep.health().last_latency,
                unit_cost: ep.config.unit_cost,
            })
            .collect();
        let untried: Vec<Candidate> = eligible
            .iter()
            .filter(|c| !tried.contains(&c.index))
            .copied()
            .collect();
        let pool = if untried.is_empty() { &eligible } else { &untried };

        self.config
            .strategy
            .pick(pool, &self.cursor, self.endpoints.len())
            .unwrap_or_else(|| {
                debug!("No eligible endpoint, falling back to index 0");
                0
            })
    }

    fn admit<'a>(&self, ep: &'a ManagedEndpoint) -> Option<Attempt<'a>> {
        ep.breaker.admit().map(|admission| Attempt {
            ep,
            admission,
            failure_threshold: self.config.circuit_breaker_threshold,
            resolved: false,
        })
    }

    /// Pick the next endpoint for this request, or record a breaker veto.
    fn claim(&self, tried: &mut Vec<usize>) -> Result<Attempt<'_>> {
        let index = self.select_excluding(tried);
        tried.push(index);
        let ep = &self.endpoints[index];
        self.admit(ep).ok_or_else(|| {
            debug!("Circuit open for {}, attempt rejected", ep.config.name);
            TetherError::CircuitBreakerOpen {
                endpoint: ep.config.name.clone(),
            }
        })
    }

    fn exhausted(&self, attempts: u32, last_error: Option<TetherError>) -> TetherError {
        match last_error {
            Some(e) => {
                error!("All {} failover attempts exhausted. Last error: {}", attempts, e);
                e
            }
            None => TetherError::AllEndpointsFailed {
                attempts,
                last_error: "no attempt was made".to_string(),
            },
        }
    }

    /// Unary request with failover.
    pub async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let attempts = self.config.max_retries;
        let mut tried = Vec::new();
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay_for(attempt - 1)).await;
            }
            let call = match self.claim(&mut tried) {
                Ok(call) => call,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            let ep = call.ep;
            let name = ep.config.name.as_str();

            let started = Instant::now();
            let result = match self.translator.encode_request(name, request) {
                Ok(body) => match ep.unary(&ep.config.route, &body).await {
                    Ok(bytes) => self.translator.decode_response(name, &bytes),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(response) => {
                    call.succeed(started.elapsed());
                    if attempt > 0 {
                        info!("Request succeeded on {} after {} attempts", name, attempt + 1);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    call.fail();
                    warn!("Attempt {}/{} on {} failed: {}", attempt + 1, attempts, name, e);
                    last_error = Some(e);
                }
            }
        }
        Err(self.exhausted(attempts, last_error))
    }

    /// Streaming request with failover.
    ///
    /// Events pass through the translator before reaching `handler`. Once
    /// any event has been delivered, a failure is returned as is instead of
    /// being retried elsewhere.
    pub async fn stream(
        &self,
        request: &ProviderRequest,
        handler: &mut EventHandler<'_>,
    ) -> Result<StreamEnd> {
        let attempts = self.config.max_retries;
        let mut tried = Vec::new();
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay_for(attempt - 1)).await;
            }
            let call = match self.claim(&mut tried) {
                Ok(call) => call,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            let ep = call.ep;
            let name = ep.config.name.as_str();

            let mut delivered = false;
            let started = Instant::now();
            let result = match self.translator.encode_request(name, request) {
                Ok(body) => {
                    let translator = &self.translator;
                    let mut forward = |event: Event| {
                        delivered = true;
                        handler(translator.translate_event(name, event));
                    };
                    ep.server_stream(&body, &mut forward).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(end) => {
                    call.succeed(started.elapsed());
                    return Ok(end);
                }
                Err(e) => {
                    call.fail();
                    if delivered {
                        warn!("Stream from {} failed mid-stream: {}", name, e);
                        return Err(e);
                    }
                    warn!("Attempt {}/{} on {} failed: {}", attempt + 1, attempts, name, e);
                    last_error = Some(e);
                }
            }
        }
        Err(self.exhausted(attempts, last_error))
    }

    /// Check every endpoint whose last check is older than the configured
    /// interval. Returns the number of endpoints checked.
    pub async fn health_check(&self) -> usize {
        let interval = self.config.health_check_interval();
        let route = self.config.health_check_route.as_str();
        let mut checked = 0;

        for ep in &self.endpoints {
            let now = Instant::now();
            {
                let mut health = ep.health();
                if !health.check_due(interval, now) {
                    continue;
                }
                health.last_health_check = Some(now);
            }
            let Some(call) = self.admit(ep) else {
                debug!("Skipping health check of {}: circuit open", ep.config.name);
                continue;
            };

            checked += 1;
            let started = Instant::now();
            match ep.unary(route, &[]).await {
                Ok(_) => {
                    debug!("Health check of {} succeeded", ep.config.name);
                    call.succeed(started.elapsed());
                }
                Err(e) => {
                    warn!("Health check of {} failed: {}", ep.config.name, e);
                    call.fail();
                }
            }
        }
        checked
    }

    /// Run `health_check` on a fixed interval until the handle is aborted.
    pub fn spawn_health_checks(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = manager
            .config
            .health_check_interval()
            .max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let checked = manager.health_check().await;
                debug!("Health check round checked {} endpoints", checked);
            }
        })
    }

    pub fn health_snapshot(&self) -> Vec<EndpointHealth> {
        self.endpoints.iter().map(|ep| ep.health().clone()).collect()
    }

    pub fn breaker_state(&self, index: usize) -> Option<CircuitState> {
        self.endpoints.get(index).map(|ep| ep.breaker.state())
    }

    pub fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        self.endpoints.iter().map(|ep| ep.breaker.stats()).collect()
    }

    /// Disconnect every endpoint's transport.
    pub async fn disconnect_all(&self) {
        for ep in &self.endpoints {
            let mut transport = ep.transport.lock().await;
            if let Err(e) = transport.disconnect().await {
                debug!("Disconnect of {} failed: {}", ep.config.name, e);
            }
        }
    }
}
