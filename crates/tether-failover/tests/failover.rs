use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{
    CloseHandle, Endpoint, Event, EventHandler, Frame, PayloadTranslator, PipeDispatch,
    PipeServer, ProviderRequest, ProviderResponse, StreamEnd, TetherError, Transport,
    TransportKind, TransportOptions, TransportSelector,
};
use tether_failover::{
    CircuitState, EndpointConfig, FailoverConfig, FailoverManager, SelectionStrategy,
};
use tokio::sync::mpsc;

type Reply = Result<&'static str, fn() -> TetherError>;

fn refused() -> TetherError {
    TetherError::ConnectionFailed {
        endpoint: "mock".to_string(),
        message: "refused".to_string(),
    }
}

fn bad_request() -> TetherError {
    TetherError::HttpStatus {
        status: 400,
        body: "bad".to_string(),
    }
}

fn dropped() -> TetherError {
    TetherError::ConnectionClosed
}

fn handler_failed() -> TetherError {
    TetherError::Other("handler failed".to_string())
}

/// Counters shared between a test and its mock transport.
#[derive(Default)]
struct Counters {
    calls: AtomicUsize,
    connects: AtomicUsize,
    routes: Mutex<Vec<String>>,
}

impl Counters {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Answers from a script, then from a fixed fallback reply.
struct MockTransport {
    counters: Arc<Counters>,
    script: VecDeque<Reply>,
    fallback: Reply,
    stream_events: Vec<Event>,
    delay: Duration,
    connected: bool,
    close: CloseHandle,
}

impl MockTransport {
    fn new(fallback: Reply) -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let transport = Self {
            counters: Arc::clone(&counters),
            script: VecDeque::new(),
            fallback,
            stream_events: Vec::new(),
            delay: Duration::ZERO,
            connected: false,
            close: CloseHandle::new(),
        };
        (transport, counters)
    }

    fn ok(body: &'static str) -> (Self, Arc<Counters>) {
        Self::new(Ok(body))
    }

    fn failing(error: fn() -> TetherError) -> (Self, Arc<Counters>) {
        Self::new(Err(error))
    }

    fn then(mut self, reply: Reply) -> Self {
        self.script.push_back(reply);
        self
    }

    fn with_stream_events(mut self, events: Vec<Event>) -> Self {
        self.stream_events = events;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn next_reply(&mut self, route: &str) -> Reply {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        self.counters.routes.lock().unwrap().push(route.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.script.pop_front().unwrap_or(self.fallback)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn connect(&mut self, _endpoint: &Endpoint) -> tether_core::Result<()> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        self.connected = true;
        Ok(())
    }

    async fn unary(&mut self, route: &str, _request: &[u8]) -> tether_core::Result<Vec<u8>> {
        match self.next_reply(route).await {
            Ok(body) => Ok(body.as_bytes().to_vec()),
            Err(error) => Err(error()),
        }
    }

    async fn server_stream(
        &mut self,
        route: &str,
        _request: &[u8],
        handler: &mut EventHandler<'_>,
    ) -> tether_core::Result<StreamEnd> {
        let reply = self.next_reply(route).await;
        for event in self.stream_events.clone() {
            handler(event);
        }
        match reply {
            Ok(_) => {
                handler(Event::Done);
                Ok(StreamEnd::Completed)
            }
            Err(error) => Err(error()),
        }
    }

    async fn disconnect(&mut self) -> tether_core::Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }
}

fn config(names: &[&str]) -> FailoverConfig {
    names.iter().fold(
        FailoverConfig::default().with_retry_delay_ms(0),
        |config, name| {
            config.with_endpoint(EndpointConfig::new(*name, format!("tcp://{}:9000", name)))
        },
    )
}

fn manager(config: FailoverConfig, transports: Vec<MockTransport>) -> FailoverManager {
    let boxed = transports
        .into_iter()
        .map(|t| Box::new(t) as Box<dyn Transport>)
        .collect();
    FailoverManager::new(config, boxed).unwrap()
}

fn request() -> ProviderRequest {
    ProviderRequest::new("model", "hello")
}

#[tokio::test]
async fn round_robin_spreads_requests_evenly() {
    let (a, pa) = MockTransport::ok("a");
    let (b, pb) = MockTransport::ok("b");
    let (c, pc) = MockTransport::ok("c");
    let manager = manager(
        config(&["a", "b", "c"]).with_strategy(SelectionStrategy::RoundRobin),
        vec![a, b, c],
    );

    let mut texts = Vec::new();
    for _ in 0..6 {
        texts.push(manager.complete(&request()).await.unwrap().text);
    }

    assert_eq!(texts, vec!["a", "b", "c", "a", "b", "c"]);
    assert_eq!((pa.calls(), pb.calls(), pc.calls()), (2, 2, 2));
    // Connected once, lazily
    assert_eq!(pa.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn round_robin_select_visits_each_endpoint_once() {
    let transports = (0..4).map(|_| MockTransport::ok("x").0).collect();
    let manager = manager(
        config(&["a", "b", "c", "d"]).with_strategy(SelectionStrategy::RoundRobin),
        transports,
    );

    let picks: Vec<usize> = (0..4).map(|_| manager.select()).collect();
    assert_eq!(picks, vec![0, 1, 2, 3]);
    assert_eq!(manager.select(), 0);
}

#[tokio::test]
async fn priority_order_fails_over_to_next_endpoint() {
    let (primary, pp) = MockTransport::failing(refused);
    let (backup, pb) = MockTransport::ok("from backup");
    let manager = manager(
        config(&["primary", "backup"]).with_max_retries(2),
        vec![primary, backup],
    );

    let response = manager.complete(&request()).await.unwrap();
    assert_eq!(response.text, "from backup");
    assert_eq!((pp.calls(), pb.calls()), (1, 1));

    let health = manager.health_snapshot();
    assert_eq!(health[0].consecutive_errors, 1);
    assert!(health[0].is_healthy);
    assert_eq!(health[1].successful_requests, 1);
    assert!(health[1].last_latency.is_some());
}

#[tokio::test]
async fn exhausted_attempts_return_last_error() {
    let (a, _) = MockTransport::failing(refused);
    let (b, _) = MockTransport::failing(dropped);
    let manager = manager(config(&["a", "b"]).with_max_retries(2), vec![a, b]);

    let err = manager.complete(&request()).await.unwrap_err();
    assert!(matches!(err, TetherError::ConnectionClosed));
}

#[tokio::test]
async fn zero_attempts_report_all_endpoints_failed() {
    let (a, pa) = MockTransport::ok("a");
    let manager = manager(config(&["a"]).with_max_retries(0), vec![a]);

    let err = manager.complete(&request()).await.unwrap_err();
    assert!(matches!(err, TetherError::AllEndpointsFailed { attempts: 0, .. }));
    assert_eq!(pa.calls(), 0);
}

#[tokio::test]
async fn any_endpoint_error_fails_over() {
    let (a, pa) = MockTransport::failing(bad_request);
    let (b, pb) = MockTransport::failing(handler_failed);
    let (c, pc) = MockTransport::ok("c");
    let manager = manager(config(&["a", "b", "c"]).with_max_retries(3), vec![a, b, c]);

    let response = manager.complete(&request()).await.unwrap();
    assert_eq!(response.text, "c");
    assert_eq!((pa.calls(), pb.calls(), pc.calls()), (1, 1, 1));

    let health = manager.health_snapshot();
    assert_eq!(health[0].consecutive_errors, 1);
    assert_eq!(health[1].consecutive_errors, 1);
}

#[tokio::test]
async fn stream_fails_over_on_client_error() {
    let (a, pa) = MockTransport::failing(bad_request);
    let (b, pb) = MockTransport::ok("");
    let manager = manager(
        config(&["a", "b"]),
        vec![a, b.with_stream_events(vec![Event::token("hi")])],
    );

    let mut events = Vec::new();
    let end = manager
        .stream(&request(), &mut |event| events.push(event))
        .await
        .unwrap();

    assert_eq!(end, StreamEnd::Completed);
    assert_eq!(events, vec![Event::token("hi"), Event::Done]);
    assert_eq!((pa.calls(), pb.calls()), (1, 1));
}

#[tokio::test]
async fn breaker_opens_after_threshold_and_rejects() {
    let (a, pa) = MockTransport::failing(refused);
    let manager = manager(
        config(&["a"]).with_max_retries(1).with_circuit_breaker_threshold(3),
        vec![a],
    );

    for _ in 0..2 {
        manager.complete(&request()).await.unwrap_err();
        assert_eq!(manager.breaker_state(0), Some(CircuitState::Closed));
    }
    manager.complete(&request()).await.unwrap_err();
    assert_eq!(manager.breaker_state(0), Some(CircuitState::Open));
    assert!(!manager.health_snapshot()[0].is_healthy);

    // Open circuit: no call reaches the transport
    let err = manager.complete(&request()).await.unwrap_err();
    assert!(matches!(err, TetherError::CircuitBreakerOpen { ref endpoint } if endpoint == "a"));
    assert_eq!(pa.calls(), 3);
    assert_eq!(manager.breaker_stats()[0].total_failures, 3);
}

#[tokio::test]
async fn breaker_rejection_consumes_an_attempt() {
    let (a, pa) = MockTransport::failing(refused);
    let manager = manager(
        config(&["a"]).with_max_retries(3).with_circuit_breaker_threshold(1),
        vec![a],
    );

    let err = manager.complete(&request()).await.unwrap_err();
    assert!(matches!(err, TetherError::CircuitBreakerOpen { .. }));
    assert_eq!(pa.calls(), 1);
    assert_eq!(manager.health_snapshot()[0].consecutive_errors, 1);
}

#[tokio::test]
async fn half_open_trial_recovers_endpoint() {
    let (a, pa) = MockTransport::ok("back");
    let a = a.then(Err(refused));
    let manager = manager(
        config(&["a"])
            .with_max_retries(1)
            .with_circuit_breaker_threshold(1)
            .with_recovery_timeout_ms(50),
        vec![a],
    );

    manager.complete(&request()).await.unwrap_err();
    assert_eq!(manager.breaker_state(0), Some(CircuitState::Open));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(manager.breaker_state(0), Some(CircuitState::HalfOpen));

    let response = manager.complete(&request()).await.unwrap();
    assert_eq!(response.text, "back");
    assert_eq!(manager.breaker_state(0), Some(CircuitState::Closed));
    assert!(manager.health_snapshot()[0].is_healthy);
    assert_eq!(pa.calls(), 2);
}

#[tokio::test]
async fn cancelled_half_open_call_releases_the_trial_slot() {
    let (a, pa) = MockTransport::ok("back");
    let a = a.then(Err(refused)).with_delay(Duration::from_millis(100));
    let manager = manager(
        config(&["a"])
            .with_max_retries(1)
            .with_circuit_breaker_threshold(1)
            .with_recovery_timeout_ms(50),
        vec![a],
    );

    manager.complete(&request()).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(manager.breaker_state(0), Some(CircuitState::HalfOpen));

    // Caller gives up while the half-open call is in flight
    let cancelled =
        tokio::time::timeout(Duration::from_millis(10), manager.complete(&request())).await;
    assert!(cancelled.is_err());
    assert_eq!(manager.breaker_state(0), Some(CircuitState::HalfOpen));

    let response = manager.complete(&request()).await.unwrap();
    assert_eq!(response.text, "back");
    assert_eq!(manager.breaker_state(0), Some(CircuitState::Closed));
    assert_eq!(pa.calls(), 3);
}

#[tokio::test]
async fn unhealthy_endpoint_is_skipped_by_selection() {
    let (a, pa) = MockTransport::failing(refused);
    let (b, pb) = MockTransport::ok("b");
    let manager = manager(
        config(&["a", "b"]).with_max_retries(2).with_circuit_breaker_threshold(1),
        vec![a, b],
    );

    manager.complete(&request()).await.unwrap();
    assert_eq!(manager.select(), 1);
    manager.complete(&request()).await.unwrap();
    assert_eq!((pa.calls(), pb.calls()), (1, 2));
}

#[tokio::test]
async fn cost_optimized_prefers_cheapest_endpoint() {
    let (a, pa) = MockTransport::ok("a");
    let (b, pb) = MockTransport::failing(refused);
    let config = FailoverConfig::default()
        .with_retry_delay_ms(0)
        .with_max_retries(2)
        .with_strategy(SelectionStrategy::CostOptimized)
        .with_endpoint(EndpointConfig::new("pricey", "tcp://a:1").with_unit_cost(0.9))
        .with_endpoint(EndpointConfig::new("cheap", "tcp://b:1").with_unit_cost(0.1));
    let manager = manager(config, vec![a, b]);

    assert_eq!(manager.select(), 1);
    // Cheap endpoint fails, the request moves to the untried one
    let response = manager.complete(&request()).await.unwrap();
    assert_eq!(response.text, "a");
    assert_eq!((pa.calls(), pb.calls()), (1, 1));
}

#[tokio::test]
async fn least_latency_follows_measurements() {
    let (slow, ps) = MockTransport::ok("slow");
    let (fast, pf) = MockTransport::ok("fast");
    let manager = manager(
        config(&["slow", "fast"]).with_strategy(SelectionStrategy::LeastLatency),
        vec![
            slow.with_delay(Duration::from_millis(60)),
            fast.with_delay(Duration::from_millis(5)),
        ],
    );

    // Unmeasured endpoints count as zero latency, so both get tried first
    assert_eq!(manager.complete(&request()).await.unwrap().text, "slow");
    assert_eq!(manager.complete(&request()).await.unwrap().text, "fast");
    assert_eq!(manager.complete(&request()).await.unwrap().text, "fast");
    assert_eq!((ps.calls(), pf.calls()), (1, 2));
}

#[tokio::test(start_paused = true)]
async fn retry_delay_separates_attempts() {
    let (a, _) = MockTransport::failing(refused);
    let (b, _) = MockTransport::ok("b");
    let manager = manager(
        config(&["a", "b"]).with_max_retries(2).with_retry_delay_ms(1_000),
        vec![a, b],
    );

    let started = tokio::time::Instant::now();
    manager.complete(&request()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(1_000));
}

struct Tagged;

impl PayloadTranslator for Tagged {
    fn encode_request(
        &self,
        _endpoint: &str,
        request: &ProviderRequest,
    ) -> tether_core::Result<Vec<u8>> {
        Ok(request.prompt.as_bytes().to_vec())
    }

    fn decode_response(
        &self,
        endpoint: &str,
        body: &[u8],
    ) -> tether_core::Result<ProviderResponse> {
        Ok(ProviderResponse {
            text: format!("{}:{}", endpoint, String::from_utf8_lossy(body)),
            ..Default::default()
        })
    }

    fn translate_event(&self, endpoint: &str, event: Event) -> Event {
        match event {
            Event::Token { text } => Event::token(format!("{}:{}", endpoint, text)),
            other => other,
        }
    }
}

#[tokio::test]
async fn stream_fails_over_before_first_event() {
    let (a, pa) = MockTransport::failing(refused);
    let (b, pb) = MockTransport::ok("");
    let manager = manager(
        config(&["a", "b"]),
        vec![a, b.with_stream_events(vec![Event::token("hi")])],
    )
    .with_translator(Arc::new(Tagged));

    let mut events = Vec::new();
    let end = manager
        .stream(&request(), &mut |event| events.push(event))
        .await
        .unwrap();

    assert_eq!(end, StreamEnd::Completed);
    assert_eq!(events, vec![Event::token("b:hi"), Event::Done]);
    assert_eq!((pa.calls(), pb.calls()), (1, 1));
}

#[tokio::test]
async fn stream_does_not_retry_after_delivery() {
    let (a, pa) = MockTransport::failing(dropped);
    let (b, pb) = MockTransport::ok("");
    let manager = manager(
        config(&["a", "b"]),
        vec![a.with_stream_events(vec![Event::token("partial")]), b],
    );

    let mut events = Vec::new();
    let err = manager
        .stream(&request(), &mut |event| events.push(event))
        .await
        .unwrap_err();

    assert!(matches!(err, TetherError::ConnectionClosed));
    assert_eq!(events, vec![Event::token("partial")]);
    assert_eq!((pa.calls(), pb.calls()), (1, 0));
    assert_eq!(manager.health_snapshot()[0].consecutive_errors, 1);
}

#[tokio::test]
async fn health_check_visits_due_endpoints() {
    let (a, pa) = MockTransport::ok("ok");
    let (b, _) = MockTransport::failing(refused);
    let manager = manager(
        config(&["a", "b"])
            .with_circuit_breaker_threshold(1)
            .with_health_check_interval_ms(60_000),
        vec![a, b],
    );

    assert_eq!(manager.health_check().await, 2);
    assert_eq!(pa.routes.lock().unwrap().as_slice(), ["health"]);

    let health = manager.health_snapshot();
    assert!(health[0].is_healthy && health[0].last_health_check.is_some());
    assert!(!health[1].is_healthy);
    assert_eq!(manager.breaker_state(1), Some(CircuitState::Open));

    // Nothing due yet
    assert_eq!(manager.health_check().await, 0);
}

#[tokio::test]
async fn background_health_checks_run_on_interval() {
    let (a, pa) = MockTransport::ok("ok");
    let manager = Arc::new(manager(
        config(&["a"]).with_health_check_interval_ms(20),
        vec![a],
    ));

    let handle = manager.spawn_health_checks();
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.abort();

    assert!(pa.calls() >= 2, "expected repeated checks, got {}", pa.calls());
}

#[tokio::test]
async fn new_rejects_mismatched_transports() {
    let (a, _) = MockTransport::ok("a");
    let transports = vec![Box::new(a) as Box<dyn Transport>];
    let result = FailoverManager::new(config(&["a", "b"]), transports);
    assert!(matches!(result, Err(TetherError::Config { .. })));
}

/// Echo and health routes plus a two-token stream.
struct Backend;

#[async_trait]
impl PipeDispatch for Backend {
    async fn unary(&self, route: &str, body: Vec<u8>) -> tether_core::Result<Vec<u8>> {
        match route {
            "echo" => Ok(body),
            "health" => Ok(b"ok".to_vec()),
            _ => Err(TetherError::Other(format!("no route {}", route))),
        }
    }

    async fn stream(
        &self,
        _route: &str,
        _body: Vec<u8>,
        frames: mpsc::Sender<Frame>,
    ) -> tether_core::Result<()> {
        for text in ["one", "two"] {
            if frames.send(Frame::new("s", Event::token(text))).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn from_config_builds_real_adapters() {
    let server = PipeServer::start(Arc::new(Backend)).await.unwrap();
    let uri = format!("pipe://{}", server.addr());
    let config = FailoverConfig::default()
        .with_endpoint(
            EndpointConfig::new("local", uri)
                .with_route("echo")
                .with_timeout_ms(2_000),
        );
    let selector = TransportSelector::new(TransportOptions::new());
    let manager = FailoverManager::from_config(config, &selector).unwrap();

    let response = manager.complete(&request()).await.unwrap();
    assert!(response.text.contains("\"prompt\":\"hello\""));

    let mut tokens = Vec::new();
    let end = manager
        .stream(&request(), &mut |event| {
            if let Event::Token { text } = event {
                tokens.push(text);
            }
        })
        .await
        .unwrap();
    assert_eq!(end, StreamEnd::Completed);
    assert_eq!(tokens, vec!["one", "two"]);

    assert_eq!(manager.health_check().await, 1);
    assert!(manager.health_snapshot()[0].is_healthy);
    manager.disconnect_all().await;
}
