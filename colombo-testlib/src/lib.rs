//! Test harness for colombo integration tests.
//!
//! Provides message types with handlers, recording interceptors, stub
//! processors and transports, an in-memory response cache and an alerter
//! that keeps what it receives.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use colombo::cache::CacheError;
use colombo::{
    Alert, Alerter, BaseRequest, BaseResponse, CacheDirective, ChooseWhen, CorrelationId,
    DispatchError, HandleContext, InterceptionPriority, Interceptor, Invocation, MessageContext,
    Pipeline, Request, RequestHandler, RequestHeader, RequestKind, RequestProcessor,
    RequestTransport, Response, ResponseCache, ResponseHeader, ResponsesGroup, TypeTag,
    ValidationResult,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

/// Install a test-friendly tracing subscriber, filtered by `RUST_LOG`.
/// Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Clone, Debug, Default)]
pub struct HelloWorldRequest {
    pub header: RequestHeader,
    pub name: String,
}

impl HelloWorldRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            header: RequestHeader::new(),
            name: name.into(),
        }
    }

    pub fn with_culture(mut self, culture: &str) -> Self {
        self.header.context_mut().insert("culture", culture);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct HelloWorldResponse {
    pub header: ResponseHeader,
    pub message: String,
}

impl Request for HelloWorldRequest {
    type Response = HelloWorldResponse;

    fn header(&self) -> &RequestHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut RequestHeader {
        &mut self.header
    }

    fn validate(&self) -> Vec<ValidationResult> {
        if self.name.trim().is_empty() {
            vec![ValidationResult::new("a name is required").with_member("name")]
        } else {
            Vec::new()
        }
    }
}

impl Response for HelloWorldResponse {
    fn header(&self) -> &ResponseHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ResponseHeader {
        &mut self.header
    }
}

pub struct HelloWorldHandler;

impl RequestHandler<HelloWorldRequest> for HelloWorldHandler {
    async fn handle(
        &self,
        request: &HelloWorldRequest,
        _cx: &HandleContext<'_>,
    ) -> anyhow::Result<HelloWorldResponse> {
        Ok(HelloWorldResponse {
            message: format!("Hello, {}!", request.name),
            ..HelloWorldResponse::default()
        })
    }
}

pub struct GermanHelloWorldHandler;

impl GermanHelloWorldHandler {
    pub fn choose_when() -> ChooseWhen {
        ChooseWhen::context_contains("culture", "de-DE")
    }
}

impl RequestHandler<HelloWorldRequest> for GermanHelloWorldHandler {
    async fn handle(
        &self,
        request: &HelloWorldRequest,
        _cx: &HandleContext<'_>,
    ) -> anyhow::Result<HelloWorldResponse> {
        Ok(HelloWorldResponse {
            message: format!("Hallo, {}!", request.name),
            ..HelloWorldResponse::default()
        })
    }
}

/// A side-effect-free, cacheable request.
#[derive(Clone, Debug, Default)]
pub struct QuoteRequest {
    pub header: RequestHeader,
    pub symbol: String,
}

impl QuoteRequest {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            header: RequestHeader::new(),
            symbol: symbol.into(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct QuoteResponse {
    pub header: ResponseHeader,
    pub price: u64,
}

impl Request for QuoteRequest {
    type Response = QuoteResponse;
    const KIND: RequestKind = RequestKind::SideEffectFree;

    fn header(&self) -> &RequestHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut RequestHeader {
        &mut self.header
    }

    fn cache(&self) -> Option<CacheDirective> {
        Some(CacheDirective::new(self.symbol.clone(), Duration::from_secs(60)))
    }
}

impl Response for QuoteResponse {
    fn header(&self) -> &ResponseHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ResponseHeader {
        &mut self.header
    }
}

/// Prices every symbol by its length and counts its calls.
#[derive(Default)]
pub struct QuoteHandler {
    pub calls: AtomicUsize,
}

impl RequestHandler<QuoteRequest> for QuoteHandler {
    async fn handle(
        &self,
        request: &QuoteRequest,
        _cx: &HandleContext<'_>,
    ) -> anyhow::Result<QuoteResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(QuoteResponse {
            price: request.symbol.len() as u64 * 100,
            ..QuoteResponse::default()
        })
    }
}

/// A plain request routed by group name, for processor tests.
#[derive(Clone, Debug)]
pub struct GroupedRequest {
    pub header: RequestHeader,
    pub group: String,
}

impl GroupedRequest {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            header: RequestHeader::new(),
            group: group.into(),
        }
    }

    pub fn with_context(mut self, context: MessageContext) -> Self {
        *self.header.context_mut() = context;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct GroupedResponse {
    pub header: ResponseHeader,
}

impl Request for GroupedRequest {
    type Response = GroupedResponse;

    fn header(&self) -> &RequestHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut RequestHeader {
        &mut self.header
    }

    fn group_name(&self) -> &str {
        &self.group
    }
}

impl Response for GroupedResponse {
    fn header(&self) -> &ResponseHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ResponseHeader {
        &mut self.header
    }
}

/// A default response for `request`, carrying its correlation id.
pub fn answer(request: &dyn BaseRequest) -> Box<dyn BaseResponse> {
    let mut response = request.new_response();
    response
        .response_header_mut()
        .set_correlation_id(request.correlation_id());
    response
}

// ============================================================================
// Interceptors
// ============================================================================

/// Shared, ordered record of what happened during a test.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// Logs `<name>:before` and `<name>:after` around `proceed`. Works on any
/// pipeline.
pub struct Recorder {
    name: String,
    priority: InterceptionPriority,
    log: EventLog,
}

impl Recorder {
    pub fn new(name: impl Into<String>, priority: InterceptionPriority, log: &EventLog) -> Self {
        Self {
            name: name.into(),
            priority,
            log: log.clone(),
        }
    }
}

impl<P: Pipeline> Interceptor<P> for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> InterceptionPriority {
        self.priority
    }

    fn intercept<'a>(
        &'a self,
        invocation: &'a mut Invocation<'_, P>,
    ) -> BoxFuture<'a, colombo::Result<()>> {
        async move {
            self.log.push(format!("{}:before", self.name));
            let result = invocation.proceed().await;
            self.log.push(format!("{}:after", self.name));
            result
        }
        .boxed()
    }
}

// ============================================================================
// Processors and transports
// ============================================================================

type Claim = Box<dyn Fn(&dyn BaseRequest) -> bool + Send + Sync>;

/// A processor answering every request with a default response.
pub struct StubProcessor {
    name: String,
    claims: Claim,
    delay: Duration,
    failure: Option<String>,
    calls: AtomicUsize,
    seen: Mutex<Vec<CorrelationId>>,
}

impl StubProcessor {
    pub fn new(
        name: impl Into<String>,
        claims: impl Fn(&dyn BaseRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            claims: Box::new(claims),
            delay: Duration::ZERO,
            failure: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Claims requests whose group name is `group`.
    pub fn for_group(name: impl Into<String>, group: &str) -> Self {
        let group = group.to_string();
        Self::new(name, move |request| request.group() == group)
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every call with `message` after the delay.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Correlation ids of every request received, in arrival order.
    pub fn seen(&self) -> Vec<CorrelationId> {
        self.seen.lock().clone()
    }
}

impl RequestProcessor for StubProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_process(&self, request: &dyn BaseRequest) -> bool {
        (self.claims)(request)
    }

    fn process(
        &self,
        requests: Vec<Arc<dyn BaseRequest>>,
    ) -> BoxFuture<'_, colombo::Result<ResponsesGroup>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .extend(requests.iter().map(|request| request.correlation_id()));

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(message) = &self.failure {
                return Err(DispatchError::Processor {
                    processor: self.name.clone(),
                    source: anyhow::anyhow!("{message}"),
                });
            }

            let mut group = ResponsesGroup::with_capacity(requests.len());
            for request in &requests {
                group.insert(request.correlation_id(), answer(&**request));
            }
            Ok(group)
        }
        .boxed()
    }
}

/// A transport answering locally and remembering each exchange as
/// `(group, request count)`.
#[derive(Default)]
pub struct StubTransport {
    exchanges: Mutex<Vec<(String, usize)>>,
    failing_group: Option<String>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail exchanges for `group`.
    pub fn failing_for(group: impl Into<String>) -> Self {
        Self {
            failing_group: Some(group.into()),
            ..Self::default()
        }
    }

    pub fn exchanges(&self) -> Vec<(String, usize)> {
        let mut exchanges = self.exchanges.lock().clone();
        exchanges.sort();
        exchanges
    }
}

impl RequestTransport for StubTransport {
    fn exchange<'a>(
        &'a self,
        group: &'a str,
        requests: Vec<Arc<dyn BaseRequest>>,
    ) -> BoxFuture<'a, anyhow::Result<ResponsesGroup>> {
        self.exchanges
            .lock()
            .push((group.to_string(), requests.len()));

        let result = if self.failing_group.as_deref() == Some(group) {
            Err(anyhow::anyhow!("connection refused"))
        } else {
            let mut responses = ResponsesGroup::with_capacity(requests.len());
            for request in &requests {
                responses.insert(request.correlation_id(), answer(&**request));
            }
            Ok(responses)
        };
        futures::future::ready(result).boxed()
    }
}

// ============================================================================
// Cache and alerts
// ============================================================================

type CacheKey = (Option<String>, TypeTag, String);

/// An in-memory [`ResponseCache`] that can be switched offline.
/// Entries never expire.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, Box<dyn BaseResponse>>>,
    offline: AtomicBool,
    gets: AtomicUsize,
    stores: AtomicUsize,
    flushes: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn stores(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("memory cache is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl ResponseCache for MemoryCache {
    fn get<'a>(
        &'a self,
        segment: Option<&'a str>,
        response_type: TypeTag,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Box<dyn BaseResponse>>, CacheError>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let result = self.check().map(|()| {
            let key = (segment.map(str::to_string), response_type, key.to_string());
            self.entries.lock().get(&key).cloned()
        });
        futures::future::ready(result).boxed()
    }

    fn store<'a>(
        &'a self,
        segment: Option<&'a str>,
        key: &'a str,
        response: Box<dyn BaseResponse>,
        _ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        let result = self.check().map(|()| {
            self.stores.fetch_add(1, Ordering::SeqCst);
            let key = (
                segment.map(str::to_string),
                response.response_type(),
                key.to_string(),
            );
            self.entries.lock().insert(key, response);
        });
        futures::future::ready(result).boxed()
    }

    fn flush<'a>(
        &'a self,
        segment: Option<&'a str>,
        response_type: TypeTag,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        let result = self.check().map(|()| {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            self.entries.lock().retain(|(entry_segment, entry_type, _), _| {
                let in_segment = segment.is_none() || entry_segment.as_deref() == segment;
                !(*entry_type == response_type && in_segment)
            });
        });
        futures::future::ready(result).boxed()
    }
}

/// Keeps every alert it receives.
#[derive(Default)]
pub struct RecordingAlerter {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl Alerter for RecordingAlerter {
    fn name(&self) -> &str {
        "recording"
    }

    fn alert(&self, alert: &Alert) -> anyhow::Result<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}
