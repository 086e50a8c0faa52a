//! Interceptor chains: ordering, short-circuiting and the built-in
//! interceptors (SLA, context, validation, cache).

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use assert_matches::assert_matches;
use colombo::{
    Alert, BaseResponse, ColomboBuilder, ColomboConfig, CorrelationId, DispatchError,
    HandleContext, HandlePipeline, InterceptionPriority, Interceptor, Invocation, Request,
    RequestHandler, RequestHeader, Response, ResponseHeader, ResponsesGroup, SendPipeline,
    TypeTag,
};
use colombo_testlib::{
    EventLog, GroupedRequest, HelloWorldHandler, HelloWorldRequest, MemoryCache, QuoteHandler,
    QuoteRequest, QuoteResponse, RecordingAlerter, Recorder, StubProcessor, answer, init_tracing,
};
use futures::FutureExt;
use futures::future::BoxFuture;

#[tokio::test]
async fn interceptors_run_by_priority_then_registration() -> anyhow::Result<()> {
    init_tracing();
    let log = EventLog::new();
    let colombo = ColomboBuilder::new()
        .request_handler::<HelloWorldRequest, _>(HelloWorldHandler)
        .send_interceptor(Recorder::new("low", InterceptionPriority::LOW, &log))
        .send_interceptor(Recorder::new("tie-a", InterceptionPriority::MEDIUM, &log))
        .send_interceptor(Recorder::new("high", InterceptionPriority::HIGH, &log))
        .send_interceptor(Recorder::new("tie-b", InterceptionPriority::MEDIUM, &log))
        .handle_interceptor(Recorder::new("handle", InterceptionPriority::MEDIUM, &log))
        .build()?;

    assert_eq!(
        colombo.bus().interceptor_names(),
        vec!["sla", "required-context", "high", "tie-a", "tie-b", "low"]
    );
    assert_eq!(
        colombo.handle_dispatcher().interceptor_names(),
        vec!["validation", "handle"]
    );

    colombo.bus().send(HelloWorldRequest::new("Foo")).await?;

    assert_eq!(
        log.snapshot(),
        vec![
            "high:before",
            "tie-a:before",
            "tie-b:before",
            "low:before",
            "handle:before",
            "handle:after",
            "low:after",
            "tie-b:after",
            "tie-a:after",
            "high:after",
        ]
    );
    Ok(())
}

/// Answers every request itself without proceeding.
struct Canned;

impl Interceptor<SendPipeline> for Canned {
    fn name(&self) -> &str {
        "canned"
    }

    fn intercept<'a>(
        &'a self,
        invocation: &'a mut Invocation<'_, SendPipeline>,
    ) -> BoxFuture<'a, colombo::Result<()>> {
        async move {
            let mut responses = ResponsesGroup::new();
            for request in invocation.input() {
                responses.insert(request.correlation_id(), answer(&**request));
            }
            invocation.set_output(responses);
            Ok(())
        }
        .boxed()
    }
}

#[tokio::test]
async fn short_circuit_skips_inner_steps() -> anyhow::Result<()> {
    let log = EventLog::new();
    let stub = Arc::new(StubProcessor::new("everything", |_| true));
    let colombo = ColomboBuilder::new()
        .without_local_processor()
        .processor(stub.clone())
        .send_interceptor(Recorder::new("outer", InterceptionPriority::HIGH, &log))
        .send_interceptor(Canned)
        .send_interceptor(Recorder::new("inner", InterceptionPriority::LOW, &log))
        .build()?;

    let request = GroupedRequest::new("anything");
    let correlation_id = request.correlation_id();
    let response = colombo.bus().send(request).await?;

    assert_eq!(response.header.correlation_id(), Some(correlation_id));
    assert_eq!(stub.calls(), 0);
    assert_eq!(log.snapshot(), vec!["outer:before", "outer:after"]);
    Ok(())
}

/// Answers on the handling side with a response stamped for another request.
struct Replay;

impl Interceptor<HandlePipeline> for Replay {
    fn name(&self) -> &str {
        "replay"
    }

    fn intercept<'a>(
        &'a self,
        invocation: &'a mut Invocation<'_, HandlePipeline>,
    ) -> BoxFuture<'a, colombo::Result<()>> {
        async move {
            let mut response: Box<dyn BaseResponse> = invocation.input().new_response();
            response
                .response_header_mut()
                .set_correlation_id(CorrelationId::new());
            invocation.set_output(response);
            Ok(())
        }
        .boxed()
    }
}

#[tokio::test]
async fn handle_short_circuit_answers_with_the_request_id() -> anyhow::Result<()> {
    let colombo = ColomboBuilder::new()
        .request_handler::<HelloWorldRequest, _>(HelloWorldHandler)
        .handle_interceptor(Replay)
        .build()?;

    let direct = HelloWorldRequest::new("Direct");
    let correlation_id = direct.correlation_id();
    let response = colombo.handle_dispatcher().handle_typed(direct).await?;
    assert_eq!(response.header.correlation_id(), Some(correlation_id));

    let mut batch = colombo.bus().batch();
    let first = batch.add(HelloWorldRequest::new("Foo"));
    let second = batch.add(HelloWorldRequest::new("Bar"));
    let responses = batch.send().await?;
    assert!(responses.get_key(first).is_ok());
    assert!(responses.get_key(second).is_ok());
    Ok(())
}

/// Consumes the chain without producing anything.
struct Swallow;

impl Interceptor<SendPipeline> for Swallow {
    fn intercept<'a>(
        &'a self,
        _invocation: &'a mut Invocation<'_, SendPipeline>,
    ) -> BoxFuture<'a, colombo::Result<()>> {
        async { Ok(()) }.boxed()
    }
}

#[tokio::test]
async fn chain_without_output_is_an_error() -> anyhow::Result<()> {
    let colombo = ColomboBuilder::new()
        .request_handler::<HelloWorldRequest, _>(HelloWorldHandler)
        .send_interceptor(Swallow)
        .build()?;

    let error = colombo.bus().send(HelloWorldRequest::new("Foo")).await.unwrap_err();
    assert_matches!(error, DispatchError::NoOutput { pipeline: "send" });
    Ok(())
}

#[tokio::test]
async fn validation_failures_skip_the_handler() -> anyhow::Result<()> {
    let colombo = ColomboBuilder::new()
        .request_handler::<HelloWorldRequest, _>(HelloWorldHandler)
        .build()?;

    let request = HelloWorldRequest::new("  ");
    let correlation_id = request.correlation_id();
    let response = colombo.bus().send(request).await?;

    assert!(!response.header.is_valid());
    assert_eq!(response.message, "");
    assert_eq!(response.header.correlation_id(), Some(correlation_id));
    let results = response.header.validation_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].members, vec!["name"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_send_raises_an_sla_alert() -> anyhow::Result<()> {
    init_tracing();
    let alerter = Arc::new(RecordingAlerter::new());
    let mut config = ColomboConfig::default();
    config.send.sla_ms = Some(20);
    let colombo = ColomboBuilder::new()
        .with_config(config)
        .processor(StubProcessor::for_group("slow", "slow").with_delay(Duration::from_millis(80)))
        .alerter(alerter.clone())
        .build()?;

    let request = GroupedRequest::new("slow");
    let expected_id = request.correlation_id();
    colombo.bus().send(request).await?;

    let alerts = alerter.alerts();
    assert_eq!(alerts.len(), 1);
    assert_matches!(
        &alerts[0],
        Alert::SlaBreached { correlation_id, sla, elapsed, .. }
            if *correlation_id == expected_id
                && *sla == Duration::from_millis(20)
                && *elapsed >= Duration::from_millis(80)
    );
    Ok(())
}

/// Needs a tenant and echoes it back.
#[derive(Clone, Debug, Default)]
struct TenantRequest {
    header: RequestHeader,
}

#[derive(Clone, Debug, Default)]
struct TenantResponse {
    header: ResponseHeader,
    tenant: String,
}

impl Request for TenantRequest {
    type Response = TenantResponse;

    fn header(&self) -> &RequestHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut RequestHeader {
        &mut self.header
    }

    fn required_context(&self) -> &'static [&'static str] {
        &["tenant"]
    }
}

impl Response for TenantResponse {
    fn header(&self) -> &ResponseHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ResponseHeader {
        &mut self.header
    }
}

struct TenantHandler;

impl RequestHandler<TenantRequest> for TenantHandler {
    async fn handle(
        &self,
        request: &TenantRequest,
        _cx: &HandleContext<'_>,
    ) -> anyhow::Result<TenantResponse> {
        Ok(TenantResponse {
            tenant: request.header.context().get("tenant").unwrap_or_default().to_string(),
            ..TenantResponse::default()
        })
    }
}

#[tokio::test]
async fn missing_required_context_is_rejected() -> anyhow::Result<()> {
    let colombo = ColomboBuilder::new()
        .request_handler::<TenantRequest, _>(TenantHandler)
        .build()?;

    let error = colombo.bus().send(TenantRequest::default()).await.unwrap_err();
    assert_matches!(
        &error,
        DispatchError::MissingContext { request_type, key }
            if request_type == "TenantRequest" && key == "tenant"
    );
    assert!(error.is_configuration_error());

    let mut request = TenantRequest::default();
    request.header.context_mut().insert("tenant", "globex");
    assert_eq!(colombo.bus().send(request).await?.tenant, "globex");
    Ok(())
}

#[tokio::test]
async fn context_defaults_fill_missing_keys_only() -> anyhow::Result<()> {
    let mut config = ColomboConfig::default();
    config
        .context
        .defaults
        .insert("tenant".to_string(), "acme".to_string());
    let colombo = ColomboBuilder::new()
        .with_config(config)
        .request_handler::<TenantRequest, _>(TenantHandler)
        .build()?;

    assert_eq!(colombo.bus().send(TenantRequest::default()).await?.tenant, "acme");

    let mut request = TenantRequest::default();
    request.header.context_mut().insert("tenant", "globex");
    assert_eq!(colombo.bus().send(request).await?.tenant, "globex");
    Ok(())
}

fn cached_quotes(cache: &Arc<MemoryCache>, handler: &Arc<QuoteHandler>) -> ColomboBuilder {
    ColomboBuilder::new()
        .request_handler::<QuoteRequest, _>(handler.clone())
        .response_cache(cache.clone())
}

#[tokio::test]
async fn cache_hit_skips_the_handler() -> anyhow::Result<()> {
    init_tracing();
    let cache = Arc::new(MemoryCache::new());
    let handler = Arc::new(QuoteHandler::default());
    let colombo = cached_quotes(&cache, &handler).build()?;

    let first = colombo.bus().send(QuoteRequest::new("ACME")).await?;
    assert_eq!(first.price, 400);
    assert_eq!(cache.stores(), 1);

    let request = QuoteRequest::new("ACME");
    let correlation_id = request.correlation_id();
    let second = colombo.bus().send(request).await?;

    assert_eq!(second.price, 400);
    assert_eq!(second.header.correlation_id(), Some(correlation_id));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn partial_hits_only_send_the_misses() -> anyhow::Result<()> {
    let cache = Arc::new(MemoryCache::new());
    let handler = Arc::new(QuoteHandler::default());
    let colombo = cached_quotes(&cache, &handler).build()?;

    colombo.bus().send(QuoteRequest::new("ACME")).await?;

    let mut batch = colombo.bus().batch();
    let hit = batch.add(QuoteRequest::new("ACME"));
    let miss = batch.add(QuoteRequest::new("INITECH"));
    let responses = batch.send().await?;

    assert_eq!(
        responses.correlation_ids(),
        &[hit.correlation_id(), miss.correlation_id()]
    );
    assert_eq!(responses.get_key(hit)?.price, 400);
    assert_eq!(responses.get_key(miss)?.price, 700);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 2);
    Ok(())
}

#[tokio::test]
async fn cache_outage_degrades_to_a_miss() -> anyhow::Result<()> {
    let cache = Arc::new(MemoryCache::new());
    let handler = Arc::new(QuoteHandler::default());
    let alerter = Arc::new(RecordingAlerter::new());
    let colombo = cached_quotes(&cache, &handler)
        .alerter(alerter.clone())
        .build()?;

    colombo.bus().send(QuoteRequest::new("ACME")).await?;
    cache.set_offline(true);
    let response = colombo.bus().send(QuoteRequest::new("ACME")).await?;

    assert_eq!(response.price, 400);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    let alerts = alerter.alerts();
    assert_matches!(
        alerts.as_slice(),
        [
            Alert::CacheUnavailable { operation: "get", .. },
            Alert::CacheUnavailable { operation: "store", .. },
        ]
    );
    Ok(())
}

/// Changes prices, so cached quotes are stale afterwards.
#[derive(Clone, Debug, Default)]
struct PublishPrices {
    header: RequestHeader,
}

#[derive(Clone, Debug, Default)]
struct Published {
    header: ResponseHeader,
}

impl Request for PublishPrices {
    type Response = Published;

    fn header(&self) -> &RequestHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut RequestHeader {
        &mut self.header
    }

    fn invalidates(&self) -> Vec<TypeTag> {
        vec![TypeTag::of::<QuoteResponse>()]
    }
}

impl Response for Published {
    fn header(&self) -> &ResponseHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ResponseHeader {
        &mut self.header
    }
}

struct PublishHandler;

impl RequestHandler<PublishPrices> for PublishHandler {
    async fn handle(
        &self,
        _request: &PublishPrices,
        _cx: &HandleContext<'_>,
    ) -> anyhow::Result<Published> {
        Ok(Published::default())
    }
}

#[tokio::test]
async fn sending_an_invalidating_request_flushes_the_cache() -> anyhow::Result<()> {
    let cache = Arc::new(MemoryCache::new());
    let handler = Arc::new(QuoteHandler::default());
    let colombo = cached_quotes(&cache, &handler)
        .request_handler::<PublishPrices, _>(PublishHandler)
        .build()?;

    colombo.bus().send(QuoteRequest::new("ACME")).await?;
    assert_eq!(cache.len(), 1);

    colombo.bus().send(PublishPrices::default()).await?;
    assert!(cache.is_empty());

    colombo.bus().send(QuoteRequest::new("ACME")).await?;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    Ok(())
}
