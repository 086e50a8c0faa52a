use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::alert::{Alert, AlertSink};
use crate::cache::{CacheError, ResponseCache};
use crate::chain::{InterceptionPriority, Interceptor, Invocation, Pipeline};
use crate::error::{DispatchError, Result};
use crate::message::{BaseRequest, BaseResponse, CorrelationId};
use crate::responses::ResponsesGroup;
use crate::send::SendPipeline;

/// Serves side-effect-free requests from a [`ResponseCache`].
///
/// Before proceeding it flushes the response types invalidated by the batch
/// and looks every cacheable request up; hits are removed from the batch.
/// After proceeding it stores the valid responses of cacheable misses and
/// merges the hits back. A failing backend raises
/// [`Alert::CacheUnavailable`] and the request is treated as a miss.
pub struct CacheSendInterceptor {
    cache: Arc<dyn ResponseCache>,
    alerts: AlertSink,
}

impl CacheSendInterceptor {
    pub fn new(cache: Arc<dyn ResponseCache>, alerts: AlertSink) -> Self {
        Self { cache, alerts }
    }

    fn unavailable(&self, operation: &'static str, response_type: String, error: CacheError) {
        tracing::warn!(operation, %response_type, %error, "response cache unavailable");
        self.alerts.raise(&Alert::CacheUnavailable {
            operation,
            response_type,
            reason: error.to_string(),
        });
    }

    async fn invalidate(&self, requests: &[Arc<dyn BaseRequest>]) {
        for request in requests {
            for response_type in request.invalidated_types() {
                tracing::debug!(%response_type, by = %request.request_type(), "flushing cached responses");
                if let Err(error) = self.cache.flush(None, response_type).await {
                    self.unavailable("flush", response_type.to_string(), error);
                }
            }
        }
    }

    async fn lookup(&self, request: &dyn BaseRequest) -> Option<Box<dyn BaseResponse>> {
        if !request.is_side_effect_free() {
            return None;
        }
        let directive = request.cache_directive()?;
        let response_type = request.response_type();

        match self
            .cache
            .get(directive.segment.as_deref(), response_type, &directive.key)
            .await
        {
            Ok(Some(mut hit)) => {
                tracing::debug!(%response_type, key = %directive.key, "cache hit");
                hit.response_header_mut()
                    .set_correlation_id(request.correlation_id());
                Some(hit)
            }
            Ok(None) => None,
            Err(error) => {
                self.unavailable("get", response_type.to_string(), error);
                None
            }
        }
    }

    async fn store(&self, requests: &[Arc<dyn BaseRequest>], responses: &ResponsesGroup) {
        for request in requests {
            if !request.is_side_effect_free() {
                continue;
            }
            let Some(directive) = request.cache_directive() else {
                continue;
            };
            let Some(response) = responses.get_erased(&request.correlation_id()) else {
                continue;
            };
            if !response.is_valid() {
                continue;
            }

            let stored = self
                .cache
                .store(
                    directive.segment.as_deref(),
                    &directive.key,
                    dyn_clone::clone_box(response),
                    directive.ttl,
                )
                .await;
            if let Err(error) = stored {
                self.unavailable("store", request.response_type().to_string(), error);
            }
        }
    }
}

impl Interceptor<SendPipeline> for CacheSendInterceptor {
    fn name(&self) -> &str {
        "cache"
    }

    fn priority(&self) -> InterceptionPriority {
        InterceptionPriority::MEDIUM
    }

    fn intercept<'a>(
        &'a self,
        invocation: &'a mut Invocation<'_, SendPipeline>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let original: Vec<Arc<dyn BaseRequest>> = invocation.input().clone();
            self.invalidate(&original).await;

            let mut hits: Vec<(CorrelationId, Box<dyn BaseResponse>)> = Vec::new();
            for request in &original {
                if let Some(hit) = self.lookup(&**request).await {
                    hits.push((request.correlation_id(), hit));
                }
            }

            if hits.is_empty() {
                invocation.proceed().await?;
                if let Some(responses) = invocation.output() {
                    self.store(&original, responses).await;
                }
                return Ok(());
            }

            let misses: Vec<Arc<dyn BaseRequest>> = original
                .iter()
                .filter(|request| !hits.iter().any(|(id, _)| *id == request.correlation_id()))
                .cloned()
                .collect();

            let mut responses = ResponsesGroup::with_capacity(original.len());
            if !misses.is_empty() {
                *invocation.input_mut() = misses.clone();
                let proceeded = invocation.proceed().await;
                *invocation.input_mut() = original.clone();
                proceeded?;

                let fresh = invocation.take_output().ok_or(DispatchError::NoOutput {
                    pipeline: SendPipeline::NAME,
                })?;
                self.store(&misses, &fresh).await;
                responses.extend(fresh);
            }
            for (correlation_id, hit) in hits {
                responses.insert(correlation_id, hit);
            }

            // Ordered like the caller's batch.
            let responses = ResponsesGroup::assemble(&original, [responses])?;
            invocation.set_output(responses);
            Ok(())
        }
        .boxed()
    }
}
