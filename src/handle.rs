//! Handle pipeline: runs one request through its handler.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::Instrument as _;

use crate::chain::{Interceptor, InterceptorChain, Pipeline, Terminal};
use crate::error::Result;
use crate::message::{BaseRequest, BaseResponse, Request};
use crate::registry::HandlerRegistry;
use crate::scope::DispatchScope;

pub struct HandlePipeline;

impl Pipeline for HandlePipeline {
    type Input = Arc<dyn BaseRequest>;
    type Output = Box<dyn BaseResponse>;
    const NAME: &'static str = "handle";
}

/// Interceptor on the handling side.
pub type HandleInterceptor = dyn Interceptor<HandlePipeline>;

/// Resolves the handler, runs it and stamps the correlation id.
struct HandlerTerminal {
    registry: Arc<HandlerRegistry>,
}

impl Terminal<HandlePipeline> for HandlerTerminal {
    fn run<'a>(
        &'a self,
        request: &'a Arc<dyn BaseRequest>,
        scope: &'a DispatchScope,
    ) -> BoxFuture<'a, Result<Box<dyn BaseResponse>>> {
        async move {
            let handler = self.registry.resolve_request_handler(&**request)?;
            tracing::debug!(handler = handler.name(), "handler resolved");

            let mut response = handler.handle_erased(&**request, scope).await?;
            response
                .response_header_mut()
                .set_correlation_id(request.correlation_id());
            Ok(response)
        }
        .boxed()
    }
}

/// Entry point of the Handle pipeline.
#[derive(Clone)]
pub struct HandleDispatcher {
    chain: Arc<InterceptorChain<HandlePipeline>>,
}

impl HandleDispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, interceptors: &[Arc<HandleInterceptor>]) -> Self {
        let terminal = Arc::new(HandlerTerminal { registry });
        Self {
            chain: Arc::new(InterceptorChain::build(interceptors, terminal)),
        }
    }

    /// Handle one request and return its response, carrying the request's
    /// correlation id.
    pub async fn handle(&self, request: Arc<dyn BaseRequest>) -> Result<Box<dyn BaseResponse>> {
        let correlation_id = request.correlation_id();
        let span = tracing::debug_span!(
            "handle",
            request_type = %request.request_type(),
            %correlation_id
        );

        async move {
            let mut response = self.chain.run(request).await?;
            // Short-circuiting interceptors may leave it unset or stale.
            response
                .response_header_mut()
                .set_correlation_id(correlation_id);
            Ok(response)
        }
        .instrument(span)
        .await
    }

    pub async fn handle_typed<R: Request>(&self, request: R) -> Result<R::Response> {
        self.handle(Arc::new(request)).await?.downcast::<R::Response>()
    }

    pub fn interceptor_names(&self) -> Vec<String> {
        self.chain.interceptor_names()
    }
}

impl std::fmt::Debug for HandleDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleDispatcher")
            .field("interceptors", &self.chain.interceptor_names())
            .finish()
    }
}
