use futures::FutureExt;
use futures::future::BoxFuture;

use crate::chain::{InterceptionPriority, Interceptor, Invocation};
use crate::error::Result;
use crate::handle::HandlePipeline;

/// Runs [`Request::validate`](crate::Request::validate) before the handler.
///
/// An invalid request never reaches its handler: the pipeline answers with a
/// default response carrying the validation results.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValidationHandleInterceptor;

impl Interceptor<HandlePipeline> for ValidationHandleInterceptor {
    fn name(&self) -> &str {
        "validation"
    }

    fn priority(&self) -> InterceptionPriority {
        InterceptionPriority::HIGH
    }

    fn intercept<'a>(
        &'a self,
        invocation: &'a mut Invocation<'_, HandlePipeline>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let request = invocation.input();
            let results = request.validation_results();
            if results.is_empty() {
                return invocation.proceed().await;
            }

            tracing::debug!(
                request_type = %request.request_type(),
                failures = results.len(),
                "request failed validation"
            );
            let mut response = request.new_response();
            let header = response.response_header_mut();
            header.set_correlation_id(request.correlation_id());
            for result in results {
                header.add_validation_result(result);
            }
            invocation.set_output(response);
            Ok(())
        }
        .boxed()
    }
}
