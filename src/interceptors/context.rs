use futures::FutureExt;
use futures::future::BoxFuture;

use crate::chain::{InterceptionPriority, Interceptor, Invocation};
use crate::error::{DispatchError, Result};
use crate::message::MessageContext;
use crate::send::SendPipeline;

/// Fills context keys a request lacks from configured defaults.
pub struct ContextDefaultsSendInterceptor {
    defaults: MessageContext,
}

impl ContextDefaultsSendInterceptor {
    pub fn new(defaults: MessageContext) -> Self {
        Self { defaults }
    }
}

impl Interceptor<SendPipeline> for ContextDefaultsSendInterceptor {
    fn name(&self) -> &str {
        "context-defaults"
    }

    fn priority(&self) -> InterceptionPriority {
        InterceptionPriority::HIGH
    }

    fn intercept<'a>(
        &'a self,
        invocation: &'a mut Invocation<'_, SendPipeline>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            for request in invocation.input_mut().iter_mut() {
                let missing: Vec<(&str, &str)> = self
                    .defaults
                    .iter()
                    .filter(|(key, _)| !request.context().contains_key(key))
                    .collect();
                if missing.is_empty() {
                    continue;
                }

                // Copy-on-write: the caller may still hold the request.
                let context = dyn_clone::arc_make_mut(request).context_mut();
                for (key, value) in missing {
                    context.insert(key, value);
                }
            }
            invocation.proceed().await
        }
        .boxed()
    }
}

/// Fails a Send whose requests lack a context key their type requires.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequiredContextSendInterceptor;

impl Interceptor<SendPipeline> for RequiredContextSendInterceptor {
    fn name(&self) -> &str {
        "required-context"
    }

    fn priority(&self) -> InterceptionPriority {
        InterceptionPriority::HIGH
    }

    fn intercept<'a>(
        &'a self,
        invocation: &'a mut Invocation<'_, SendPipeline>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            for request in invocation.input() {
                if let Some(key) = request
                    .required_context_keys()
                    .iter()
                    .find(|key| !request.context().contains_key(key))
                {
                    return Err(DispatchError::MissingContext {
                        request_type: request.request_type().to_string(),
                        key: key.to_string(),
                    });
                }
            }
            invocation.proceed().await
        }
        .boxed()
    }
}
