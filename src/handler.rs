//! Request and notification handlers, their factories and type erasure.
//!
//! Application code implements [`RequestHandler`] / [`NotificationHandler`]
//! for concrete message types. The registry stores them behind
//! [`ErasedRequestHandler`] / [`ErasedNotificationHandler`] so the pipelines
//! can dispatch without compile-time knowledge of the message type.

use std::future::Future;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::{DispatchError, Result};
use crate::message::{BaseNotification, BaseRequest, BaseResponse, Notification, Request, TypeTag};
use crate::scope::DispatchScope;

/// What a handler can see besides the request itself.
pub struct HandleContext<'a> {
    scope: &'a DispatchScope,
    handler: &'a str,
}

impl<'a> HandleContext<'a> {
    pub fn new(scope: &'a DispatchScope, handler: &'a str) -> Self {
        Self { scope, handler }
    }

    /// The scope of the Handle call this handler runs in.
    pub fn scope(&self) -> &'a DispatchScope {
        self.scope
    }

    /// Name the handler was registered under.
    pub fn handler_name(&self) -> &'a str {
        self.handler
    }
}

/// Handles one request type.
///
/// Business failures belong in the response's validation results; an `Err`
/// means the request could not be handled at all.
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    fn handle(
        &self,
        request: &R,
        cx: &HandleContext<'_>,
    ) -> impl Future<Output = anyhow::Result<R::Response>> + Send;
}

impl<R: Request, H: RequestHandler<R>> RequestHandler<R> for Arc<H> {
    fn handle(
        &self,
        request: &R,
        cx: &HandleContext<'_>,
    ) -> impl Future<Output = anyhow::Result<R::Response>> + Send {
        (**self).handle(request, cx)
    }
}

/// Reacts to one notification type.
pub trait NotificationHandler<N: Notification>: Send + Sync + 'static {
    fn handle(&self, notification: &N) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Supplies handler instances to the Handle pipeline.
///
/// Every Handle call creates one instance and hands it back through
/// [`HandlerFactory::release`] once the handler returns, whether it
/// succeeded or not.
pub trait HandlerFactory: Send + Sync + 'static {
    type Handler: Send + Sync + 'static;

    fn create(&self) -> anyhow::Result<Self::Handler>;

    fn release(&self, handler: Self::Handler) {
        drop(handler);
    }
}

/// Hands out the same instance to every call.
pub struct SharedInstance<H>(Arc<H>);

impl<H> SharedInstance<H> {
    pub fn new(handler: H) -> Self {
        Self(Arc::new(handler))
    }
}

impl<H: Send + Sync + 'static> HandlerFactory for SharedInstance<H> {
    type Handler = Arc<H>;

    fn create(&self) -> anyhow::Result<Arc<H>> {
        Ok(self.0.clone())
    }
}

/// Builds a fresh instance per call.
pub struct FnFactory<F>(F);

impl<F> FnFactory<F> {
    pub fn new(create: F) -> Self {
        Self(create)
    }
}

impl<F, H> HandlerFactory for FnFactory<F>
where
    F: Fn() -> H + Send + Sync + 'static,
    H: Send + Sync + 'static,
{
    type Handler = H;

    fn create(&self) -> anyhow::Result<H> {
        Ok((self.0)())
    }
}

/// A handler instance on loan from its factory; returned on drop, including
/// when the call is cancelled.
struct Lease<'f, F: HandlerFactory> {
    factory: &'f F,
    handler: ManuallyDrop<F::Handler>,
}

impl<'f, F: HandlerFactory> Lease<'f, F> {
    fn acquire(factory: &'f F) -> anyhow::Result<Self> {
        Ok(Self {
            factory,
            handler: ManuallyDrop::new(factory.create()?),
        })
    }
}

impl<F: HandlerFactory> Deref for Lease<'_, F> {
    type Target = F::Handler;

    fn deref(&self) -> &F::Handler {
        &self.handler
    }
}

impl<F: HandlerFactory> Drop for Lease<'_, F> {
    fn drop(&mut self) {
        // SAFETY: `handler` is never used again once the lease is dropped.
        let handler = unsafe { ManuallyDrop::take(&mut self.handler) };
        self.factory.release(handler);
    }
}

/// A request handler with its message type erased.
pub trait ErasedRequestHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handle_erased<'a>(
        &'a self,
        request: &'a dyn BaseRequest,
        scope: &'a DispatchScope,
    ) -> BoxFuture<'a, Result<Box<dyn BaseResponse>>>;
}

/// Binds a [`HandlerFactory`] to the request type its handlers accept.
pub struct FactoryRequestHandler<R, F> {
    name: String,
    factory: F,
    _request: PhantomData<fn(R)>,
}

impl<R, F> FactoryRequestHandler<R, F>
where
    R: Request,
    F: HandlerFactory,
    F::Handler: RequestHandler<R>,
{
    pub fn new(name: impl Into<String>, factory: F) -> Self {
        Self {
            name: name.into(),
            factory,
            _request: PhantomData,
        }
    }

    fn failure(&self, source: anyhow::Error) -> DispatchError {
        DispatchError::Handler {
            handler: self.name.clone(),
            request_type: TypeTag::of::<R>().to_string(),
            source,
        }
    }
}

impl<R, F> ErasedRequestHandler for FactoryRequestHandler<R, F>
where
    R: Request,
    F: HandlerFactory,
    F::Handler: RequestHandler<R>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle_erased<'a>(
        &'a self,
        request: &'a dyn BaseRequest,
        scope: &'a DispatchScope,
    ) -> BoxFuture<'a, Result<Box<dyn BaseResponse>>> {
        async move {
            let typed = request
                .downcast_ref::<R>()
                .ok_or_else(|| DispatchError::TypeMismatch {
                    expected: std::any::type_name::<R>().to_string(),
                    found: request.request_type().name().to_string(),
                })?;

            let handler = Lease::acquire(&self.factory).map_err(|source| self.failure(source))?;

            let cx = HandleContext::new(scope, &self.name);
            match handler.handle(typed, &cx).await {
                Ok(response) => Ok(Box::new(response) as Box<dyn BaseResponse>),
                Err(source) => {
                    tracing::error!(
                        handler = %self.name,
                        request_type = %TypeTag::of::<R>(),
                        correlation_id = %typed.correlation_id(),
                        error = ?source,
                        "handler failed"
                    );
                    Err(self.failure(source))
                }
            }
        }
        .boxed()
    }
}

/// A notification handler with its message type erased.
pub trait ErasedNotificationHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handle_erased<'a>(
        &'a self,
        notification: &'a dyn BaseNotification,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

pub struct TypedNotificationHandler<N, H> {
    name: String,
    handler: H,
    _notification: PhantomData<fn(N)>,
}

impl<N, H> TypedNotificationHandler<N, H>
where
    N: Notification,
    H: NotificationHandler<N>,
{
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            handler,
            _notification: PhantomData,
        }
    }
}

impl<N, H> ErasedNotificationHandler for TypedNotificationHandler<N, H>
where
    N: Notification,
    H: NotificationHandler<N>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle_erased<'a>(
        &'a self,
        notification: &'a dyn BaseNotification,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            let Some(typed) = notification.downcast_ref::<N>() else {
                anyhow::bail!(
                    "expected {}, found {}",
                    std::any::type_name::<N>(),
                    notification.notification_type().name()
                );
            };
            self.handler.handle(typed).await
        }
        .boxed()
    }
}

/// Short, human readable name for a handler type.
pub(crate) fn handler_name<H: 'static>() -> String {
    TypeTag::of::<H>().short_name().to_string()
}
