//! Assembly of a [`Colombo`] instance.
//!
//! ```rust,ignore
//! let colombo = ColomboBuilder::new()
//!     .with_config(config)
//!     .request_handler::<HelloWorldRequest, _>(HelloWorldHandler)
//!     .request_handler_when::<HelloWorldRequest, _>(
//!         GermanHelloWorldHandler,
//!         ChooseWhen::context_contains("culture", "de-DE"),
//!     )
//!     .alerter(TracingAlerter)
//!     .build()?;
//!
//! let response = colombo.bus().send(HelloWorldRequest::new("Foo")).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::alert::{AlertSink, Alerter};
use crate::cache::ResponseCache;
use crate::chain::Interceptor;
use crate::config::ColomboConfig;
use crate::error::{DispatchError, Result};
use crate::handle::{HandleDispatcher, HandleInterceptor, HandlePipeline};
use crate::handler::{
    FactoryRequestHandler, HandlerFactory, NotificationHandler, RequestHandler, SharedInstance,
    TypedNotificationHandler, handler_name,
};
use crate::interceptors::{
    CacheSendInterceptor, ContextDefaultsSendInterceptor, RequiredContextSendInterceptor,
    SlaSendInterceptor, ValidationHandleInterceptor,
};
use crate::message::{Notification, Request, TypeTag};
use crate::notify::{NotificationDispatcher, NotifyInterceptor, NotifyPipeline};
use crate::processor::{
    LocalRequestProcessor, RemoteRequestProcessor, RequestProcessor, RequestTransport,
};
use crate::registry::{ChooseWhen, HandlerRegistry};
use crate::send::{MessageBus, SendInterceptor, SendPipeline};
use crate::stateful::StatefulMessageBus;

/// Collects handlers, interceptors and processors, then freezes them into a
/// [`Colombo`].
pub struct ColomboBuilder {
    config: ColomboConfig,
    registry: HandlerRegistry,
    send_interceptors: Vec<Arc<SendInterceptor>>,
    handle_interceptors: Vec<Arc<HandleInterceptor>>,
    notify_interceptors: Vec<Arc<NotifyInterceptor>>,
    processors: Vec<Arc<dyn RequestProcessor>>,
    transports: HashMap<String, Arc<dyn RequestTransport>>,
    alerters: Vec<Arc<dyn Alerter>>,
    cache: Option<Arc<dyn ResponseCache>>,
    local: bool,
}

impl Default for ColomboBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ColomboBuilder {
    pub fn new() -> Self {
        Self {
            config: ColomboConfig::default(),
            registry: HandlerRegistry::new(),
            send_interceptors: Vec::new(),
            handle_interceptors: Vec::new(),
            notify_interceptors: Vec::new(),
            processors: Vec::new(),
            transports: HashMap::new(),
            alerters: Vec::new(),
            cache: None,
            local: true,
        }
    }

    pub fn with_config(mut self, config: ColomboConfig) -> Self {
        self.config = config;
        self
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    /// Register a default handler shared by every call.
    pub fn request_handler<R, H>(self, handler: H) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        let name = handler_name::<H>();
        self.register_request::<R, _>(name, SharedInstance::new(handler), None)
    }

    /// Register a handler specialized for contexts matching `choose_when`.
    pub fn request_handler_when<R, H>(self, handler: H, choose_when: ChooseWhen) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        let name = handler_name::<H>();
        self.register_request::<R, _>(name, SharedInstance::new(handler), Some(choose_when))
    }

    /// Register a factory creating one handler instance per call.
    pub fn request_handler_factory<R, F>(self, factory: F, choose_when: Option<ChooseWhen>) -> Self
    where
        R: Request,
        F: HandlerFactory,
        F::Handler: RequestHandler<R>,
    {
        let name = handler_name::<F::Handler>();
        self.register_request::<R, F>(name, factory, choose_when)
    }

    fn register_request<R, F>(
        mut self,
        name: String,
        factory: F,
        choose_when: Option<ChooseWhen>,
    ) -> Self
    where
        R: Request,
        F: HandlerFactory,
        F::Handler: RequestHandler<R>,
    {
        self.registry.register_request_handler(
            TypeTag::of::<R>(),
            R::KIND,
            Arc::new(FactoryRequestHandler::<R, F>::new(name, factory)),
            choose_when,
        );
        self
    }

    pub fn notification_handler<N, H>(self, handler: H) -> Self
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        self.register_notification::<N, H>(handler, None)
    }

    pub fn notification_handler_when<N, H>(self, handler: H, choose_when: ChooseWhen) -> Self
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        self.register_notification::<N, H>(handler, Some(choose_when))
    }

    fn register_notification<N, H>(mut self, handler: H, choose_when: Option<ChooseWhen>) -> Self
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        let name = handler_name::<H>();
        self.registry.register_notification_handler(
            TypeTag::of::<N>(),
            Arc::new(TypedNotificationHandler::<N, H>::new(name, handler)),
            choose_when,
        );
        self
    }

    // ------------------------------------------------------------------
    // Interceptors
    // ------------------------------------------------------------------

    pub fn send_interceptor(mut self, interceptor: impl Interceptor<SendPipeline> + 'static) -> Self {
        self.send_interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn handle_interceptor(
        mut self,
        interceptor: impl Interceptor<HandlePipeline> + 'static,
    ) -> Self {
        self.handle_interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn notify_interceptor(
        mut self,
        interceptor: impl Interceptor<NotifyPipeline> + 'static,
    ) -> Self {
        self.notify_interceptors.push(Arc::new(interceptor));
        self
    }

    // ------------------------------------------------------------------
    // Processors and collaborators
    // ------------------------------------------------------------------

    pub fn processor(mut self, processor: impl RequestProcessor + 'static) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    /// Transport for the `[[remote]]` config entry called `name`.
    pub fn remote_transport(
        mut self,
        name: impl Into<String>,
        transport: impl RequestTransport + 'static,
    ) -> Self {
        self.transports.insert(name.into(), Arc::new(transport));
        self
    }

    /// Do not answer requests with in-process handlers.
    pub fn without_local_processor(mut self) -> Self {
        self.local = false;
        self
    }

    pub fn alerter(mut self, alerter: impl Alerter + 'static) -> Self {
        self.alerters.push(Arc::new(alerter));
        self
    }

    pub fn response_cache(mut self, cache: impl ResponseCache + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn build(self) -> Result<Colombo> {
        let ColomboBuilder {
            config,
            registry,
            send_interceptors,
            handle_interceptors,
            notify_interceptors,
            mut processors,
            mut transports,
            alerters,
            cache,
            local,
        } = self;

        config
            .validate()
            .map_err(|error| DispatchError::Config(error.to_string()))?;

        let alerts = AlertSink::new(alerters);
        let registry = Arc::new(registry);

        let mut handle_chain: Vec<Arc<HandleInterceptor>> =
            vec![Arc::new(ValidationHandleInterceptor)];
        handle_chain.extend(handle_interceptors);
        let handler = HandleDispatcher::new(registry.clone(), &handle_chain);

        for remote in &config.remote {
            let transport = transports.remove(&remote.name).ok_or_else(|| {
                DispatchError::Config(format!(
                    "remote `{}` has no transport registered",
                    remote.name
                ))
            })?;
            processors.push(Arc::new(RemoteRequestProcessor::new(
                remote.name.clone(),
                remote.groups.iter().cloned(),
                transport,
            )));
        }
        if let Some(name) = transports.keys().next() {
            return Err(DispatchError::Config(format!(
                "transport `{name}` matches no [[remote]] entry"
            )));
        }
        if local {
            processors.insert(
                0,
                Arc::new(LocalRequestProcessor::new(registry.clone(), handler.clone())),
            );
        }

        let mut send_chain: Vec<Arc<SendInterceptor>> = vec![Arc::new(SlaSendInterceptor::new(
            alerts.clone(),
            config.default_sla(),
        ))];
        let defaults = config.context_defaults();
        if !defaults.is_empty() {
            send_chain.push(Arc::new(ContextDefaultsSendInterceptor::new(defaults)));
        }
        send_chain.push(Arc::new(RequiredContextSendInterceptor));
        if let Some(cache) = cache {
            send_chain.push(Arc::new(CacheSendInterceptor::new(cache, alerts.clone())));
        }
        send_chain.extend(send_interceptors);
        let bus = MessageBus::new(processors, &send_chain);

        let notifier = NotificationDispatcher::new(registry, &notify_interceptors);

        tracing::debug!(
            send = ?bus.interceptor_names(),
            handle = ?handler.interceptor_names(),
            "colombo built"
        );

        Ok(Colombo {
            config: Arc::new(config),
            bus,
            handler,
            notifier,
            alerts,
        })
    }
}

/// A built bus: Send, Handle and Notify entry points sharing one registry.
#[derive(Clone, Debug)]
pub struct Colombo {
    config: Arc<ColomboConfig>,
    bus: MessageBus,
    handler: HandleDispatcher,
    notifier: NotificationDispatcher,
    alerts: AlertSink,
}

impl Colombo {
    pub fn builder() -> ColomboBuilder {
        ColomboBuilder::new()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn handle_dispatcher(&self) -> &HandleDispatcher {
        &self.handler
    }

    pub fn notifier(&self) -> &NotificationDispatcher {
        &self.notifier
    }

    pub fn alerts(&self) -> &AlertSink {
        &self.alerts
    }

    pub fn config(&self) -> &ColomboConfig {
        &self.config
    }

    /// A fresh stateful bus for one unit of work.
    pub fn stateful(&self) -> StatefulMessageBus {
        StatefulMessageBus::new(self.bus.clone(), self.config.stateful.max_allowed_sends)
    }
}
