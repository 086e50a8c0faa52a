//! # Colombo
//!
//! A request/response message bus. Requests are routed to processors
//! (in-process handlers or remote transports), wrapped in ordered interceptor
//! chains on both the sending and the handling side, executed concurrently,
//! and their responses are correlated back to the requests that produced them.
//!
//! Three pipelines share the same [`chain`] machinery:
//!
//! - **Send** ([`MessageBus`]): partitions a batch by processor, runs the
//!   partitions in parallel and returns a [`ResponsesGroup`].
//! - **Handle** ([`HandleDispatcher`]): resolves the handler for one request,
//!   runs it and stamps the request's correlation id on the response.
//! - **Notify** ([`NotificationDispatcher`]): fans a notification out to
//!   every interested handler without waiting for them.
//!
//! [`StatefulMessageBus`] defers sends so that several requests issued during
//! one unit of work go out as a single batch.

pub mod alert;
pub mod builder;
pub mod cache;
pub mod chain;
pub mod config;
pub mod error;
pub mod handle;
pub mod handler;
pub mod interceptors;
pub mod logging;
pub mod message;
pub mod notify;
pub mod processor;
pub mod registry;
pub mod responses;
pub mod scope;
pub mod send;
pub mod stateful;

pub use alert::{Alert, AlertSink, Alerter, TracingAlerter};
pub use builder::{Colombo, ColomboBuilder};
pub use cache::{CacheDirective, CacheError, ResponseCache};
pub use chain::{InterceptionPriority, Interceptor, Invocation, Pipeline};
pub use config::{ColomboConfig, ConfigError};
pub use error::{DispatchError, Result};
pub use handle::{HandleDispatcher, HandlePipeline};
pub use handler::{
    FnFactory, HandleContext, HandlerFactory, NotificationHandler, RequestHandler, SharedInstance,
};
pub use message::{
    BaseNotification, BaseRequest, BaseResponse, CorrelationId, MessageContext, Notification,
    Request, RequestHeader, RequestKind, Response, ResponseHeader, TypeTag, ValidationResult,
};
pub use notify::{NotificationDispatcher, NotifyHandle, NotifyPipeline, NotifyReport};
pub use processor::{
    LocalRequestProcessor, RemoteRequestProcessor, RequestProcessor, RequestTransport,
};
pub use registry::ChooseWhen;
pub use responses::{ResponseKey, ResponsesGroup};
pub use scope::DispatchScope;
pub use send::{MessageBus, SendBatch, SendPipeline};
pub use stateful::{ResponseFuture, StatefulMessageBus};
