//! Handler registrations and resolution.
//!
//! The registry is filled by [`ColomboBuilder`](crate::ColomboBuilder) and
//! frozen behind an `Arc` afterwards; lookups take no locks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{DispatchError, Result};
use crate::handler::{ErasedNotificationHandler, ErasedRequestHandler};
use crate::message::{BaseNotification, BaseRequest, MessageContext, RequestKind, TypeTag};

/// Registration-time predicate over a message's context.
///
/// A handler registered with a `ChooseWhen` is *specialized*: it is only
/// considered when the predicate holds, and then it wins over defaults.
#[derive(Clone)]
pub struct ChooseWhen {
    description: String,
    predicate: Arc<dyn Fn(&MessageContext) -> bool + Send + Sync>,
}

impl ChooseWhen {
    /// Matches when `key` is present with exactly `value`.
    pub fn context_contains(key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        Self {
            description: format!("{key}={value}"),
            predicate: Arc::new(move |context| context.get(&key) == Some(value.as_str())),
        }
    }

    /// Matches when `key` is present, whatever its value.
    pub fn context_has(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            description: format!("has {key}"),
            predicate: Arc::new(move |context| context.contains_key(&key)),
        }
    }

    pub fn matching(
        description: impl Into<String>,
        predicate: impl Fn(&MessageContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn matches(&self, context: &MessageContext) -> bool {
        (self.predicate)(context)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for ChooseWhen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChooseWhen({})", self.description)
    }
}

/// A handler plus the condition under which it applies.
pub struct Registration<H: ?Sized> {
    handler: Arc<H>,
    choose_when: Option<ChooseWhen>,
    label: String,
}

impl<H: ?Sized> Registration<H> {
    fn new(handler: Arc<H>, name: &str, choose_when: Option<ChooseWhen>) -> Self {
        let label = match &choose_when {
            Some(choose_when) => format!("{name} (when {})", choose_when.description()),
            None => name.to_string(),
        };
        Self {
            handler,
            choose_when,
            label,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_specialized(&self) -> bool {
        self.choose_when.is_some()
    }
}

enum Selection<'r, H: ?Sized> {
    One(&'r Registration<H>),
    None,
    Ambiguous,
}

/// Pick the handler among `candidates`: a single specialized match wins,
/// otherwise the only surviving candidate, otherwise nothing or ambiguity.
fn select<'r, H: ?Sized>(
    candidates: &'r [Registration<H>],
    context: Option<&MessageContext>,
) -> Selection<'r, H> {
    let survivors = surviving(candidates, context);
    let specialized: Vec<&'r Registration<H>> = survivors
        .iter()
        .copied()
        .filter(|r| r.is_specialized())
        .collect();

    if let [only] = specialized.as_slice() {
        return Selection::One(*only);
    }
    match survivors.as_slice() {
        [] => Selection::None,
        [only] => Selection::One(*only),
        _ => Selection::Ambiguous,
    }
}

/// Defaults plus specialized candidates whose predicate holds.
fn surviving<'r, H: ?Sized>(
    candidates: &'r [Registration<H>],
    context: Option<&MessageContext>,
) -> Vec<&'r Registration<H>> {
    candidates
        .iter()
        .filter(|registration| match (&registration.choose_when, context) {
            (None, _) => true,
            (Some(choose_when), Some(context)) => choose_when.matches(context),
            (Some(_), None) => false,
        })
        .collect()
}

fn labels<H: ?Sized>(candidates: &[Registration<H>]) -> Vec<String> {
    candidates.iter().map(|r| r.label.clone()).collect()
}

#[derive(Default)]
pub struct HandlerRegistry {
    request_handlers: HashMap<(TypeTag, RequestKind), Vec<Registration<dyn ErasedRequestHandler>>>,
    notification_handlers: HashMap<TypeTag, Vec<Registration<dyn ErasedNotificationHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_request_handler(
        &mut self,
        request_type: TypeTag,
        kind: RequestKind,
        handler: Arc<dyn ErasedRequestHandler>,
        choose_when: Option<ChooseWhen>,
    ) {
        let registration = Registration::new(handler.clone(), handler.name(), choose_when);
        tracing::debug!(%request_type, ?kind, handler = registration.label(), "request handler registered");
        self.request_handlers
            .entry((request_type, kind))
            .or_default()
            .push(registration);
    }

    pub fn register_notification_handler(
        &mut self,
        notification_type: TypeTag,
        handler: Arc<dyn ErasedNotificationHandler>,
        choose_when: Option<ChooseWhen>,
    ) {
        let registration = Registration::new(handler.clone(), handler.name(), choose_when);
        tracing::debug!(%notification_type, handler = registration.label(), "notification handler registered");
        self.notification_handlers
            .entry(notification_type)
            .or_default()
            .push(registration);
    }

    fn request_candidates(
        &self,
        request: &dyn BaseRequest,
    ) -> &[Registration<dyn ErasedRequestHandler>] {
        self.request_handlers
            .get(&(request.request_type(), request.kind()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether any handler is registered for the request's type and kind.
    pub fn can_handle(&self, request: &dyn BaseRequest) -> bool {
        !self.request_candidates(request).is_empty()
    }

    /// The one handler for `request`.
    pub fn resolve_request_handler(
        &self,
        request: &dyn BaseRequest,
    ) -> Result<Arc<dyn ErasedRequestHandler>> {
        let candidates = self.request_candidates(request);
        match select(candidates, Some(request.context())) {
            Selection::One(registration) => Ok(registration.handler.clone()),
            Selection::None => Err(DispatchError::NoHandler {
                message_type: request.request_type().to_string(),
                candidates: labels(candidates),
            }),
            Selection::Ambiguous => Err(DispatchError::AmbiguousHandler {
                message_type: request.request_type().to_string(),
                candidates: labels(candidates),
            }),
        }
    }

    /// Every handler that should receive `notification`.
    pub fn resolve_notification_handlers(
        &self,
        notification: &dyn BaseNotification,
    ) -> Vec<Arc<dyn ErasedNotificationHandler>> {
        let Some(candidates) = self
            .notification_handlers
            .get(&notification.notification_type())
        else {
            return Vec::new();
        };
        surviving(candidates, notification.notification_context())
            .into_iter()
            .map(|registration| registration.handler.clone())
            .collect()
    }

    /// Registered request types, for diagnostics.
    pub fn request_types(&self) -> Vec<TypeTag> {
        self.request_handlers.keys().map(|(tag, _)| *tag).collect()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("request_types", &self.request_handlers.len())
            .field("notification_types", &self.notification_handlers.len())
            .finish()
    }
}
