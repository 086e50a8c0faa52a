//! Message model: requests, responses, notifications and their erased forms.
//!
//! Application code implements the typed traits ([`Request`], [`Response`],
//! [`Notification`]). The pipeline moves messages around as trait objects
//! ([`BaseRequest`], [`BaseResponse`], [`BaseNotification`]), which are
//! implemented for every typed message by blanket impls.
//!
//! ```rust
//! use colombo::{Request, RequestHeader, Response, ResponseHeader};
//!
//! #[derive(Clone, Debug, Default)]
//! struct HelloWorldRequest {
//!     header: RequestHeader,
//!     name: String,
//! }
//!
//! #[derive(Clone, Debug, Default)]
//! struct HelloWorldResponse {
//!     header: ResponseHeader,
//!     message: String,
//! }
//!
//! impl Request for HelloWorldRequest {
//!     type Response = HelloWorldResponse;
//!     fn header(&self) -> &RequestHeader { &self.header }
//!     fn header_mut(&mut self) -> &mut RequestHeader { &mut self.header }
//! }
//!
//! impl Response for HelloWorldResponse {
//!     fn header(&self) -> &ResponseHeader { &self.header }
//!     fn header_mut(&mut self) -> &mut ResponseHeader { &mut self.header }
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::CacheDirective;
use crate::error::DispatchError;

/// Group name used when a request does not override [`Request::group_name`].
pub const DEFAULT_GROUP: &str = "default";

/// Identity of a request; copied onto the response that answers it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// A fresh, random identifier.
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        CorrelationId(uuid)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.0)
    }
}

/// String key/value pairs carried alongside a message for cross-cutting
/// concerns (culture, feature flags, tenant...).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageContext(BTreeMap<String, String>);

impl MessageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MessageContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        MessageContext(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Stable runtime discriminator of a message type.
///
/// Registries are keyed by `TypeTag`; the name is kept for diagnostics only.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: 'static>() -> Self {
        TypeTag {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without its module path, e.g. `HelloWorldRequest`.
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        match base.rfind("::") {
            Some(index) => &self.name[index + 2..],
            None => self.name,
        }
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl Hash for TypeTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Whether a request may be cached and replayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Plain request; may mutate state.
    Request,
    /// Logically read-only; safe to cache and replay.
    SideEffectFree,
}

/// Envelope fields shared by every request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    correlation_id: CorrelationId,
    #[serde(default)]
    context: MessageContext,
    created_at: DateTime<Utc>,
}

impl RequestHeader {
    pub fn new() -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            context: MessageContext::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_context(context: MessageContext) -> Self {
        Self {
            context,
            ..Self::new()
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Give the request a new identity, e.g. before re-sending a clone.
    pub fn renew_correlation_id(&mut self) {
        self.correlation_id = CorrelationId::new();
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut MessageContext {
        &mut self.context
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Default for RequestHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Business validation failure reported on a response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub message: String,
    #[serde(default)]
    pub members: Vec<String>,
}

impl ValidationResult {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            members: Vec::new(),
        }
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.members.push(member.into());
        self
    }
}

/// Envelope fields shared by every response.
///
/// The correlation id stays `None` until the handle pipeline stamps the
/// originating request's id onto the response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    #[serde(default)]
    correlation_id: Option<CorrelationId>,
    utc_timestamp: DateTime<Utc>,
    #[serde(default)]
    validation_results: Vec<ValidationResult>,
}

impl ResponseHeader {
    pub fn new() -> Self {
        Self {
            correlation_id: None,
            utc_timestamp: Utc::now(),
            validation_results: Vec::new(),
        }
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn set_correlation_id(&mut self, correlation_id: CorrelationId) {
        self.correlation_id = Some(correlation_id);
    }

    pub fn utc_timestamp(&self) -> DateTime<Utc> {
        self.utc_timestamp
    }

    pub fn validation_results(&self) -> &[ValidationResult] {
        &self.validation_results
    }

    pub fn add_validation_result(&mut self, result: ValidationResult) {
        self.validation_results.push(result);
    }

    pub fn is_valid(&self) -> bool {
        self.validation_results.is_empty()
    }
}

impl Default for ResponseHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// A typed request expecting exactly one typed response.
pub trait Request: Clone + Debug + Send + Sync + 'static {
    /// The only response type this request can produce.
    type Response: Response;

    /// Side-effect-free requests are resolved against side-effect-free
    /// handlers and may be cached.
    const KIND: RequestKind = RequestKind::Request;

    fn header(&self) -> &RequestHeader;

    fn header_mut(&mut self) -> &mut RequestHeader;

    /// Routing key used by processors to claim the request.
    fn group_name(&self) -> &str {
        DEFAULT_GROUP
    }

    /// Opt into response caching. Ignored unless `KIND` is side-effect-free.
    fn cache(&self) -> Option<CacheDirective> {
        None
    }

    /// Response types whose cached instances are stale once this request is sent.
    fn invalidates(&self) -> Vec<TypeTag> {
        Vec::new()
    }

    /// Maximum expected round-trip time before an SLA alert is raised.
    fn sla(&self) -> Option<Duration> {
        None
    }

    /// Context keys that must be present when the request is sent.
    fn required_context(&self) -> &'static [&'static str] {
        &[]
    }

    /// Business validation run before the handler is invoked.
    fn validate(&self) -> Vec<ValidationResult> {
        Vec::new()
    }

    fn correlation_id(&self) -> CorrelationId {
        self.header().correlation_id()
    }
}

/// A typed response. Responses must be default-constructible so the pipeline
/// can create one on the handler's behalf (e.g. to report validation errors).
pub trait Response: Clone + Default + Debug + Send + Sync + 'static {
    fn header(&self) -> &ResponseHeader;

    fn header_mut(&mut self) -> &mut ResponseHeader;

    fn is_valid(&self) -> bool {
        self.header().is_valid()
    }
}

/// A fire-and-forget message without response.
pub trait Notification: Clone + Debug + Send + Sync + 'static {
    /// Context consulted by choose-when predicates of notification handlers.
    fn context(&self) -> Option<&MessageContext> {
        None
    }
}

/// Object-safe view of any [`Request`].
pub trait BaseRequest: DynClone + Debug + Send + Sync + 'static {
    fn request_header(&self) -> &RequestHeader;
    fn request_header_mut(&mut self) -> &mut RequestHeader;
    fn request_type(&self) -> TypeTag;
    fn response_type(&self) -> TypeTag;
    fn kind(&self) -> RequestKind;
    fn group(&self) -> &str;
    fn cache_directive(&self) -> Option<CacheDirective>;
    fn invalidated_types(&self) -> Vec<TypeTag>;
    fn sla_threshold(&self) -> Option<Duration>;
    fn required_context_keys(&self) -> &'static [&'static str];
    fn validation_results(&self) -> Vec<ValidationResult>;

    /// A default instance of the paired response type.
    fn new_response(&self) -> Box<dyn BaseResponse>;

    fn as_any(&self) -> &dyn Any;
}

dyn_clone::clone_trait_object!(BaseRequest);

impl<R: Request> BaseRequest for R {
    fn request_header(&self) -> &RequestHeader {
        self.header()
    }

    fn request_header_mut(&mut self) -> &mut RequestHeader {
        self.header_mut()
    }

    fn request_type(&self) -> TypeTag {
        TypeTag::of::<R>()
    }

    fn response_type(&self) -> TypeTag {
        TypeTag::of::<R::Response>()
    }

    fn kind(&self) -> RequestKind {
        R::KIND
    }

    fn group(&self) -> &str {
        self.group_name()
    }

    fn cache_directive(&self) -> Option<CacheDirective> {
        self.cache()
    }

    fn invalidated_types(&self) -> Vec<TypeTag> {
        self.invalidates()
    }

    fn sla_threshold(&self) -> Option<Duration> {
        self.sla()
    }

    fn required_context_keys(&self) -> &'static [&'static str] {
        self.required_context()
    }

    fn validation_results(&self) -> Vec<ValidationResult> {
        self.validate()
    }

    fn new_response(&self) -> Box<dyn BaseResponse> {
        Box::new(R::Response::default())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn BaseRequest {
    pub fn correlation_id(&self) -> CorrelationId {
        self.request_header().correlation_id()
    }

    pub fn context(&self) -> &MessageContext {
        self.request_header().context()
    }

    pub fn context_mut(&mut self) -> &mut MessageContext {
        self.request_header_mut().context_mut()
    }

    pub fn is_side_effect_free(&self) -> bool {
        self.kind() == RequestKind::SideEffectFree
    }

    pub fn downcast_ref<R: Request>(&self) -> Option<&R> {
        self.as_any().downcast_ref::<R>()
    }
}

/// Object-safe view of any [`Response`].
pub trait BaseResponse: DynClone + Debug + Send + Sync + 'static {
    fn response_header(&self) -> &ResponseHeader;
    fn response_header_mut(&mut self) -> &mut ResponseHeader;
    fn response_type(&self) -> TypeTag;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

dyn_clone::clone_trait_object!(BaseResponse);

impl<T: Response> BaseResponse for T {
    fn response_header(&self) -> &ResponseHeader {
        self.header()
    }

    fn response_header_mut(&mut self) -> &mut ResponseHeader {
        self.header_mut()
    }

    fn response_type(&self) -> TypeTag {
        TypeTag::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl dyn BaseResponse {
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.response_header().correlation_id()
    }

    pub fn is_valid(&self) -> bool {
        self.response_header().is_valid()
    }

    pub fn downcast_ref<T: Response>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Recover the concrete response.
    pub fn downcast<T: Response>(self: Box<Self>) -> Result<T, DispatchError> {
        let found = self.response_type();
        self.into_any()
            .downcast::<T>()
            .map(|response| *response)
            .map_err(|_| DispatchError::TypeMismatch {
                expected: std::any::type_name::<T>().to_string(),
                found: found.name().to_string(),
            })
    }
}

/// Object-safe view of any [`Notification`].
pub trait BaseNotification: DynClone + Debug + Send + Sync + 'static {
    fn notification_type(&self) -> TypeTag;
    fn notification_context(&self) -> Option<&MessageContext>;
    fn as_any(&self) -> &dyn Any;
}

dyn_clone::clone_trait_object!(BaseNotification);

impl<N: Notification> BaseNotification for N {
    fn notification_type(&self) -> TypeTag {
        TypeTag::of::<N>()
    }

    fn notification_context(&self) -> Option<&MessageContext> {
        self.context()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn BaseNotification {
    pub fn downcast_ref<N: Notification>(&self) -> Option<&N> {
        self.as_any().downcast_ref::<N>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Default)]
    struct Ping {
        header: RequestHeader,
    }

    #[derive(Clone, Debug, Default)]
    struct Pong {
        header: ResponseHeader,
    }

    impl Request for Ping {
        type Response = Pong;
        const KIND: RequestKind = RequestKind::SideEffectFree;

        fn header(&self) -> &RequestHeader {
            &self.header
        }

        fn header_mut(&mut self) -> &mut RequestHeader {
            &mut self.header
        }
    }

    impl Response for Pong {
        fn header(&self) -> &ResponseHeader {
            &self.header
        }

        fn header_mut(&mut self) -> &mut ResponseHeader {
            &mut self.header
        }
    }

    #[test]
    fn erased_request_reports_its_shape() {
        let ping = Ping::default();
        let erased: Box<dyn BaseRequest> = Box::new(ping.clone());

        assert_eq!(erased.request_type(), TypeTag::of::<Ping>());
        assert_eq!(erased.response_type(), TypeTag::of::<Pong>());
        assert!(erased.is_side_effect_free());
        assert_eq!(erased.correlation_id(), ping.correlation_id());
        assert_eq!(erased.group(), DEFAULT_GROUP);
        assert!(erased.downcast_ref::<Ping>().is_some());
    }

    #[test]
    fn cloned_request_keeps_identity_until_renewed() {
        let ping = Ping::default();
        let mut copy = ping.clone();
        assert_eq!(ping.correlation_id(), copy.correlation_id());

        copy.header_mut().renew_correlation_id();
        assert_ne!(ping.correlation_id(), copy.correlation_id());
    }

    #[test]
    fn response_is_valid_without_validation_results() {
        let mut pong = Pong::default();
        assert!(pong.is_valid());
        assert_eq!(pong.header().correlation_id(), None);

        pong.header_mut()
            .add_validation_result(ValidationResult::new("name is required").with_member("name"));
        assert!(!pong.is_valid());
    }

    #[test]
    fn erased_response_downcasts() {
        let erased: Box<dyn BaseResponse> = Box::new(Pong::default());
        assert!(erased.downcast_ref::<Pong>().is_some());
        assert!(erased.downcast::<Pong>().is_ok());
    }

    #[test]
    fn type_tag_short_name() {
        assert_eq!(TypeTag::of::<Ping>().short_name(), "Ping");
        assert_eq!(TypeTag::of::<Ping>().to_string(), "Ping");
    }
}
