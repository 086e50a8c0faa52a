//! Response cache contract.
//!
//! Storage backends live outside this crate; the [`CacheSendInterceptor`]
//! drives them through [`ResponseCache`].
//!
//! [`CacheSendInterceptor`]: crate::interceptors::CacheSendInterceptor

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::message::{BaseResponse, TypeTag};

/// Per-request caching metadata returned by [`Request::cache`].
///
/// [`Request::cache`]: crate::Request::cache
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheDirective {
    /// Key identifying the response within its type and segment.
    pub key: String,
    /// How long a stored response stays valid.
    pub ttl: Duration,
    /// Optional partition (tenant, user...) the entry belongs to.
    pub segment: Option<String>,
}

impl CacheDirective {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
            segment: None,
        }
    }

    pub fn in_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }
}

/// Failure reported by a cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend could not be reached
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A store for responses of side-effect-free requests.
///
/// A `segment` of `None` addresses the unsegmented space on `get`/`store`,
/// and every segment on `flush`.
pub trait ResponseCache: Send + Sync {
    fn get<'a>(
        &'a self,
        segment: Option<&'a str>,
        response_type: TypeTag,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Box<dyn BaseResponse>>, CacheError>>;

    fn store<'a>(
        &'a self,
        segment: Option<&'a str>,
        key: &'a str,
        response: Box<dyn BaseResponse>,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Drop every entry of `response_type`.
    fn flush<'a>(
        &'a self,
        segment: Option<&'a str>,
        response_type: TypeTag,
    ) -> BoxFuture<'a, Result<(), CacheError>>;
}

impl<C: ResponseCache + ?Sized> ResponseCache for Arc<C> {
    fn get<'a>(
        &'a self,
        segment: Option<&'a str>,
        response_type: TypeTag,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Box<dyn BaseResponse>>, CacheError>> {
        (**self).get(segment, response_type, key)
    }

    fn store<'a>(
        &'a self,
        segment: Option<&'a str>,
        key: &'a str,
        response: Box<dyn BaseResponse>,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        (**self).store(segment, key, response, ttl)
    }

    fn flush<'a>(
        &'a self,
        segment: Option<&'a str>,
        response_type: TypeTag,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        (**self).flush(segment, response_type)
    }
}
