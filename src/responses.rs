//! The set of responses produced by one Send.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{DispatchError, Result};
use crate::message::{BaseRequest, BaseResponse, CorrelationId, Request};

/// Typed handle on the response to a request added to a [`SendBatch`].
///
/// [`SendBatch`]: crate::SendBatch
pub struct ResponseKey<R> {
    correlation_id: CorrelationId,
    _request: PhantomData<fn() -> R>,
}

impl<R: Request> ResponseKey<R> {
    pub(crate) fn new(request: &R) -> Self {
        Self {
            correlation_id: request.correlation_id(),
            _request: PhantomData,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

impl<R> Clone for ResponseKey<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for ResponseKey<R> {}

impl<R> std::fmt::Debug for ResponseKey<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ResponseKey").field(&self.correlation_id).finish()
    }
}

/// Responses keyed by the correlation id of the request they answer.
///
/// Iteration follows insertion order; a group assembled by the Send pipeline
/// is ordered like the submitted requests.
#[derive(Clone, Debug, Default)]
pub struct ResponsesGroup {
    order: Vec<CorrelationId>,
    responses: HashMap<CorrelationId, Box<dyn BaseResponse>>,
}

impl ResponsesGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: Vec::with_capacity(capacity),
            responses: HashMap::with_capacity(capacity),
        }
    }

    /// Insert the response for `correlation_id`, returning any previous one.
    /// A replaced response keeps its original position.
    pub fn insert(
        &mut self,
        correlation_id: CorrelationId,
        response: Box<dyn BaseResponse>,
    ) -> Option<Box<dyn BaseResponse>> {
        let previous = self.responses.insert(correlation_id, response);
        if previous.is_none() {
            self.order.push(correlation_id);
        }
        previous
    }

    pub fn remove(&mut self, correlation_id: &CorrelationId) -> Option<Box<dyn BaseResponse>> {
        let removed = self.responses.remove(correlation_id);
        if removed.is_some() {
            self.order.retain(|id| id != correlation_id);
        }
        removed
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.responses.contains_key(correlation_id)
    }

    pub fn get_erased(&self, correlation_id: &CorrelationId) -> Option<&dyn BaseResponse> {
        self.responses.get(correlation_id).map(|r| &**r)
    }

    pub fn get_erased_mut(
        &mut self,
        correlation_id: &CorrelationId,
    ) -> Option<&mut Box<dyn BaseResponse>> {
        self.responses.get_mut(correlation_id)
    }

    /// The response to `request`.
    pub fn get<R: Request>(&self, request: &R) -> Result<&R::Response> {
        self.get_by_id::<R>(request.correlation_id())
    }

    pub fn get_key<R: Request>(&self, key: ResponseKey<R>) -> Result<&R::Response> {
        self.get_by_id::<R>(key.correlation_id)
    }

    /// Remove and return the response to `request`.
    pub fn take<R: Request>(&mut self, request: &R) -> Result<R::Response> {
        self.take_by_id::<R>(request.correlation_id())
    }

    pub fn take_key<R: Request>(&mut self, key: ResponseKey<R>) -> Result<R::Response> {
        self.take_by_id::<R>(key.correlation_id)
    }

    fn get_by_id<R: Request>(&self, correlation_id: CorrelationId) -> Result<&R::Response> {
        let response = self
            .responses
            .get(&correlation_id)
            .ok_or_else(|| missing::<R>(correlation_id))?;
        response
            .downcast_ref::<R::Response>()
            .ok_or_else(|| DispatchError::TypeMismatch {
                expected: std::any::type_name::<R::Response>().to_string(),
                found: response.response_type().name().to_string(),
            })
    }

    fn take_by_id<R: Request>(&mut self, correlation_id: CorrelationId) -> Result<R::Response> {
        let response = self
            .remove(&correlation_id)
            .ok_or_else(|| missing::<R>(correlation_id))?;
        response.downcast::<R::Response>()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn correlation_ids(&self) -> &[CorrelationId] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (CorrelationId, &dyn BaseResponse)> {
        self.order
            .iter()
            .filter_map(|id| self.responses.get(id).map(|r| (*id, &**r)))
    }

    /// Move every response of `other` into this group.
    pub fn extend(&mut self, other: ResponsesGroup) {
        for (id, response) in other {
            self.insert(id, response);
        }
    }

    /// Check a set of partial groups against the requests they answer and
    /// merge them into one group ordered like `requests`.
    pub fn assemble(
        requests: &[Arc<dyn BaseRequest>],
        partials: impl IntoIterator<Item = ResponsesGroup>,
    ) -> Result<ResponsesGroup> {
        let mut pool: HashMap<CorrelationId, Box<dyn BaseResponse>> = HashMap::new();
        for partial in partials {
            for (correlation_id, response) in partial {
                if pool.insert(correlation_id, response).is_some() {
                    // Two processors answered the same request.
                    return Err(DispatchError::UnexpectedResponse { correlation_id });
                }
            }
        }

        let mut group = ResponsesGroup::with_capacity(requests.len());
        for request in requests {
            let correlation_id = request.correlation_id();
            let response =
                pool.remove(&correlation_id)
                    .ok_or_else(|| DispatchError::MissingResponse {
                        request_type: request.request_type().to_string(),
                        correlation_id,
                    })?;
            group.insert(correlation_id, response);
        }

        if let Some(correlation_id) = pool.into_keys().next() {
            return Err(DispatchError::UnexpectedResponse { correlation_id });
        }

        Ok(group)
    }
}

impl IntoIterator for ResponsesGroup {
    type Item = (CorrelationId, Box<dyn BaseResponse>);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(mut self) -> Self::IntoIter {
        let items: Vec<_> = self
            .order
            .iter()
            .filter_map(|id| self.responses.remove(id).map(|r| (*id, r)))
            .collect();
        items.into_iter()
    }
}

fn missing<R: Request>(correlation_id: CorrelationId) -> DispatchError {
    DispatchError::MissingResponse {
        request_type: crate::message::TypeTag::of::<R>().to_string(),
        correlation_id,
    }
}
