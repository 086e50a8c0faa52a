//! Deferred sends: collect requests as futures and send them as one batch.
//!
//! ```rust,ignore
//! let stateful = colombo.stateful();
//! let customer = stateful.future_send(CustomerRequest::new(42));
//! let orders = stateful.future_send(OrdersRequest::for_customer(42));
//! // Both go out in a single Send when the first result is needed.
//! let customer = customer.await?;
//! let orders = orders.await?;
//! ```

use std::collections::HashMap;
use std::future::IntoFuture;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::Instrument as _;

use crate::error::{DispatchError, Result};
use crate::message::{BaseRequest, BaseResponse, CorrelationId, Request, Response};
use crate::send::MessageBus;

type Outcome = std::result::Result<Box<dyn BaseResponse>, Arc<DispatchError>>;
type Callback = Box<dyn FnOnce(Outcome) + Send>;

enum Slot {
    /// Not answered yet; holds the consumer if one registered.
    Pending(Option<Callback>),
    /// Answered before anybody asked.
    Arrived(Outcome),
}

#[derive(Default)]
struct State {
    sends: usize,
    unsent: Vec<Arc<dyn BaseRequest>>,
    slots: HashMap<CorrelationId, Slot>,
}

struct Inner {
    bus: MessageBus,
    max_allowed_sends: usize,
    state: Mutex<State>,
}

impl Inner {
    /// Hand each outcome to its slot. Consumers are called after the lock is
    /// released.
    fn deliver(&self, outcomes: Vec<(CorrelationId, Outcome)>) {
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock();
            for (correlation_id, outcome) in outcomes {
                match state.slots.remove(&correlation_id) {
                    Some(Slot::Pending(Some(callback))) => ready.push((callback, outcome)),
                    Some(Slot::Pending(None)) => {
                        state.slots.insert(correlation_id, Slot::Arrived(outcome));
                    }
                    // Already delivered.
                    Some(arrived @ Slot::Arrived(_)) => {
                        state.slots.insert(correlation_id, arrived);
                    }
                    // The future was dropped without asking.
                    None => {
                        tracing::trace!(%correlation_id, "discarding unclaimed stateful result");
                    }
                }
            }
        }

        for (callback, outcome) in ready {
            callback(outcome);
        }
    }

    /// Register the single consumer of a slot, calling it at once if the
    /// outcome already arrived.
    fn subscribe(&self, correlation_id: CorrelationId, callback: Callback) {
        let arrived = {
            let mut state = self.state.lock();
            match state.slots.remove(&correlation_id) {
                Some(Slot::Pending(None)) => {
                    state
                        .slots
                        .insert(correlation_id, Slot::Pending(Some(callback)));
                    return;
                }
                Some(Slot::Arrived(outcome)) => outcome,
                Some(pending @ Slot::Pending(Some(_))) => {
                    state.slots.insert(correlation_id, pending);
                    Err(Arc::new(DispatchError::TaskFailed {
                        unit: format!("stateful request {correlation_id}"),
                        reason: "result already has a consumer".to_string(),
                    }))
                }
                None => Err(Arc::new(DispatchError::TaskFailed {
                    unit: format!("stateful request {correlation_id}"),
                    reason: "result was already consumed".to_string(),
                })),
            }
        };
        callback(arrived);
    }

    fn is_unsent(&self, correlation_id: CorrelationId) -> bool {
        self.state
            .lock()
            .unsent
            .iter()
            .any(|request| request.correlation_id() == correlation_id)
    }

    /// Drop the slot of a future nobody consumed. A slot with a registered
    /// consumer stays until its outcome is delivered.
    fn forget(&self, correlation_id: CorrelationId) {
        let mut state = self.state.lock();
        if let Some(Slot::Pending(Some(_))) = state.slots.get(&correlation_id) {
            return;
        }
        state.slots.remove(&correlation_id);
    }

    async fn flush(self: &Arc<Self>) -> Result<()> {
        let batch = {
            let mut state = self.state.lock();
            if state.unsent.is_empty() {
                return Ok(());
            }
            let batch = std::mem::take(&mut state.unsent);
            if state.sends >= self.max_allowed_sends {
                Err(batch)
            } else {
                state.sends += 1;
                Ok(batch)
            }
        };

        let batch = match batch {
            Ok(batch) => batch,
            Err(refused) => {
                let error = Arc::new(DispatchError::SendLimitExceeded {
                    limit: self.max_allowed_sends,
                });
                tracing::error!(requests = refused.len(), %error, "stateful send refused");
                self.deliver(
                    refused
                        .iter()
                        .map(|request| (request.correlation_id(), Err(error.clone())))
                        .collect(),
                );
                return Err(DispatchError::Shared(error));
            }
        };

        // The batch has left `unsent`; delivery must outlive a cancelled caller.
        let pending = PendingBatch {
            inner: self.clone(),
            requested: batch
                .iter()
                .map(|request| (request.correlation_id(), request.request_type().to_string()))
                .collect(),
        };
        let task = tokio::spawn(pending.send(batch).in_current_span());
        match task.await {
            Ok(result) => result,
            Err(join_error) => Err(DispatchError::TaskFailed {
                unit: "stateful flush".to_string(),
                reason: join_error.to_string(),
            }),
        }
    }
}

/// A batch taken out of `unsent` whose outcomes are still owed to its slots.
/// Dropped before delivery (panic, runtime shutdown), it fails every slot.
struct PendingBatch {
    inner: Arc<Inner>,
    requested: Vec<(CorrelationId, String)>,
}

impl PendingBatch {
    async fn send(mut self, batch: Vec<Arc<dyn BaseRequest>>) -> Result<()> {
        tracing::debug!(requests = batch.len(), "flushing stateful requests");
        let result = self.inner.bus.send_batch(batch).await;
        let requested = std::mem::take(&mut self.requested);

        match result {
            Ok(mut responses) => {
                let outcomes = requested
                    .into_iter()
                    .map(|(correlation_id, request_type)| {
                        let outcome = responses.remove(&correlation_id).ok_or_else(|| {
                            Arc::new(DispatchError::MissingResponse {
                                request_type,
                                correlation_id,
                            })
                        });
                        (correlation_id, outcome)
                    })
                    .collect();
                self.inner.deliver(outcomes);
                Ok(())
            }
            Err(error) => {
                let error = Arc::new(error);
                self.inner.deliver(
                    requested
                        .into_iter()
                        .map(|(correlation_id, _)| (correlation_id, Err(error.clone())))
                        .collect(),
                );
                Err(DispatchError::Shared(error))
            }
        }
    }
}

impl Drop for PendingBatch {
    fn drop(&mut self) {
        if self.requested.is_empty() {
            return;
        }
        let error = Arc::new(DispatchError::TaskFailed {
            unit: "stateful flush".to_string(),
            reason: "the batch was abandoned before its results arrived".to_string(),
        });
        tracing::error!(requests = self.requested.len(), %error, "stateful batch abandoned");
        self.inner.deliver(
            self.requested
                .drain(..)
                .map(|(correlation_id, _)| (correlation_id, Err(error.clone())))
                .collect(),
        );
    }
}

/// A message bus for one logical unit of work that defers sending.
///
/// Requests registered with [`future_send`](Self::future_send) are held back
/// until [`flush`](Self::flush) runs or one of their results is awaited; all
/// held requests then go out as a single batch.
#[derive(Clone)]
pub struct StatefulMessageBus {
    inner: Arc<Inner>,
}

impl StatefulMessageBus {
    pub fn new(bus: MessageBus, max_allowed_sends: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                max_allowed_sends,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Register `request` and return a future for its response. Nothing is
    /// sent yet.
    pub fn future_send<R: Request>(&self, request: R) -> ResponseFuture<R::Response> {
        let correlation_id = request.correlation_id();
        {
            let mut state = self.inner.state.lock();
            state.unsent.push(Arc::new(request));
            state.slots.insert(correlation_id, Slot::Pending(None));
        }
        ResponseFuture {
            correlation_id,
            inner: self.inner.clone(),
            _response: PhantomData,
        }
    }

    /// Send every registered request that has not been sent yet.
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    /// Requests registered but not sent yet.
    pub fn unsent(&self) -> usize {
        self.inner.state.lock().unsent.len()
    }

    /// Number of batches sent so far.
    pub fn sends(&self) -> usize {
        self.inner.state.lock().sends
    }

    pub fn max_allowed_sends(&self) -> usize {
        self.inner.max_allowed_sends
    }

    /// Results held for futures that have not consumed them yet.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().slots.len()
    }
}

impl std::fmt::Debug for StatefulMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("StatefulMessageBus")
            .field("sends", &state.sends)
            .field("unsent", &state.unsent.len())
            .field("slots", &state.slots.len())
            .finish()
    }
}

/// The eventual response to a request registered on a [`StatefulMessageBus`].
pub struct ResponseFuture<T> {
    correlation_id: CorrelationId,
    inner: Arc<Inner>,
    _response: PhantomData<fn() -> T>,
}

impl<T: Response> ResponseFuture<T> {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Wait for the response, sending the pending batch first if this
    /// request has not gone out yet.
    pub async fn get(self) -> Result<T> {
        if self.inner.is_unsent(self.correlation_id) {
            // Failures reach every slot of the batch, ours included.
            if let Err(error) = self.inner.flush().await {
                tracing::debug!(%error, "flush triggered by get failed");
            }
        }

        let (tx, rx) = oneshot::channel();
        self.inner.subscribe(
            self.correlation_id,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );

        match rx.await {
            Ok(Ok(response)) => response.downcast::<T>(),
            Ok(Err(error)) => Err(DispatchError::Shared(error)),
            Err(_) => Err(DispatchError::TaskFailed {
                unit: format!("stateful request {}", self.correlation_id),
                reason: "the bus was dropped before the result arrived".to_string(),
            }),
        }
    }

    /// Register a callback pair. Exactly one of them runs, exactly once:
    /// right away if the result is already known, otherwise from the task
    /// that delivers it. Does not trigger a send.
    pub fn on_complete<S, E>(self, on_success: S, on_error: E)
    where
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(DispatchError) + Send + 'static,
    {
        self.inner.subscribe(
            self.correlation_id,
            Box::new(move |outcome| match outcome {
                Ok(response) => match response.downcast::<T>() {
                    Ok(response) => on_success(response),
                    Err(error) => on_error(error),
                },
                Err(error) => on_error(DispatchError::Shared(error)),
            }),
        );
    }
}

impl<T> Drop for ResponseFuture<T> {
    fn drop(&mut self) {
        self.inner.forget(self.correlation_id);
    }
}

impl<T: Response> IntoFuture for ResponseFuture<T> {
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        self.get().boxed()
    }
}

impl<T> std::fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ResponseFuture")
            .field(&self.correlation_id)
            .finish()
    }
}
