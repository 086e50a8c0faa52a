//! Send pipeline: routes a batch of requests to processors and gathers the
//! responses.

use std::collections::HashSet;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tracing::Instrument as _;

use crate::chain::{Interceptor, InterceptorChain, Pipeline, Terminal};
use crate::error::{DispatchError, Result};
use crate::message::{BaseRequest, Request};
use crate::processor::RequestProcessor;
use crate::responses::{ResponseKey, ResponsesGroup};
use crate::scope::DispatchScope;

pub struct SendPipeline;

impl Pipeline for SendPipeline {
    type Input = Vec<Arc<dyn BaseRequest>>;
    type Output = ResponsesGroup;
    const NAME: &'static str = "send";
}

/// Interceptor on the sending side.
pub type SendInterceptor = dyn Interceptor<SendPipeline>;

/// Partitions the batch by processor and runs the partitions in parallel.
struct ProcessorTerminal {
    processors: Arc<[Arc<dyn RequestProcessor>]>,
}

impl ProcessorTerminal {
    /// Assign every request to the single processor that claims it.
    fn partition(
        &self,
        requests: &[Arc<dyn BaseRequest>],
    ) -> Result<Vec<(Arc<dyn RequestProcessor>, Vec<Arc<dyn BaseRequest>>)>> {
        let mut partitions: Vec<Vec<Arc<dyn BaseRequest>>> = vec![Vec::new(); self.processors.len()];

        for request in requests {
            let claims: Vec<usize> = self
                .processors
                .iter()
                .enumerate()
                .filter(|(_, processor)| processor.can_process(&**request))
                .map(|(index, _)| index)
                .collect();

            match claims.as_slice() {
                [index] => partitions[*index].push(request.clone()),
                [] => {
                    return Err(DispatchError::NoProcessor {
                        request_type: request.request_type().to_string(),
                        correlation_id: request.correlation_id(),
                        candidates: self.names(),
                    });
                }
                _ => {
                    return Err(DispatchError::AmbiguousProcessor {
                        request_type: request.request_type().to_string(),
                        correlation_id: request.correlation_id(),
                        claimants: claims
                            .iter()
                            .map(|index| self.processors[*index].name().to_string())
                            .collect(),
                    });
                }
            }
        }

        Ok(self
            .processors
            .iter()
            .cloned()
            .zip(partitions)
            .filter(|(_, partition)| !partition.is_empty())
            .collect())
    }

    fn names(&self) -> Vec<String> {
        self.processors
            .iter()
            .map(|processor| processor.name().to_string())
            .collect()
    }
}

impl Terminal<SendPipeline> for ProcessorTerminal {
    fn run<'a>(
        &'a self,
        requests: &'a Vec<Arc<dyn BaseRequest>>,
        _scope: &'a DispatchScope,
    ) -> BoxFuture<'a, Result<ResponsesGroup>> {
        async move {
            let partitions = self.partition(requests)?;

            let units: Vec<_> = partitions
                .into_iter()
                .map(|(processor, partition)| {
                    let name = processor.name().to_string();
                    tracing::debug!(processor = %name, requests = partition.len(), "dispatching partition");
                    let task = tokio::spawn(
                        async move { processor.process(partition).await }.in_current_span(),
                    );
                    (name, task)
                })
                .collect();

            let (names, tasks): (Vec<String>, Vec<_>) = units.into_iter().unzip();
            let mut partials = Vec::with_capacity(tasks.len());
            let mut failures = Vec::new();
            for (name, result) in names.into_iter().zip(join_all(tasks).await) {
                match result {
                    Ok(Ok(partial)) => partials.push(partial),
                    Ok(Err(error)) => {
                        tracing::error!(processor = %name, error = ?error, "processor failed");
                        failures.push(error);
                    }
                    Err(join_error) => {
                        tracing::error!(processor = %name, %join_error, "processor task failed");
                        failures.push(DispatchError::TaskFailed {
                            unit: format!("processor {name}"),
                            reason: join_error.to_string(),
                        });
                    }
                }
            }

            if let Some(error) = DispatchError::aggregate(failures) {
                return Err(error);
            }
            ResponsesGroup::assemble(requests, partials)
        }
        .boxed()
    }
}

/// Client-side entry point: sends requests and returns their responses.
#[derive(Clone)]
pub struct MessageBus {
    chain: Arc<InterceptorChain<SendPipeline>>,
}

impl MessageBus {
    pub fn new(
        processors: Vec<Arc<dyn RequestProcessor>>,
        interceptors: &[Arc<SendInterceptor>],
    ) -> Self {
        let terminal = Arc::new(ProcessorTerminal {
            processors: processors.into(),
        });
        Self {
            chain: Arc::new(InterceptorChain::build(interceptors, terminal)),
        }
    }

    /// Send one request and wait for its response.
    pub async fn send<R: Request>(&self, request: R) -> Result<R::Response> {
        let key = ResponseKey::new(&request);
        let mut responses = self.send_batch(vec![Arc::new(request)]).await?;
        responses.take_key(key)
    }

    /// Send several requests at once. On success the group holds exactly one
    /// response per request, in request order.
    pub async fn send_batch(&self, requests: Vec<Arc<dyn BaseRequest>>) -> Result<ResponsesGroup> {
        if requests.is_empty() {
            return Err(DispatchError::EmptyBatch);
        }

        let mut seen = HashSet::with_capacity(requests.len());
        for request in &requests {
            if !seen.insert(request.correlation_id()) {
                return Err(DispatchError::DuplicateRequest {
                    request_type: request.request_type().to_string(),
                    correlation_id: request.correlation_id(),
                });
            }
        }

        let span = tracing::info_span!("send", requests = requests.len());
        self.chain.run(requests).instrument(span).await
    }

    /// Start a batch with typed access to each response.
    pub fn batch(&self) -> SendBatch<'_> {
        SendBatch {
            bus: self,
            requests: Vec::new(),
        }
    }

    pub fn interceptor_names(&self) -> Vec<String> {
        self.chain.interceptor_names()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("interceptors", &self.chain.interceptor_names())
            .finish()
    }
}

/// Collects requests of different types for a single Send.
///
/// ```rust,ignore
/// let mut batch = bus.batch();
/// let hello = batch.add(HelloWorldRequest::new("Foo"));
/// let total = batch.add(TotalRequest::default());
/// let mut responses = batch.send().await?;
/// let hello = responses.take_key(hello)?;
/// ```
pub struct SendBatch<'b> {
    bus: &'b MessageBus,
    requests: Vec<Arc<dyn BaseRequest>>,
}

impl SendBatch<'_> {
    pub fn add<R: Request>(&mut self, request: R) -> ResponseKey<R> {
        let key = ResponseKey::new(&request);
        self.requests.push(Arc::new(request));
        key
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub async fn send(self) -> Result<ResponsesGroup> {
        self.bus.send_batch(self.requests).await
    }
}
