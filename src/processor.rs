//! Processors execute partitions of a Send batch, locally or remotely.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tracing::Instrument as _;

use crate::error::{DispatchError, Result};
use crate::handle::HandleDispatcher;
use crate::message::BaseRequest;
use crate::registry::HandlerRegistry;
use crate::responses::ResponsesGroup;

/// Something able to answer a set of requests.
pub trait RequestProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this processor claims `request`. Must not have side effects.
    fn can_process(&self, request: &dyn BaseRequest) -> bool;

    /// Answer every request of `requests`.
    fn process(&self, requests: Vec<Arc<dyn BaseRequest>>) -> BoxFuture<'_, Result<ResponsesGroup>>;
}

impl<P: RequestProcessor + ?Sized> RequestProcessor for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn can_process(&self, request: &dyn BaseRequest) -> bool {
        (**self).can_process(request)
    }

    fn process(&self, requests: Vec<Arc<dyn BaseRequest>>) -> BoxFuture<'_, Result<ResponsesGroup>> {
        (**self).process(requests)
    }
}

/// Runs requests through in-process handlers, one task per request.
pub struct LocalRequestProcessor {
    registry: Arc<HandlerRegistry>,
    dispatcher: HandleDispatcher,
}

impl LocalRequestProcessor {
    pub const NAME: &'static str = "local";

    pub fn new(registry: Arc<HandlerRegistry>, dispatcher: HandleDispatcher) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }
}

impl RequestProcessor for LocalRequestProcessor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn can_process(&self, request: &dyn BaseRequest) -> bool {
        self.registry.can_handle(request)
    }

    fn process(&self, requests: Vec<Arc<dyn BaseRequest>>) -> BoxFuture<'_, Result<ResponsesGroup>> {
        async move {
            let units = requests.iter().cloned().map(|request| {
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(
                    async move {
                        let correlation_id = request.correlation_id();
                        let response = dispatcher.handle(request).await?;
                        Ok::<_, DispatchError>((correlation_id, response))
                    }
                    .in_current_span(),
                )
            });
            let results = join_all(units).await;

            let mut partial = ResponsesGroup::with_capacity(requests.len());
            let mut failures = Vec::new();
            for (request, result) in requests.iter().zip(results) {
                match result {
                    Ok(Ok((correlation_id, response))) => {
                        partial.insert(correlation_id, response);
                    }
                    Ok(Err(error)) => failures.push(error),
                    Err(join_error) => failures.push(DispatchError::TaskFailed {
                        unit: format!(
                            "handling of {} ({})",
                            request.request_type(),
                            request.correlation_id()
                        ),
                        reason: join_error.to_string(),
                    }),
                }
            }

            if let Some(error) = DispatchError::aggregate(failures) {
                return Err(error);
            }
            ResponsesGroup::assemble(&requests, [partial])
        }
        .boxed()
    }
}

/// Carries requests to another process and brings the responses back.
pub trait RequestTransport: Send + Sync {
    fn exchange<'a>(
        &'a self,
        group: &'a str,
        requests: Vec<Arc<dyn BaseRequest>>,
    ) -> BoxFuture<'a, anyhow::Result<ResponsesGroup>>;
}

impl<T: RequestTransport + ?Sized> RequestTransport for Arc<T> {
    fn exchange<'a>(
        &'a self,
        group: &'a str,
        requests: Vec<Arc<dyn BaseRequest>>,
    ) -> BoxFuture<'a, anyhow::Result<ResponsesGroup>> {
        (**self).exchange(group, requests)
    }
}

/// Claims requests by group name and forwards them over a [`RequestTransport`].
pub struct RemoteRequestProcessor {
    name: String,
    groups: BTreeSet<String>,
    transport: Arc<dyn RequestTransport>,
}

impl RemoteRequestProcessor {
    pub fn new(
        name: impl Into<String>,
        groups: impl IntoIterator<Item = impl Into<String>>,
        transport: Arc<dyn RequestTransport>,
    ) -> Self {
        Self {
            name: name.into(),
            groups: groups.into_iter().map(Into::into).collect(),
            transport,
        }
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }
}

impl RequestProcessor for RemoteRequestProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_process(&self, request: &dyn BaseRequest) -> bool {
        self.groups.contains(request.group())
    }

    fn process(&self, requests: Vec<Arc<dyn BaseRequest>>) -> BoxFuture<'_, Result<ResponsesGroup>> {
        async move {
            let mut by_group: Vec<(String, Vec<Arc<dyn BaseRequest>>)> = Vec::new();
            for request in &requests {
                match by_group.iter_mut().find(|(group, _)| group == request.group()) {
                    Some((_, batch)) => batch.push(request.clone()),
                    None => by_group.push((request.group().to_string(), vec![request.clone()])),
                }
            }

            let exchanges = by_group.into_iter().map(|(group, batch)| async move {
                tracing::debug!(processor = %self.name, %group, requests = batch.len(), "exchange");
                self.transport
                    .exchange(&group, batch)
                    .await
                    .map_err(|source| DispatchError::Transport { group, source })
            });

            let mut partials = Vec::new();
            let mut failures = Vec::new();
            for result in join_all(exchanges).await {
                match result {
                    Ok(partial) => partials.push(partial),
                    Err(error) => {
                        tracing::error!(processor = %self.name, error = ?error, "remote exchange failed");
                        failures.push(error);
                    }
                }
            }

            if let Some(error) = DispatchError::aggregate(failures) {
                return Err(error);
            }
            ResponsesGroup::assemble(&requests, partials)
        }
        .boxed()
    }
}
