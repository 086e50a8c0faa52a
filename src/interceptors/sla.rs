use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::alert::{Alert, AlertSink};
use crate::chain::{InterceptionPriority, Interceptor, Invocation};
use crate::error::Result;
use crate::message::CorrelationId;
use crate::send::SendPipeline;

/// Raises [`Alert::SlaBreached`] for every request of a Send that took
/// longer than its SLA. Observes only; never cancels.
pub struct SlaSendInterceptor {
    alerts: AlertSink,
    default_sla: Option<Duration>,
}

impl SlaSendInterceptor {
    pub fn new(alerts: AlertSink, default_sla: Option<Duration>) -> Self {
        Self {
            alerts,
            default_sla,
        }
    }
}

impl Interceptor<SendPipeline> for SlaSendInterceptor {
    fn name(&self) -> &str {
        "sla"
    }

    fn priority(&self) -> InterceptionPriority {
        InterceptionPriority::HIGHEST
    }

    fn intercept<'a>(
        &'a self,
        invocation: &'a mut Invocation<'_, SendPipeline>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            // Inner interceptors may reshape the batch, so capture it first.
            let watched: Vec<(String, CorrelationId, Duration)> = invocation
                .input()
                .iter()
                .filter_map(|request| {
                    let sla = request.sla_threshold().or(self.default_sla)?;
                    Some((request.request_type().to_string(), request.correlation_id(), sla))
                })
                .collect();

            let started = Instant::now();
            let result = invocation.proceed().await;
            let elapsed = started.elapsed();

            for (request_type, correlation_id, sla) in watched {
                if elapsed > sla {
                    self.alerts.raise(&Alert::SlaBreached {
                        request_type,
                        correlation_id,
                        sla,
                        elapsed,
                    });
                }
            }
            result
        }
        .boxed()
    }
}
