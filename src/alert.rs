//! Operational alerts raised by the pipeline (SLA breaches, degraded cache).

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use crate::message::CorrelationId;

/// Something an operator should hear about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Alert {
    /// A request took longer than its SLA.
    SlaBreached {
        request_type: String,
        correlation_id: CorrelationId,
        sla: Duration,
        elapsed: Duration,
    },
    /// The response cache failed; the request was served without it.
    CacheUnavailable {
        operation: &'static str,
        response_type: String,
        reason: String,
    },
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::SlaBreached {
                request_type,
                correlation_id,
                sla,
                elapsed,
            } => write!(
                f,
                "{request_type} ({correlation_id}) took {}ms, SLA is {}ms",
                elapsed.as_millis(),
                sla.as_millis()
            ),
            Alert::CacheUnavailable {
                operation,
                response_type,
                reason,
            } => write!(f, "cache {operation} for {response_type} failed: {reason}"),
        }
    }
}

/// Destination for alerts (pager, event log, chat...).
pub trait Alerter: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn alert(&self, alert: &Alert) -> anyhow::Result<()>;
}

impl<A: Alerter + ?Sized> Alerter for Arc<A> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn alert(&self, alert: &Alert) -> anyhow::Result<()> {
        (**self).alert(alert)
    }
}

/// Writes alerts as `warn` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAlerter;

impl Alerter for TracingAlerter {
    fn name(&self) -> &str {
        "tracing"
    }

    fn alert(&self, alert: &Alert) -> anyhow::Result<()> {
        tracing::warn!(%alert, "alert raised");
        Ok(())
    }
}

/// Fans an alert out to every registered [`Alerter`].
///
/// Alerters are called synchronously, one after the other. A failing or
/// panicking alerter is logged and skipped; raising an alert never fails.
#[derive(Clone, Default)]
pub struct AlertSink {
    alerters: Arc<[Arc<dyn Alerter>]>,
}

impl AlertSink {
    pub fn new(alerters: Vec<Arc<dyn Alerter>>) -> Self {
        Self {
            alerters: alerters.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.alerters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerters.is_empty()
    }

    pub fn raise(&self, alert: &Alert) {
        for alerter in self.alerters.iter() {
            match catch_unwind(AssertUnwindSafe(|| alerter.alert(alert))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::error!(alerter = alerter.name(), %alert, ?error, "alerter failed");
                }
                Err(_) => {
                    tracing::error!(alerter = alerter.name(), %alert, "alerter panicked");
                }
            }
        }
    }
}

impl fmt::Debug for AlertSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.alerters.iter().map(|a| a.name()))
            .finish()
    }
}
