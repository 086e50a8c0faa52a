//! Notify pipeline: fire-and-forget fan-out to every interested handler.
//!
//! Each (notification, handler) pair runs in its own task. A failing or
//! panicking handler is logged and never affects the caller or the other
//! handlers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::task::JoinHandle;
use tracing::Instrument as _;

use crate::chain::{Interceptor, InterceptorChain, Pipeline, Terminal};
use crate::error::Result;
use crate::message::{BaseNotification, Notification};
use crate::registry::HandlerRegistry;
use crate::scope::DispatchScope;

pub struct NotifyPipeline;

impl Pipeline for NotifyPipeline {
    type Input = Vec<Arc<dyn BaseNotification>>;
    type Output = NotifyHandle;
    const NAME: &'static str = "notify";
}

/// Interceptor on the notification side.
pub type NotifyInterceptor = dyn Interceptor<NotifyPipeline>;

/// How one scheduled unit ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitOutcome {
    Succeeded,
    Failed(String),
}

struct Unit {
    label: String,
    task: JoinHandle<UnitOutcome>,
}

/// Units scheduled by one `notify` call.
///
/// Dropping the handle leaves the units running.
#[derive(Default)]
pub struct NotifyHandle {
    units: Vec<Unit>,
}

impl NotifyHandle {
    /// A handle with nothing scheduled.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> usize {
        self.units.len()
    }

    /// Wait for every unit to finish. Handler failures are reported, never
    /// returned as errors.
    pub async fn wait(self) -> NotifyReport {
        let (labels, tasks): (Vec<String>, Vec<JoinHandle<UnitOutcome>>) = self
            .units
            .into_iter()
            .map(|unit| (unit.label, unit.task))
            .unzip();

        let mut report = NotifyReport::default();
        for (label, joined) in labels.into_iter().zip(join_all(tasks).await) {
            match joined {
                Ok(UnitOutcome::Succeeded) => report.succeeded += 1,
                Ok(UnitOutcome::Failed(reason)) => report.failures.push(format!("{label}: {reason}")),
                Err(join_error) => report.failures.push(format!("{label}: {join_error}")),
            }
        }
        report
    }
}

impl std::fmt::Debug for NotifyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.units.iter().map(|unit| &unit.label))
            .finish()
    }
}

/// Summary of a waited-for `notify` call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub succeeded: usize,
    pub failures: Vec<String>,
}

impl NotifyReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed()
    }
}

/// Resolves every handler per notification and spawns one unit per pair.
struct FanOutTerminal {
    registry: Arc<HandlerRegistry>,
}

impl Terminal<NotifyPipeline> for FanOutTerminal {
    fn run<'a>(
        &'a self,
        notifications: &'a Vec<Arc<dyn BaseNotification>>,
        _scope: &'a DispatchScope,
    ) -> BoxFuture<'a, Result<NotifyHandle>> {
        async move {
            let mut handle = NotifyHandle::empty();
            for notification in notifications {
                let notification_type = notification.notification_type();
                let handlers = self.registry.resolve_notification_handlers(&**notification);
                if handlers.is_empty() {
                    tracing::warn!(%notification_type, "no handler registered for notification");
                    continue;
                }

                for handler in handlers {
                    let label = format!("{} <- {notification_type}", handler.name());
                    let notification = notification.clone();
                    let task = tokio::spawn(
                        async move {
                            let outcome = AssertUnwindSafe(handler.handle_erased(&*notification))
                                .catch_unwind()
                                .await;
                            match outcome {
                                Ok(Ok(())) => UnitOutcome::Succeeded,
                                Ok(Err(error)) => {
                                    tracing::error!(
                                        handler = handler.name(),
                                        %notification_type,
                                        ?error,
                                        "notification handler failed"
                                    );
                                    UnitOutcome::Failed(format!("{error:#}"))
                                }
                                Err(panic) => {
                                    let reason = panic_message(panic.as_ref());
                                    tracing::error!(
                                        handler = handler.name(),
                                        %notification_type,
                                        %reason,
                                        "notification handler panicked"
                                    );
                                    UnitOutcome::Failed(format!("panicked: {reason}"))
                                }
                            }
                        }
                        .in_current_span(),
                    );
                    handle.units.push(Unit { label, task });
                }
            }
            Ok(handle)
        }
        .boxed()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Entry point of the Notify pipeline.
#[derive(Clone)]
pub struct NotificationDispatcher {
    chain: Arc<InterceptorChain<NotifyPipeline>>,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, interceptors: &[Arc<NotifyInterceptor>]) -> Self {
        let terminal = Arc::new(FanOutTerminal { registry });
        Self {
            chain: Arc::new(InterceptorChain::build(interceptors, terminal)),
        }
    }

    /// Schedule every handler of every notification and return without
    /// waiting for them.
    pub async fn notify(&self, notifications: Vec<Arc<dyn BaseNotification>>) -> Result<NotifyHandle> {
        let span = tracing::info_span!("notify", notifications = notifications.len());
        let handle = self.chain.run(notifications).instrument(span).await?;
        tracing::debug!(units = handle.scheduled(), "notification units scheduled");
        Ok(handle)
    }

    pub async fn notify_one<N: Notification>(&self, notification: N) -> Result<NotifyHandle> {
        self.notify(vec![Arc::new(notification)]).await
    }

    pub fn interceptor_names(&self) -> Vec<String> {
        self.chain.interceptor_names()
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("interceptors", &self.chain.interceptor_names())
            .finish()
    }
}
