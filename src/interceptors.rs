//! Built-in interceptors wired by [`ColomboBuilder`](crate::ColomboBuilder).

mod cache;
mod context;
mod sla;
mod validation;

pub use cache::CacheSendInterceptor;
pub use context::{ContextDefaultsSendInterceptor, RequiredContextSendInterceptor};
pub use sla::SlaSendInterceptor;
pub use validation::ValidationHandleInterceptor;
