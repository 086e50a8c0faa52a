//! Error types for the dispatch pipeline

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::message::CorrelationId;

/// Result type alias for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised while sending, handling or notifying.
///
/// Configuration errors (`NoProcessor`, `AmbiguousHandler`, ...) are raised
/// before any work is scheduled and always name every candidate that was
/// considered. Execution errors carry the identity of the failing component.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Send was called without any request
    #[error("cannot send an empty batch of requests")]
    EmptyBatch,

    /// The same request identity appears twice in one batch
    #[error("request {request_type} ({correlation_id}) appears more than once in the batch")]
    DuplicateRequest {
        request_type: String,
        correlation_id: CorrelationId,
    },

    /// No processor claimed the request
    #[error(
        "no processor can process {request_type} ({correlation_id}); processors considered: [{}]",
        .candidates.join(", ")
    )]
    NoProcessor {
        request_type: String,
        correlation_id: CorrelationId,
        candidates: Vec<String>,
    },

    /// More than one processor claimed the request
    #[error(
        "{request_type} ({correlation_id}) is claimed by several processors: [{}]",
        .claimants.join(", ")
    )]
    AmbiguousProcessor {
        request_type: String,
        correlation_id: CorrelationId,
        claimants: Vec<String>,
    },

    /// No handler is registered, or none survived context filtering
    #[error(
        "no handler found for {message_type}; candidates considered: [{}]",
        .candidates.join(", ")
    )]
    NoHandler {
        message_type: String,
        candidates: Vec<String>,
    },

    /// Several handlers match and none is specialized for the context
    #[error(
        "ambiguous handlers for {message_type}; candidates considered: [{}]",
        .candidates.join(", ")
    )]
    AmbiguousHandler {
        message_type: String,
        candidates: Vec<String>,
    },

    /// A key the request type requires in its context is absent
    #[error("{request_type} requires context key `{key}`")]
    MissingContext { request_type: String, key: String },

    /// The handler itself failed
    #[error("handler {handler} failed on {request_type}")]
    Handler {
        handler: String,
        request_type: String,
        #[source]
        source: anyhow::Error,
    },

    /// A processor failed as a whole
    #[error("processor {processor} failed")]
    Processor {
        processor: String,
        #[source]
        source: anyhow::Error,
    },

    /// The remote transport failed
    #[error("transport for group `{group}` failed")]
    Transport {
        group: String,
        #[source]
        source: anyhow::Error,
    },

    /// A spawned unit of work panicked or was cancelled
    #[error("{unit} did not complete: {reason}")]
    TaskFailed { unit: String, reason: String },

    /// A processor returned without a response for a request it was given
    #[error("no response was produced for {request_type} ({correlation_id})")]
    MissingResponse {
        request_type: String,
        correlation_id: CorrelationId,
    },

    /// A processor returned a response nobody asked for
    #[error("received a response for unknown request {correlation_id}")]
    UnexpectedResponse { correlation_id: CorrelationId },

    /// A message or response did not have the expected concrete type
    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// The chain completed without any output being produced
    #[error("the {pipeline} chain completed without producing an output")]
    NoOutput { pipeline: &'static str },

    /// The stateful bus was asked to send more batches than allowed
    #[error("stateful message bus exceeded its limit of {limit} send(s)")]
    SendLimitExceeded { limit: usize },

    /// Several concurrent units failed
    #[error("{}", AggregateDisplay(.0))]
    Aggregate(Vec<DispatchError>),

    /// A failure delivered to several waiters of the same batch
    #[error(transparent)]
    Shared(Arc<DispatchError>),

    /// Invalid configuration handed to the builder
    #[error("configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// Collapse a list of failures: a single failure is returned as is,
    /// several are wrapped in [`DispatchError::Aggregate`].
    pub fn aggregate(mut errors: Vec<DispatchError>) -> Option<DispatchError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(DispatchError::Aggregate(errors)),
        }
    }

    /// Every leaf failure, flattening nested aggregates.
    pub fn failures(&self) -> Vec<&DispatchError> {
        match self {
            DispatchError::Aggregate(errors) => errors.iter().flat_map(|e| e.failures()).collect(),
            DispatchError::Shared(error) => error.failures(),
            other => vec![other],
        }
    }

    /// True for errors that indicate a wiring problem rather than a runtime failure.
    pub fn is_configuration_error(&self) -> bool {
        if let DispatchError::Shared(error) = self {
            return error.is_configuration_error();
        }
        matches!(
            self,
            DispatchError::NoProcessor { .. }
                | DispatchError::AmbiguousProcessor { .. }
                | DispatchError::NoHandler { .. }
                | DispatchError::AmbiguousHandler { .. }
                | DispatchError::EmptyBatch
                | DispatchError::DuplicateRequest { .. }
                | DispatchError::MissingContext { .. }
                | DispatchError::Config(_)
        )
    }
}

struct AggregateDisplay<'a>(&'a [DispatchError]);

impl fmt::Display for AggregateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} concurrent failures:", self.0.len())?;
        for (index, error) in self.0.iter().enumerate() {
            write!(f, " [{}] {}", index + 1, error)?;
            // Each member's cause chain, inline.
            let mut cause = std::error::Error::source(error);
            while let Some(source) = cause {
                write!(f, ": {source}")?;
                cause = source.source();
            }
        }
        Ok(())
    }
}
