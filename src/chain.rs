//! Ordered interceptor chains shared by the Send, Handle and Notify pipelines.
//!
//! A chain is a singly linked list of [`ChainNode`]s: every interceptor node
//! owns the node that follows it and the last node is the pipeline's
//! [`Terminal`]. Each call creates a fresh [`Invocation`] positioned on the
//! first node and proceeds once.
//!
//! An interceptor either produces the output itself ([`Invocation::set_output`])
//! or calls [`Invocation::proceed`] and may look at the output afterwards.
//! Nothing forwards automatically.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{DispatchError, Result};
use crate::scope::DispatchScope;

/// The input and output types of one pipeline.
pub trait Pipeline: Send + Sync + 'static {
    type Input: Send + Sync;
    type Output: Send;

    /// Used in logs and in [`DispatchError::NoOutput`].
    const NAME: &'static str;
}

/// Position of an interceptor in its chain. Lower values run first (outer).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterceptionPriority(pub i32);

impl InterceptionPriority {
    pub const HIGHEST: Self = Self(-100);
    pub const HIGH: Self = Self(-50);
    pub const MEDIUM: Self = Self(0);
    pub const LOW: Self = Self(50);
    pub const LOWEST: Self = Self(100);
}

/// A cross-cutting step wrapped around a pipeline's terminal.
///
/// Interceptors are long-lived and called concurrently by every in-flight
/// chain; per-call state belongs in the [`Invocation`] or its scope.
pub trait Interceptor<P: Pipeline>: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn priority(&self) -> InterceptionPriority {
        InterceptionPriority::MEDIUM
    }

    fn intercept<'a>(&'a self, invocation: &'a mut Invocation<'_, P>) -> BoxFuture<'a, Result<()>>;
}

impl<P: Pipeline, T: Interceptor<P> + ?Sized> Interceptor<P> for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn priority(&self) -> InterceptionPriority {
        (**self).priority()
    }

    fn intercept<'a>(&'a self, invocation: &'a mut Invocation<'_, P>) -> BoxFuture<'a, Result<()>> {
        (**self).intercept(invocation)
    }
}

/// The innermost step of a pipeline, producing its output.
pub trait Terminal<P: Pipeline>: Send + Sync {
    fn run<'a>(
        &'a self,
        input: &'a P::Input,
        scope: &'a DispatchScope,
    ) -> BoxFuture<'a, Result<P::Output>>;
}

pub enum ChainNode<P: Pipeline> {
    Intercept {
        interceptor: Arc<dyn Interceptor<P>>,
        next: Box<ChainNode<P>>,
    },
    Terminal(Arc<dyn Terminal<P>>),
}

impl<P: Pipeline> ChainNode<P> {
    /// Link `interceptors` in ascending priority order around `terminal`.
    /// Interceptors with equal priority keep their registration order.
    pub fn link(interceptors: &[Arc<dyn Interceptor<P>>], terminal: Arc<dyn Terminal<P>>) -> Self {
        let mut ordered = interceptors.to_vec();
        ordered.sort_by_key(|interceptor| interceptor.priority());

        ordered
            .into_iter()
            .rev()
            .fold(ChainNode::Terminal(terminal), |next, interceptor| {
                ChainNode::Intercept {
                    interceptor,
                    next: Box::new(next),
                }
            })
    }

    /// Interceptor names from the outermost inwards.
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut node = self;
        while let ChainNode::Intercept { interceptor, next } = node {
            names.push(interceptor.name().to_string());
            node = &**next;
        }
        names
    }
}

/// Mutable carrier for one traversal of a chain.
pub struct Invocation<'s, P: Pipeline> {
    input: P::Input,
    output: Option<P::Output>,
    scope: &'s DispatchScope,
    next: &'s ChainNode<P>,
}

impl<'s, P: Pipeline> Invocation<'s, P> {
    pub fn new(input: P::Input, scope: &'s DispatchScope, first: &'s ChainNode<P>) -> Self {
        Self {
            input,
            output: None,
            scope,
            next: first,
        }
    }

    pub fn input(&self) -> &P::Input {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut P::Input {
        &mut self.input
    }

    pub fn output(&self) -> Option<&P::Output> {
        self.output.as_ref()
    }

    pub fn output_mut(&mut self) -> Option<&mut P::Output> {
        self.output.as_mut()
    }

    /// Produce the output without running the rest of the chain.
    pub fn set_output(&mut self, output: P::Output) {
        self.output = Some(output);
    }

    pub fn take_output(&mut self) -> Option<P::Output> {
        self.output.take()
    }

    pub fn scope(&self) -> &'s DispatchScope {
        self.scope
    }

    /// Run the rest of the chain.
    ///
    /// Errors raised further in propagate unchanged.
    pub async fn proceed(&mut self) -> Result<()> {
        let node = self.next;
        match node {
            ChainNode::Intercept { interceptor, next } => {
                tracing::trace!(pipeline = P::NAME, interceptor = interceptor.name(), "intercept");
                self.next = &**next;
                let result = interceptor.intercept(self).await;
                self.next = node;
                result
            }
            ChainNode::Terminal(terminal) => {
                let output = terminal.run(&self.input, self.scope).await?;
                self.output = Some(output);
                Ok(())
            }
        }
    }

    fn finish(self) -> Result<P::Output> {
        self.output
            .ok_or(DispatchError::NoOutput { pipeline: P::NAME })
    }
}

/// A linked chain, immutable once built and shared by every call.
pub struct InterceptorChain<P: Pipeline> {
    root: ChainNode<P>,
}

impl<P: Pipeline> InterceptorChain<P> {
    pub fn build(interceptors: &[Arc<dyn Interceptor<P>>], terminal: Arc<dyn Terminal<P>>) -> Self {
        let root = ChainNode::link(interceptors, terminal);
        tracing::debug!(pipeline = P::NAME, interceptors = ?root.names(), "chain built");
        Self { root }
    }

    /// Traverse the chain once with `input`, inside a fresh [`DispatchScope`].
    pub async fn run(&self, input: P::Input) -> Result<P::Output> {
        let scope = DispatchScope::new();
        let mut invocation = Invocation::new(input, &scope, &self.root);
        invocation.proceed().await?;
        invocation.finish()
    }

    pub fn interceptor_names(&self) -> Vec<String> {
        self.root.names()
    }
}
