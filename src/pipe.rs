//! Middleware pipe seam.
//!
//! The repository does not know what processes a resolved instance; it
//! forwards the saga consume context to the next [`Pipe`]. The state-machine
//! runtime is one such pipe, a plain consumer is another, and tests inject
//! closures via [`from_fn`].
//!
//! `probe` is the diagnostic counterpart of `send`: pipes describe
//! themselves into a [`ProbeContext`] scope tree so a running bus can be
//! introspected.

use std::marker::PhantomData;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::SagaError;

/// One stage of message processing.
#[async_trait]
pub trait Pipe<C: Send>: Send + Sync {
    /// Process the context, forwarding to downstream stages as needed.
    async fn send(&self, context: &mut C) -> Result<(), SagaError>;

    /// Describe this pipe into the diagnostic scope tree.
    fn probe(&self, _probe: &mut ProbeContext) {}
}

/// Nested key/value scopes describing a pipeline.
#[derive(Debug, Default)]
pub struct ProbeContext {
    name: String,
    entries: Vec<(String, String)>,
    children: Vec<ProbeContext>,
}

impl ProbeContext {
    /// Create a root scope.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
            children: Vec::new(),
        }
    }

    /// The scope's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a key/value entry in this scope.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Look up an entry in this scope.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Open a nested scope and return it for population.
    pub fn create_scope(&mut self, name: impl Into<String>) -> &mut ProbeContext {
        self.children.push(ProbeContext::new(name));
        self.children.last_mut().expect("scope just pushed")
    }

    /// Nested scopes, in creation order.
    pub fn scopes(&self) -> &[ProbeContext] {
        &self.children
    }
}

/// A pipe built from a closure.
///
/// The closure returns a boxed future borrowing the context, so stages can
/// await while holding `&mut C`:
///
/// ```ignore
/// use futures::FutureExt;
///
/// let next = pipe::from_fn(|ctx: &mut SagaConsumeContext<CartState, CartItemAdded>| {
///     async move {
///         ctx.instance_mut().member_number = ctx.message().member_number.clone();
///         Ok(())
///     }
///     .boxed()
/// });
/// ```
pub struct FnPipe<C, F> {
    f: F,
    _marker: PhantomData<fn(C)>,
}

/// Wrap a closure as a [`Pipe`].
pub fn from_fn<C, F>(f: F) -> FnPipe<C, F>
where
    C: Send,
    F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, Result<(), SagaError>> + Send + Sync,
{
    FnPipe {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<C, F> Pipe<C> for FnPipe<C, F>
where
    C: Send,
    F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, Result<(), SagaError>> + Send + Sync,
{
    async fn send(&self, context: &mut C) -> Result<(), SagaError> {
        (self.f)(context).await
    }

    fn probe(&self, probe: &mut ProbeContext) {
        probe.set("pipe", "fn");
    }
}
