//! Saga policies: may this message create an instance, or must one exist?
//!
//! A policy is consulted by the repository at the two decision points of a
//! turn:
//!
//! - **before resolution** - `pre_insert_instance` materializes a candidate
//!   instance if this message is allowed to create one, so the repository
//!   can speculatively insert it and let the storage uniqueness constraint
//!   arbitrate concurrent creators
//! - **after resolution** - `existing` runs against a located instance;
//!   `missing` runs when nothing was found, against a deferred-insert pipe
//!   that only persists if downstream processing did not mark the saga
//!   completed
//!
//! The default `missing` behavior is a silent no-op: several sagas can
//! subscribe to one message type and only some of them will have a matching
//! instance. A policy may instead be configured to fault.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::context::{ConsumeContext, SagaConsumeContext};
use crate::error::SagaError;
use crate::pipe::Pipe;
use crate::saga::Saga;

/// Builds a new instance from the message that creates it.
pub type SagaFactory<T, M> = Arc<dyn Fn(&ConsumeContext<M>) -> T + Send + Sync>;

/// Per-(saga, message) dispatch policy.
#[async_trait]
pub trait SagaPolicy<T: Saga, M: Any + Send + Sync>: Send + Sync {
    /// A candidate instance if this message may create a new saga, `None`
    /// if an existing instance is required.
    fn pre_insert_instance(&self, context: &ConsumeContext<M>) -> Option<T>;

    /// Dispatch to a located instance.
    async fn existing(
        &self,
        context: &mut SagaConsumeContext<T, M>,
        next: &dyn Pipe<SagaConsumeContext<T, M>>,
    ) -> Result<(), SagaError>;

    /// Handle a delivery for which no instance was found.
    ///
    /// `missing_pipe` defers the insert: an instance sent through it is
    /// persisted only after downstream processing succeeds without marking
    /// completion.
    async fn missing(
        &self,
        context: ConsumeContext<M>,
        missing_pipe: &dyn Pipe<SagaConsumeContext<T, M>>,
    ) -> Result<(), SagaError>;
}

/// Policy for instance-creating events: use the existing instance if one
/// matches, otherwise create one.
pub struct NewOrExistingSagaPolicy<T, M> {
    factory: SagaFactory<T, M>,
}

impl<T, M> NewOrExistingSagaPolicy<T, M> {
    /// Create the policy with an instance factory.
    pub fn new(factory: SagaFactory<T, M>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<T, M> SagaPolicy<T, M> for NewOrExistingSagaPolicy<T, M>
where
    T: Saga,
    M: Any + Send + Sync,
{
    fn pre_insert_instance(&self, context: &ConsumeContext<M>) -> Option<T> {
        Some((self.factory)(context))
    }

    async fn existing(
        &self,
        context: &mut SagaConsumeContext<T, M>,
        next: &dyn Pipe<SagaConsumeContext<T, M>>,
    ) -> Result<(), SagaError> {
        next.send(context).await
    }

    async fn missing(
        &self,
        context: ConsumeContext<M>,
        missing_pipe: &dyn Pipe<SagaConsumeContext<T, M>>,
    ) -> Result<(), SagaError> {
        let instance = (self.factory)(&context);
        let mut saga_context = SagaConsumeContext::new(context, instance);
        missing_pipe.send(&mut saga_context).await
    }
}

/// Policy for events that require an existing instance.
///
/// By default a missing instance is ignored silently; call
/// [`AnyExistingSagaPolicy::fault_when_missing`] to surface
/// [`SagaError::InstanceMissing`] instead.
pub struct AnyExistingSagaPolicy {
    fault_when_missing: bool,
}

impl AnyExistingSagaPolicy {
    /// Create the policy with silent-miss behavior.
    pub fn new() -> Self {
        Self {
            fault_when_missing: false,
        }
    }

    /// Fault instead of ignoring when no instance matches.
    pub fn fault_when_missing(mut self) -> Self {
        self.fault_when_missing = true;
        self
    }
}

impl Default for AnyExistingSagaPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T, M> SagaPolicy<T, M> for AnyExistingSagaPolicy
where
    T: Saga,
    M: Any + Send + Sync,
{
    fn pre_insert_instance(&self, _context: &ConsumeContext<M>) -> Option<T> {
        None
    }

    async fn existing(
        &self,
        context: &mut SagaConsumeContext<T, M>,
        next: &dyn Pipe<SagaConsumeContext<T, M>>,
    ) -> Result<(), SagaError> {
        next.send(context).await
    }

    async fn missing(
        &self,
        _context: ConsumeContext<M>,
        _missing_pipe: &dyn Pipe<SagaConsumeContext<T, M>>,
    ) -> Result<(), SagaError> {
        if self.fault_when_missing {
            return Err(SagaError::InstanceMissing {
                saga_type: std::any::type_name::<T>(),
                message_type: std::any::type_name::<M>(),
            });
        }
        debug!(
            saga = std::any::type_name::<T>(),
            message = std::any::type_name::<M>(),
            "no matching instance, ignoring"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::pipe;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Debug, Clone)]
    struct CartState {
        correlation_id: Uuid,
    }

    impl Saga for CartState {
        fn correlation_id(&self) -> Uuid {
            self.correlation_id
        }
    }

    #[derive(Debug, Clone)]
    struct CartItemAdded;

    fn context() -> ConsumeContext<CartItemAdded> {
        ConsumeContext::new(CartItemAdded, MessageBus::new())
    }

    fn factory(id: Uuid) -> SagaFactory<CartState, CartItemAdded> {
        Arc::new(move |_| CartState { correlation_id: id })
    }

    #[test]
    fn test_new_or_existing_pre_inserts() {
        let id = Uuid::new_v4();
        let policy = NewOrExistingSagaPolicy::new(factory(id));

        let instance = policy.pre_insert_instance(&context());
        assert_eq!(instance.map(|i| i.correlation_id()), Some(id));
    }

    #[test]
    fn test_any_existing_never_pre_inserts() {
        let policy = AnyExistingSagaPolicy::new();
        let instance: Option<CartState> =
            SagaPolicy::<CartState, CartItemAdded>::pre_insert_instance(&policy, &context());
        assert!(instance.is_none());
    }

    #[tokio::test]
    async fn test_new_or_existing_missing_creates_and_forwards() {
        let id = Uuid::new_v4();
        let policy = NewOrExistingSagaPolicy::new(factory(id));
        let forwarded = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&forwarded);
        let next = pipe::from_fn(
            move |ctx: &mut SagaConsumeContext<CartState, CartItemAdded>| {
                let seen = Arc::clone(&seen);
                let instance_id = ctx.instance().correlation_id();
                async move {
                    assert_eq!(instance_id, id);
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            },
        );

        policy.missing(context(), &next).await.unwrap();
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_any_existing_missing_is_silent() {
        let policy = AnyExistingSagaPolicy::new();
        let next = pipe::from_fn(|_: &mut SagaConsumeContext<CartState, CartItemAdded>| {
            async move { panic!("missing pipe must not run") }.boxed()
        });

        let result = policy.missing(context(), &next).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_any_existing_missing_can_fault() {
        let policy = AnyExistingSagaPolicy::new().fault_when_missing();
        let next = pipe::from_fn(|_: &mut SagaConsumeContext<CartState, CartItemAdded>| {
            async move { panic!("missing pipe must not run") }.boxed()
        });

        let result = policy.missing(context(), &next).await;
        assert!(matches!(result, Err(SagaError::InstanceMissing { .. })));
    }

    #[tokio::test]
    async fn test_existing_forwards_to_next() {
        let id = Uuid::new_v4();
        let policy = NewOrExistingSagaPolicy::new(factory(id));
        let forwarded = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&forwarded);
        let next = pipe::from_fn(
            move |_: &mut SagaConsumeContext<CartState, CartItemAdded>| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            },
        );

        let mut saga_context =
            SagaConsumeContext::new(context(), CartState { correlation_id: id });
        policy.existing(&mut saga_context, &next).await.unwrap();
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    }
}
