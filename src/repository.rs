//! The saga repository: one turn per message, serialized per correlation id.
//!
//! # The Turn
//!
//! A turn is one complete processing cycle of a single message against a
//! single saga instance, bounded by acquisition and release of its per-key
//! critical section:
//!
//! ```text
//! resolve key ─► lock(key) ─► pre-insert? ─► load ─► Existing / Missing
//!                                                         │
//!                      persist / delete / discard ◄───────┘
//! ```
//!
//! The lock spans the *entire asynchronous turn*, including every await in
//! downstream activities, so no concurrent turn for the same key ever
//! observes a stale pre-image. Turns for different keys run fully in
//! parallel.
//!
//! # The Create Protocol
//!
//! If the policy permits creation, a candidate instance is speculatively
//! inserted before resolution, so a concurrent duplicate for the same new
//! key is rejected by the store's uniqueness constraint rather than
//! creating two instances. A turn that loses the pre-insert race falls back
//! to loading the winner's record and proceeds as "existing"; the loss is
//! recovered locally and never surfaced.
//!
//! # End Of Turn
//!
//! - context completed → delete the instance (a later message with the
//!   same key is "missing" again)
//! - context cancelled → discard the in-flight mutation, persist nothing
//! - otherwise → update the stored instance
//!
//! An error from the pipe aborts the turn before any of the above; apart
//! from the pre-insert (which is a committed creation by design), storage
//! is left unmodified and the transport's redelivery policy takes over.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::context::{ConsumeContext, SagaConsumeContext};
use crate::correlation::SagaQuery;
use crate::error::SagaError;
use crate::pipe::{Pipe, ProbeContext};
use crate::policy::SagaPolicy;
use crate::saga::Saga;
use crate::store::{SagaStore, StoreError};

/// Locates or creates exactly one saga instance per correlated message and
/// runs the turn protocol against a pluggable [`SagaStore`].
pub struct SagaRepository<T: Saga> {
    store: Arc<dyn SagaStore<T>>,
    // Per-correlation-id turn serialization. Entries live for the process
    // lifetime; a removed-and-recreated entry could hand two turns
    // different mutexes for the same key.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl<T: Saga> SagaRepository<T> {
    /// Create a repository over a storage driver.
    pub fn new(store: Arc<dyn SagaStore<T>>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn SagaStore<T>> {
        &self.store
    }

    /// Describe this repository into the diagnostic scope tree.
    pub fn probe(&self, probe: &mut ProbeContext) {
        let scope = probe.create_scope("sagaRepository");
        scope.set("saga", std::any::type_name::<T>());
    }

    fn lock_for(&self, correlation_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(correlation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one turn for an id-correlated message.
    ///
    /// The context's correlation id must already be resolved; the endpoint
    /// applies the event's correlation expression before dispatch.
    pub async fn send<M: Any + Send + Sync>(
        &self,
        context: ConsumeContext<M>,
        policy: &dyn SagaPolicy<T, M>,
        next: &dyn Pipe<SagaConsumeContext<T, M>>,
    ) -> Result<(), SagaError> {
        let correlation_id = context
            .correlation_id()
            .ok_or_else(SagaError::missing_correlation_id::<T, M>)?;

        let lock = self.lock_for(correlation_id);
        let _turn = lock.lock().await;

        if let Some(candidate) = policy.pre_insert_instance(&context) {
            match self.store.insert(&candidate).await {
                Ok(()) => {
                    debug!(
                        saga = std::any::type_name::<T>(),
                        %correlation_id,
                        message = std::any::type_name::<M>(),
                        "pre-insert"
                    );
                }
                Err(StoreError::DuplicateKey) => {
                    // Lost the race; the winner's record is loaded below.
                    debug!(
                        saga = std::any::type_name::<T>(),
                        %correlation_id,
                        message = std::any::type_name::<M>(),
                        "pre-insert dupe"
                    );
                }
                Err(e) => return Err(SagaError::repository::<T, M>(correlation_id, e)),
            }
        }

        let instance = self
            .store
            .load(&correlation_id)
            .await
            .map_err(|e| SagaError::repository::<T, M>(correlation_id, e))?;

        match instance {
            Some(instance) => self.send_to_instance(context, policy, instance, next).await,
            None => {
                let missing_pipe = MissingPipe::new(self.store.as_ref(), next);
                policy.missing(context, &missing_pipe).await
            }
        }
    }

    /// Run turns for a query-correlated message.
    ///
    /// Every matching instance gets its own serialized turn. If nothing
    /// matches, the policy's `missing` path runs once against the deferred
    /// insert pipe.
    pub async fn send_query<M: Any + Send + Sync>(
        &self,
        context: ConsumeContext<M>,
        query: SagaQuery<T>,
        policy: &dyn SagaPolicy<T, M>,
        next: &dyn Pipe<SagaConsumeContext<T, M>>,
    ) -> Result<(), SagaError> {
        let matched = self
            .store
            .find(&query)
            .await
            .map_err(|e| SagaError::repository::<T, M>(Uuid::nil(), e))?;

        if matched.is_empty() {
            let missing_pipe = MissingPipe::new(self.store.as_ref(), next);
            return policy.missing(context, &missing_pipe).await;
        }

        for correlation_id in matched {
            let lock = self.lock_for(correlation_id);
            let _turn = lock.lock().await;

            let instance = self
                .store
                .load(&correlation_id)
                .await
                .map_err(|e| SagaError::repository::<T, M>(correlation_id, e))?;

            // Deleted between find and lock; nothing left to dispatch to.
            let Some(instance) = instance else { continue };

            let mut instance_context = context.clone();
            instance_context.set_correlation_id(correlation_id);
            self.send_to_instance(instance_context, policy, instance, next)
                .await?;
        }
        Ok(())
    }

    async fn send_to_instance<M: Any + Send + Sync>(
        &self,
        context: ConsumeContext<M>,
        policy: &dyn SagaPolicy<T, M>,
        instance: T,
        next: &dyn Pipe<SagaConsumeContext<T, M>>,
    ) -> Result<(), SagaError> {
        let correlation_id = instance.correlation_id();
        debug!(
            saga = std::any::type_name::<T>(),
            %correlation_id,
            message = std::any::type_name::<M>(),
            "used existing"
        );

        let cancellation = context.cancellation().clone();
        let mut saga_context = SagaConsumeContext::new(context, instance);

        policy.existing(&mut saga_context, next).await?;

        let (instance, completed) = saga_context.into_parts();

        if cancellation.is_cancelled() {
            debug!(
                saga = std::any::type_name::<T>(),
                %correlation_id,
                "turn cancelled, discarding"
            );
            return Ok(());
        }

        if completed {
            self.store
                .delete(&correlation_id)
                .await
                .map_err(|e| SagaError::repository::<T, M>(correlation_id, e))?;
            debug!(
                saga = std::any::type_name::<T>(),
                %correlation_id,
                "removed completed"
            );
        } else {
            self.store
                .update(&instance)
                .await
                .map_err(|e| SagaError::repository::<T, M>(correlation_id, e))?;
        }
        Ok(())
    }
}

/// Deferred-insert continuation for the missing-instance path.
///
/// A new instance sent through this pipe is processed first and persisted
/// after, and only if the turn did not mark it completed. A saga that is
/// created and finalized by the same message never touches storage.
pub struct MissingPipe<'a, T: Saga, M> {
    store: &'a dyn SagaStore<T>,
    next: &'a dyn Pipe<SagaConsumeContext<T, M>>,
}

impl<'a, T: Saga, M> MissingPipe<'a, T, M> {
    pub(crate) fn new(
        store: &'a dyn SagaStore<T>,
        next: &'a dyn Pipe<SagaConsumeContext<T, M>>,
    ) -> Self {
        Self { store, next }
    }
}

#[async_trait::async_trait]
impl<T: Saga, M: Any + Send + Sync> Pipe<SagaConsumeContext<T, M>> for MissingPipe<'_, T, M> {
    async fn send(&self, context: &mut SagaConsumeContext<T, M>) -> Result<(), SagaError> {
        self.next.send(context).await?;

        if context.context().cancellation().is_cancelled() {
            debug!(
                saga = std::any::type_name::<T>(),
                "turn cancelled, discarding new instance"
            );
            return Ok(());
        }

        if !context.is_completed() {
            let correlation_id = context.instance().correlation_id();
            self.store
                .insert(context.instance())
                .await
                .map_err(|e| SagaError::repository::<T, M>(correlation_id, e))?;
            debug!(
                saga = std::any::type_name::<T>(),
                %correlation_id,
                message = std::any::type_name::<M>(),
                "added"
            );
        }
        Ok(())
    }

    fn probe(&self, probe: &mut ProbeContext) {
        probe.set("pipe", "missingSaga");
        self.next.probe(probe);
    }
}
