//! The saga receive endpoint: per-message-type dispatch into the turn
//! protocol.
//!
//! [`StateMachineSaga`] binds one state machine, one repository, and one
//! scheduler to an input address:
//!
//! ```text
//! envelope ─► connector (by message TypeId)
//!                 │
//!                 ▼
//!          correlation expression ─► repository send / send_query
//!                                          │
//!                                          ▼ (per-key critical section)
//!                                   machine.run_transition
//! ```
//!
//! The policy is chosen per event: events with a transition out of
//! `Initial` may create instances (new-or-existing, with speculative
//! pre-insert); everything else requires an existing instance and misses
//! silently.
//!
//! The `run` loop is the in-process stand-in for a broker receive
//! endpoint: it filters envelopes addressed elsewhere, dispatches the
//! rest, and logs failed turns the way a transport would route them to
//! redelivery.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bus::{Address, MessageBus, MessageEnvelope};
use crate::context::{ConsumeContext, SagaConsumeContext};
use crate::correlation::EventCorrelation;
use crate::error::SagaError;
use crate::machine::{Event, SagaServices, StateMachine, INITIAL_STATE};
use crate::pipe::{Pipe, ProbeContext};
use crate::policy::{AnyExistingSagaPolicy, NewOrExistingSagaPolicy, SagaPolicy};
use crate::repository::SagaRepository;
use crate::saga::SagaStateMachineInstance;
use crate::scheduler::MessageScheduler;

/// A state machine bound to a repository, a scheduler, and an input
/// address.
///
/// Cheap to clone; clones share the machine, the repository, and the
/// shutdown signal.
pub struct StateMachineSaga<T: SagaStateMachineInstance> {
    machine: Arc<StateMachine<T>>,
    repository: Arc<SagaRepository<T>>,
    bus: MessageBus,
    services: SagaServices,
    dispatch: Arc<HashMap<TypeId, usize>>,
    shutdown: CancellationToken,
}

impl<T: SagaStateMachineInstance> Clone for StateMachineSaga<T> {
    fn clone(&self) -> Self {
        Self {
            machine: Arc::clone(&self.machine),
            repository: Arc::clone(&self.repository),
            bus: self.bus.clone(),
            services: self.services.clone(),
            dispatch: Arc::clone(&self.dispatch),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T: SagaStateMachineInstance> StateMachineSaga<T> {
    /// Bind a machine to its collaborators.
    pub fn new(
        machine: StateMachine<T>,
        repository: Arc<SagaRepository<T>>,
        scheduler: Arc<dyn MessageScheduler>,
        bus: MessageBus,
        input_address: Address,
    ) -> Self {
        let machine = Arc::new(machine);
        let dispatch: Arc<HashMap<TypeId, usize>> = Arc::new(
            machine
                .connectors()
                .iter()
                .enumerate()
                .map(|(index, connector)| (connector.message_type(), index))
                .collect(),
        );
        Self {
            machine,
            repository,
            bus,
            services: SagaServices {
                scheduler,
                input_address,
            },
            dispatch,
            shutdown: CancellationToken::new(),
        }
    }

    /// The bound machine.
    pub fn machine(&self) -> &Arc<StateMachine<T>> {
        &self.machine
    }

    /// The bound repository.
    pub fn repository(&self) -> &Arc<SagaRepository<T>> {
        &self.repository
    }

    /// The endpoint's input address.
    pub fn input_address(&self) -> &Address {
        &self.services.input_address
    }

    /// Describe the endpoint into the diagnostic scope tree.
    pub fn probe(&self, probe: &mut ProbeContext) {
        let scope = probe.create_scope("stateMachineSaga");
        scope.set("saga", std::any::type_name::<T>());
        scope.set("inputAddress", self.services.input_address.as_str());
        self.repository.probe(scope);
    }

    /// Run one turn for a typed delivery.
    ///
    /// Applies the event's correlation expression, picks the policy, and
    /// hands the context to the repository with the transition runner as
    /// the next pipe.
    pub async fn handle<M: Any + Send + Sync>(
        &self,
        event: Event<M>,
        mut context: ConsumeContext<M>,
    ) -> Result<(), SagaError> {
        let correlation = self.machine.correlation_for(event);
        let policy = self.policy_for(event, correlation);
        let next = TransitionPipe {
            machine: self.machine.as_ref(),
            services: &self.services,
            event,
        };

        if correlation.is_by_id() {
            let correlation_id = correlation
                .resolve_id(context.message())
                .or_else(|| context.correlation_id())
                .ok_or_else(SagaError::missing_correlation_id::<T, M>)?;
            context.set_correlation_id(correlation_id);
            self.repository.send(context, policy.as_ref(), &next).await
        } else {
            match correlation.to_query(&context) {
                Some(query) => {
                    self.repository
                        .send_query(context, query, policy.as_ref(), &next)
                        .await
                }
                None => {
                    // Token-correlated delivery without a token header can
                    // never match an instance.
                    debug!(
                        saga = std::any::type_name::<T>(),
                        event = event.name(),
                        "delivery carries no request token, dropping"
                    );
                    Ok(())
                }
            }
        }
    }

    /// Dispatch a raw envelope if it is addressed here and its message
    /// type is declared on the machine.
    ///
    /// Returns whether the envelope was handled.
    pub async fn dispatch_envelope(&self, envelope: &MessageEnvelope) -> Result<bool, SagaError> {
        if let Some(destination) = &envelope.destination {
            if *destination != self.services.input_address {
                return Ok(false);
            }
        }
        let Some(&index) = self.dispatch.get(&envelope.type_id) else {
            return Ok(false);
        };
        self.machine.connectors()[index]
            .dispatch(self, envelope)
            .await?;
        Ok(true)
    }

    /// Subscribe to the bus and process deliveries until shutdown.
    ///
    /// Subscription happens before the task is spawned, so envelopes
    /// published immediately after `start` returns are not missed.
    pub fn start(&self) -> JoinHandle<()> {
        let receiver = self.bus.subscribe();
        let endpoint = self.clone();
        tokio::spawn(endpoint.receive_loop(receiver))
    }

    /// Stop the receive loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn receive_loop(self, mut receiver: broadcast::Receiver<MessageEnvelope>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(saga = std::any::type_name::<T>(), "saga endpoint stopping");
                    break;
                }
                received = receiver.recv() => match received {
                    Ok(envelope) => {
                        if let Err(e) = self.dispatch_envelope(&envelope).await {
                            // The transport's redelivery/dead-letter policy
                            // owns what happens next.
                            error!(
                                saga = std::any::type_name::<T>(),
                                error = %e,
                                "saga turn failed"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged = n, "saga endpoint lagged, messages may be missed");
                    }
                }
            }
        }
    }

    fn policy_for<M: Any + Send + Sync>(
        &self,
        event: Event<M>,
        correlation: &EventCorrelation<T, M>,
    ) -> Box<dyn SagaPolicy<T, M>> {
        if self.machine.is_creating(event) {
            let correlation = correlation.clone();
            Box::new(NewOrExistingSagaPolicy::new(Arc::new(
                move |context: &ConsumeContext<M>| {
                    let mut instance = T::create(correlation.new_instance_id(context));
                    instance.set_current_state(INITIAL_STATE);
                    instance
                },
            )))
        } else {
            Box::new(AnyExistingSagaPolicy::new())
        }
    }
}

/// The pipe the repository forwards resolved instances to: the machine's
/// transition runner.
struct TransitionPipe<'a, T: SagaStateMachineInstance, M> {
    machine: &'a StateMachine<T>,
    services: &'a SagaServices,
    event: Event<M>,
}

#[async_trait]
impl<T: SagaStateMachineInstance, M: Any + Send + Sync> Pipe<SagaConsumeContext<T, M>>
    for TransitionPipe<'_, T, M>
{
    async fn send(&self, context: &mut SagaConsumeContext<T, M>) -> Result<(), SagaError> {
        self.machine
            .run_transition(self.event, context, self.services)
            .await
    }

    fn probe(&self, probe: &mut ProbeContext) {
        probe.set("pipe", "stateMachine");
        probe.set("event", self.event.name());
    }
}

/// Type-erased bridge from an envelope to a typed [`StateMachineSaga::handle`]
/// call. One connector is registered per declared event at build time.
pub(crate) trait MessageConnector<T: SagaStateMachineInstance>: Send + Sync {
    /// The message type this connector accepts.
    fn message_type(&self) -> TypeId;

    /// Name of the connected event.
    fn event_name(&self) -> &'static str;

    /// Downcast the envelope and run the turn.
    fn dispatch<'a>(
        &'a self,
        saga: &'a StateMachineSaga<T>,
        envelope: &'a MessageEnvelope,
    ) -> BoxFuture<'a, Result<(), SagaError>>;
}

pub(crate) struct EventConnector<M> {
    event: Event<M>,
}

impl<M> EventConnector<M> {
    pub(crate) fn new(event: Event<M>) -> Self {
        Self { event }
    }
}

impl<T, M> MessageConnector<T> for EventConnector<M>
where
    T: SagaStateMachineInstance,
    M: Any + Send + Sync,
{
    fn message_type(&self) -> TypeId {
        TypeId::of::<M>()
    }

    fn event_name(&self) -> &'static str {
        self.event.name()
    }

    fn dispatch<'a>(
        &'a self,
        saga: &'a StateMachineSaga<T>,
        envelope: &'a MessageEnvelope,
    ) -> BoxFuture<'a, Result<(), SagaError>> {
        async move {
            let Some(context) = ConsumeContext::<M>::from_envelope(
                envelope,
                saga.bus.clone(),
                saga.shutdown.child_token(),
            ) else {
                return Ok(());
            };
            saga.handle(self.event, context).await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::SagaQuery;
    use crate::machine::StateMachineBuilder;
    use crate::saga::{Saga, TokenAccessor};
    use crate::schedule::ScheduleSettings;
    use crate::scheduler::InMemoryScheduler;
    use crate::store::{InMemorySagaStore, SagaStore};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct CartState {
        correlation_id: Uuid,
        current_state: String,
        member_number: String,
        timeout_token: Option<Uuid>,
    }

    impl Saga for CartState {
        fn correlation_id(&self) -> Uuid {
            self.correlation_id
        }
    }

    impl SagaStateMachineInstance for CartState {
        fn create(correlation_id: Uuid) -> Self {
            CartState {
                correlation_id,
                current_state: String::new(),
                member_number: String::new(),
                timeout_token: None,
            }
        }

        fn current_state(&self) -> &str {
            &self.current_state
        }

        fn set_current_state(&mut self, state: &str) {
            self.current_state = state.to_string();
        }
    }

    #[derive(Debug, Clone)]
    struct CartItemAdded {
        member_number: String,
    }

    #[derive(Debug, Clone)]
    struct CartExpired {
        member_number: String,
    }

    #[derive(Debug, Clone)]
    struct UnrelatedMessage;

    struct Harness {
        saga: StateMachineSaga<CartState>,
        store: Arc<InMemorySagaStore<CartState>>,
        bus: MessageBus,
        item_added: Event<CartItemAdded>,
    }

    fn harness() -> Harness {
        let mut builder = StateMachineBuilder::<CartState>::new();
        let active = builder.state("Active");
        let item_added = builder.event(
            "ItemAdded",
            EventCorrelation::by_query(|s: &CartState, m: &CartItemAdded| {
                s.member_number == m.member_number
            }),
        );
        let timeout = builder.schedule(
            "CartTimeout",
            TokenAccessor::new(
                |s: &CartState| s.timeout_token,
                |s, t| s.timeout_token = t,
            ),
            ScheduleSettings::new(Duration::from_secs(30)),
            EventCorrelation::by_query(|s: &CartState, m: &CartExpired| {
                s.member_number == m.member_number
            }),
        );
        builder.initially(item_added, move |t| {
            t.then(|s, m: &CartItemAdded| s.member_number = m.member_number.clone())
                .transition_to(active)
        });
        builder.during(active, timeout.received(), |t| t.finalize());
        builder.set_completed_when_finalized();
        let machine = builder.build().unwrap();

        let bus = MessageBus::new();
        let store = Arc::new(InMemorySagaStore::new());
        let repository = Arc::new(SagaRepository::new(
            store.clone() as Arc<dyn crate::store::SagaStore<CartState>>
        ));
        let scheduler = Arc::new(InMemoryScheduler::new(bus.clone()));
        let saga = StateMachineSaga::new(
            machine,
            repository,
            scheduler,
            bus.clone(),
            Address::new("queue:cart-saga"),
        );

        Harness {
            saga,
            store,
            bus,
            item_added,
        }
    }

    #[tokio::test]
    async fn test_handle_creates_instance_for_initial_event() {
        let h = harness();
        let context = ConsumeContext::new(
            CartItemAdded {
                member_number: "m-1".into(),
            },
            h.bus.clone(),
        );

        h.saga.handle(h.item_added, context).await.unwrap();

        assert_eq!(h.store.len(), 1);
        let query = SagaQuery::new(|s: &CartState| s.member_number == "m-1");
        let ids = h.store.find(&query).await.unwrap();
        assert_eq!(ids.len(), 1);
        let instance = h.store.get(&ids[0]).unwrap();
        assert_eq!(instance.current_state, "Active");
    }

    #[tokio::test]
    async fn test_dispatch_ignores_other_destinations() {
        let h = harness();
        let envelope = MessageEnvelope::new(CartItemAdded {
            member_number: "m-2".into(),
        })
        .with_destination(Address::new("queue:somewhere-else"));

        let handled = h.saga.dispatch_envelope(&envelope).await.unwrap();
        assert!(!handled);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_ignores_undeclared_message_types() {
        let h = harness();
        let envelope = MessageEnvelope::new(UnrelatedMessage);

        let handled = h.saga.dispatch_envelope(&envelope).await.unwrap();
        assert!(!handled);
    }

    #[tokio::test]
    async fn test_receive_loop_processes_published_messages() {
        let h = harness();
        let worker = h.saga.start();

        h.bus.publish(CartItemAdded {
            member_number: "m-3".into(),
        });

        // Let the loop pick the envelope up.
        for _ in 0..20 {
            tokio::task::yield_now().await;
            if h.store.len() == 1 {
                break;
            }
        }
        assert_eq!(h.store.len(), 1);

        h.saga.shutdown();
        let _ = worker.await;
    }

    #[tokio::test]
    async fn test_probe_describes_endpoint_and_repository() {
        let h = harness();
        let mut probe = ProbeContext::new("bus");
        h.saga.probe(&mut probe);

        let scope = &probe.scopes()[0];
        assert_eq!(scope.name(), "stateMachineSaga");
        assert_eq!(scope.get("inputAddress"), Some("queue:cart-saga"));
        assert_eq!(scope.scopes()[0].name(), "sagaRepository");
    }
}
