//! Declarative state machines for sagas.
//!
//! A [`StateMachine`] is a per-saga-type directed graph built once by
//! [`StateMachineBuilder`] and validated at build time:
//!
//! - **States**: `Initial` accepts only instance-creating events; `Final`
//!   is terminal and, with [`StateMachineBuilder::set_completed_when_finalized`],
//!   deletes the instance.
//! - **Events**: a closed set of kinds - plain, schedule-received, and the
//!   three request outcomes. Each declares exactly one correlation
//!   expression.
//! - **Transitions**: at most one per `(State, Event)`; duplicates fail the
//!   build. Unmatched combinations are ignored at runtime, not errors, so
//!   partially handled event sets are legal.
//! - **Activities**: a closed set - mutate, publish, send, respond,
//!   request, schedule, unschedule, transition - run in declaration order.
//!   An error mid-chain short-circuits the rest and routes to the nearest
//!   declared catch clause for the error's type; catch handlers never roll
//!   back mutations already applied.
//!
//! Dispatch is a table lookup computed at build time, not resolved per
//! event: `(current state, event) -> transition plan`.
//!
//! # Example
//!
//! ```ignore
//! let mut builder = StateMachineBuilder::<CartState>::new();
//!
//! let active = builder.state("Active");
//! let item_added = builder.event(
//!     "ItemAdded",
//!     EventCorrelation::by_query_with_id(
//!         |s: &CartState, m: &CartItemAdded| s.member_number == m.member_number,
//!         |_| Uuid::new_v4(),
//!     ),
//! );
//! let cart_timeout = builder.schedule(
//!     "CartTimeout",
//!     TokenAccessor::new(|s| s.timeout_token, |s, t| s.timeout_token = t),
//!     ScheduleSettings::new(Duration::from_secs(30)),
//!     EventCorrelation::by_query(|s, m: &CartExpired| s.member_number == m.member_number),
//! );
//!
//! builder.initially(item_added, |t| {
//!     t.then(|s, m: &CartItemAdded| s.member_number = m.member_number.clone())
//!         .schedule(cart_timeout, |s, _| CartExpired { member_number: s.member_number.clone() })
//!         .transition_to(active)
//! });
//! builder.during(active, cart_timeout.received(), |t| {
//!     t.publish(|s, _| CartRemoved { member_number: s.member_number.clone() })
//!         .finalize()
//! });
//! builder.set_completed_when_finalized();
//!
//! let machine = builder.build()?;
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{Address, MessageEnvelope};
use crate::context::SagaConsumeContext;
use crate::correlation::EventCorrelation;
use crate::endpoint::{EventConnector, MessageConnector};
use crate::error::SagaError;
use crate::request::{Fault, Request, RequestSettings, RequestTimeoutExpired};
use crate::saga::{Saga, SagaStateMachineInstance, TokenAccessor};
use crate::schedule::{Schedule, ScheduleSettings};
use crate::scheduler::MessageScheduler;

/// Name of the implicit initial state.
pub const INITIAL_STATE: &str = "Initial";

/// Name of the implicit final state.
pub const FINAL_STATE: &str = "Final";

// =============================================================================
// Handles
// =============================================================================

/// A node in the state graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct State {
    pub(crate) index: usize,
    pub(crate) name: &'static str,
}

impl State {
    /// The state's declared name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A typed handle to a declared event.
///
/// Carries the message type in its type parameter; handles are only valid
/// on the machine whose builder produced them.
pub struct Event<M> {
    pub(crate) index: usize,
    pub(crate) name: &'static str,
    pub(crate) _marker: PhantomData<fn() -> M>,
}

impl<M> Event<M> {
    /// The event's declared name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<M> Clone for Event<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for Event<M> {}

impl<M> PartialEq for Event<M> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<M> Eq for Event<M> {}

impl<M> std::fmt::Debug for Event<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event({})", self.name)
    }
}

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// An ordinary correlated event.
    Plain,
    /// Delivery of a scheduled timeout message.
    Schedule,
    /// One of the three outcomes of a request exchange.
    Request,
}

/// Introspection record for one declared event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDescriptor {
    /// Declared name. Request outcome events share their request's name.
    pub name: &'static str,
    /// Which kind of event this is.
    pub kind: EventKind,
}

/// How an event is bound to the machine's schedules and requests.
#[derive(Debug, Clone, Copy)]
enum EventBinding {
    Plain,
    ScheduleReceived { schedule: usize },
    Request { request: usize, role: RequestRole },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestRole {
    Completed,
    Faulted,
    TimeoutExpired,
}

// =============================================================================
// Activities
// =============================================================================

type MutateFn<T, M> = Arc<dyn Fn(&mut T, &M) -> anyhow::Result<()> + Send + Sync>;
type BuildMessage<T, M> = Arc<dyn Fn(&T, &M) -> MessageEnvelope + Send + Sync>;
type DelayFn<T, M> = Arc<dyn Fn(&T, &M) -> Duration + Send + Sync>;

/// The closed set of activities a transition may run.
pub(crate) enum Activity<T, M> {
    Mutate(MutateFn<T, M>),
    Publish(BuildMessage<T, M>),
    Send {
        destination: Address,
        build: BuildMessage<T, M>,
    },
    Respond(BuildMessage<T, M>),
    Request {
        request: usize,
        build: BuildMessage<T, M>,
    },
    Schedule {
        schedule: usize,
        build: BuildMessage<T, M>,
        delay: Option<DelayFn<T, M>>,
    },
    Unschedule {
        schedule: usize,
    },
    TransitionTo(State),
}

type FaultMutateFn<T, M> = Arc<dyn Fn(&mut T, &M, &anyhow::Error) + Send + Sync>;
type FaultBuildMessage<T, M> = Arc<dyn Fn(&T, &M, &anyhow::Error) -> MessageEnvelope + Send + Sync>;

/// Activities available to a faulted handler.
///
/// Handlers observe the error and may mutate, publish, respond, or
/// transition; they never undo mutations the failed chain already applied.
pub(crate) enum FaultActivity<T, M> {
    Mutate(FaultMutateFn<T, M>),
    Publish(FaultBuildMessage<T, M>),
    Respond(FaultBuildMessage<T, M>),
    TransitionTo(State),
}

struct CatchClause<T, M> {
    matches: Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>,
    error_type: &'static str,
    activities: Vec<FaultActivity<T, M>>,
}

struct TransitionPlan<T, M> {
    activities: Vec<Activity<T, M>>,
    catches: Vec<CatchClause<T, M>>,
}

// =============================================================================
// Machine internals
// =============================================================================

struct EventEntry {
    name: &'static str,
    binding: EventBinding,
    message_type: TypeId,
    message_type_name: &'static str,
    // EventCorrelation<T, M>, recovered by typed downcast at dispatch.
    correlation: Arc<dyn Any + Send + Sync>,
}

struct ScheduleInfo<T> {
    name: &'static str,
    token: TokenAccessor<T>,
    settings: ScheduleSettings,
}

struct RequestInfo<T> {
    name: &'static str,
    token: TokenAccessor<T>,
    service_address: Address,
    timeout: Duration,
    make_timeout: Arc<dyn Fn(Uuid) -> MessageEnvelope + Send + Sync>,
}

/// Collaborators a running machine needs for one turn.
pub struct SagaServices {
    /// The scheduler backing Schedule and Request timeout activities.
    pub scheduler: Arc<dyn MessageScheduler>,
    /// The saga endpoint's own address; scheduled timeouts and request
    /// responses are delivered here.
    pub input_address: Address,
}

impl Clone for SagaServices {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
            input_address: self.input_address.clone(),
        }
    }
}

// =============================================================================
// Build errors
// =============================================================================

/// Errors detected while building a state machine.
///
/// All graph defects fail fast at build time; nothing is resolved
/// dynamically per event.
#[derive(Debug, Error)]
pub enum StateMachineBuildError {
    /// Two states were declared with the same name.
    #[error("duplicate state name: {name}")]
    DuplicateState {
        /// The colliding name.
        name: &'static str,
    },

    /// More than one transition was declared for one (state, event) pair.
    #[error("duplicate transition for state {state} on event {event}")]
    DuplicateTransition {
        /// The state name.
        state: &'static str,
        /// The event name.
        event: &'static str,
    },

    /// Two events were declared for the same message type; dispatch by
    /// message type would be ambiguous.
    #[error("events {first} and {second} share message type {message_type}")]
    DuplicateMessageType {
        /// First event declared for the type.
        first: &'static str,
        /// Second event declared for the type.
        second: &'static str,
        /// The shared message type.
        message_type: &'static str,
    },

    /// A transition was declared out of the terminal state.
    #[error("state Final is terminal; cannot declare a transition on event {event}")]
    TransitionFromFinal {
        /// The offending event name.
        event: &'static str,
    },
}

// =============================================================================
// Builder
// =============================================================================

struct PendingTransition {
    state_index: usize,
    state_name: &'static str,
    event_index: usize,
    event_name: &'static str,
    plan: Arc<dyn Any + Send + Sync>,
}

/// Collects states, events, schedules, requests, and transitions, then
/// validates the graph into an immutable [`StateMachine`].
pub struct StateMachineBuilder<T: SagaStateMachineInstance> {
    states: Vec<&'static str>,
    events: Vec<EventEntry>,
    schedules: Vec<ScheduleInfo<T>>,
    requests: Vec<RequestInfo<T>>,
    transitions: Vec<PendingTransition>,
    connectors: Vec<Box<dyn MessageConnector<T>>>,
    completed_when_finalized: bool,
}

impl<T: SagaStateMachineInstance> StateMachineBuilder<T> {
    /// Start a machine with the implicit `Initial` and `Final` states.
    pub fn new() -> Self {
        Self {
            states: vec![INITIAL_STATE, FINAL_STATE],
            events: Vec::new(),
            schedules: Vec::new(),
            requests: Vec::new(),
            transitions: Vec::new(),
            connectors: Vec::new(),
            completed_when_finalized: false,
        }
    }

    /// The implicit initial state.
    pub fn initial(&self) -> State {
        State {
            index: 0,
            name: INITIAL_STATE,
        }
    }

    /// The implicit final state.
    pub fn final_state(&self) -> State {
        State {
            index: 1,
            name: FINAL_STATE,
        }
    }

    /// Declare a user state.
    pub fn state(&mut self, name: &'static str) -> State {
        let index = self.states.len();
        self.states.push(name);
        State { index, name }
    }

    /// Declare a plain event with its correlation expression.
    pub fn event<M: Any + Send + Sync>(
        &mut self,
        name: &'static str,
        correlation: EventCorrelation<T, M>,
    ) -> Event<M> {
        self.register_event(name, EventBinding::Plain, correlation)
    }

    /// Declare a schedule: a named, cancellable timeout.
    ///
    /// The returned handle's [`Schedule::received`] event fires when the
    /// scheduled message is delivered with a live token. `received`
    /// declares how the delivery correlates back to the instance.
    pub fn schedule<M: Any + Send + Sync>(
        &mut self,
        name: &'static str,
        token: TokenAccessor<T>,
        settings: ScheduleSettings,
        received: EventCorrelation<T, M>,
    ) -> Schedule<T, M> {
        let index = self.schedules.len();
        let received_event =
            self.register_event(name, EventBinding::ScheduleReceived { schedule: index }, received);
        self.schedules.push(ScheduleInfo {
            name,
            token,
            settings,
        });
        Schedule {
            index,
            name,
            received: received_event,
            _marker: PhantomData,
        }
    }

    /// Declare a request exchange.
    ///
    /// Auto-declares the Completed/Faulted/TimeoutExpired events (all
    /// correlated by the request token against the declared field) and the
    /// pending state, which shares the request's name.
    pub fn request<Req, Resp>(
        &mut self,
        name: &'static str,
        token: TokenAccessor<T>,
        settings: RequestSettings,
    ) -> Request<T, Req, Resp>
    where
        Req: Any + Send + Sync,
        Resp: Any + Send + Sync,
    {
        let index = self.requests.len();

        let completed = self.register_event::<Resp>(
            name,
            EventBinding::Request {
                request: index,
                role: RequestRole::Completed,
            },
            {
                let token = token.clone();
                EventCorrelation::by_request_token(move |instance: &T| token.get(instance))
            },
        );
        let faulted = self.register_event::<Fault<Req>>(
            name,
            EventBinding::Request {
                request: index,
                role: RequestRole::Faulted,
            },
            {
                let token = token.clone();
                EventCorrelation::by_request_token(move |instance: &T| token.get(instance))
            },
        );
        let timeout_expired = self.register_event::<RequestTimeoutExpired<Req>>(
            name,
            EventBinding::Request {
                request: index,
                role: RequestRole::TimeoutExpired,
            },
            {
                let token = token.clone();
                EventCorrelation::by_request_token(move |instance: &T| token.get(instance))
            },
        );
        let pending = self.state(name);

        self.requests.push(RequestInfo {
            name,
            token,
            service_address: settings.service_address,
            timeout: settings.timeout,
            make_timeout: Arc::new(|request_id| {
                MessageEnvelope::new(RequestTimeoutExpired::<Req>::new(request_id))
                    .with_request_id(request_id)
            }),
        });

        Request {
            index,
            name,
            completed,
            faulted,
            timeout_expired,
            pending,
            _marker: PhantomData,
        }
    }

    /// Declare the transition for an instance-creating event.
    ///
    /// Equivalent to `during(initial, event, ..)`; events with a transition
    /// out of `Initial` are the only ones allowed to create instances.
    pub fn initially<M: Any + Send + Sync>(
        &mut self,
        event: Event<M>,
        configure: impl FnOnce(TransitionBuilder<T, M>) -> TransitionBuilder<T, M>,
    ) {
        let initial = self.initial();
        self.during(initial, event, configure);
    }

    /// Declare the transition for `(state, event)`.
    pub fn during<M: Any + Send + Sync>(
        &mut self,
        state: State,
        event: Event<M>,
        configure: impl FnOnce(TransitionBuilder<T, M>) -> TransitionBuilder<T, M>,
    ) {
        let builder = configure(TransitionBuilder::new());
        self.transitions.push(PendingTransition {
            state_index: state.index,
            state_name: state.name,
            event_index: event.index,
            event_name: event.name,
            plan: Arc::new(TransitionPlan {
                activities: builder.activities,
                catches: builder.catches,
            }),
        });
    }

    /// Delete the instance when the machine reaches `Final`.
    pub fn set_completed_when_finalized(&mut self) {
        self.completed_when_finalized = true;
    }

    /// Validate the graph and freeze it.
    pub fn build(self) -> Result<StateMachine<T>, StateMachineBuildError> {
        for (i, name) in self.states.iter().enumerate() {
            if self.states[..i].contains(name) {
                return Err(StateMachineBuildError::DuplicateState { name });
            }
        }

        for (i, entry) in self.events.iter().enumerate() {
            if let Some(previous) = self.events[..i]
                .iter()
                .find(|e| e.message_type == entry.message_type)
            {
                return Err(StateMachineBuildError::DuplicateMessageType {
                    first: previous.name,
                    second: entry.name,
                    message_type: entry.message_type_name,
                });
            }
        }

        let mut transitions = HashMap::new();
        let mut creating_events = Vec::new();
        for pending in self.transitions {
            if pending.state_index == 1 {
                return Err(StateMachineBuildError::TransitionFromFinal {
                    event: pending.event_name,
                });
            }
            let key = (pending.state_index, pending.event_index);
            if transitions.insert(key, pending.plan).is_some() {
                return Err(StateMachineBuildError::DuplicateTransition {
                    state: pending.state_name,
                    event: pending.event_name,
                });
            }
            if pending.state_index == 0 {
                creating_events.push(pending.event_index);
            }
        }

        Ok(StateMachine {
            states: self.states,
            events: self.events,
            schedules: self.schedules,
            requests: self.requests,
            transitions,
            creating_events,
            connectors: self.connectors,
            completed_when_finalized: self.completed_when_finalized,
        })
    }

    fn register_event<M: Any + Send + Sync>(
        &mut self,
        name: &'static str,
        binding: EventBinding,
        correlation: EventCorrelation<T, M>,
    ) -> Event<M> {
        let index = self.events.len();
        self.events.push(EventEntry {
            name,
            binding,
            message_type: TypeId::of::<M>(),
            message_type_name: std::any::type_name::<M>(),
            correlation: Arc::new(correlation),
        });
        let event = Event {
            index,
            name,
            _marker: PhantomData,
        };
        self.connectors.push(Box::new(EventConnector::new(event)));
        event
    }
}

impl<T: SagaStateMachineInstance> Default for StateMachineBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Transition builder
// =============================================================================

/// Collects a transition's ordered activity list.
pub struct TransitionBuilder<T, M> {
    activities: Vec<Activity<T, M>>,
    catches: Vec<CatchClause<T, M>>,
}

impl<T: SagaStateMachineInstance, M: Any + Send + Sync> TransitionBuilder<T, M> {
    fn new() -> Self {
        Self {
            activities: Vec::new(),
            catches: Vec::new(),
        }
    }

    /// Mutate the instance.
    pub fn then(mut self, f: impl Fn(&mut T, &M) + Send + Sync + 'static) -> Self {
        self.activities.push(Activity::Mutate(Arc::new(move |instance, message| {
            f(instance, message);
            Ok(())
        })));
        self
    }

    /// Mutate the instance, fallibly. An error short-circuits the chain
    /// and routes to the transition's catch clauses.
    pub fn try_then(
        mut self,
        f: impl Fn(&mut T, &M) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.activities.push(Activity::Mutate(Arc::new(f)));
        self
    }

    /// Publish a message built from instance and message.
    pub fn publish<P: Any + Send + Sync>(
        mut self,
        f: impl Fn(&T, &M) -> P + Send + Sync + 'static,
    ) -> Self {
        self.activities.push(Activity::Publish(Arc::new(move |i, m| {
            MessageEnvelope::new(f(i, m))
        })));
        self
    }

    /// Send a message to a fixed destination.
    pub fn send<P: Any + Send + Sync>(
        mut self,
        destination: Address,
        f: impl Fn(&T, &M) -> P + Send + Sync + 'static,
    ) -> Self {
        self.activities.push(Activity::Send {
            destination,
            build: Arc::new(move |i, m| MessageEnvelope::new(f(i, m))),
        });
        self
    }

    /// Respond to the inbound message's originator.
    pub fn respond<P: Any + Send + Sync>(
        mut self,
        f: impl Fn(&T, &M) -> P + Send + Sync + 'static,
    ) -> Self {
        self.activities.push(Activity::Respond(Arc::new(move |i, m| {
            MessageEnvelope::new(f(i, m))
        })));
        self
    }

    /// Start a request exchange: send the request, stamp a fresh token,
    /// schedule the timeout fallback.
    pub fn request<Req: Any + Send + Sync, Resp>(
        mut self,
        request: Request<T, Req, Resp>,
        f: impl Fn(&T, &M) -> Req + Send + Sync + 'static,
    ) -> Self {
        self.activities.push(Activity::Request {
            request: request.index,
            build: Arc::new(move |i, m| MessageEnvelope::new(f(i, m))),
        });
        self
    }

    /// Schedule the timeout with its default delay, overwriting any prior
    /// token.
    pub fn schedule<P: Any + Send + Sync>(
        mut self,
        schedule: Schedule<T, P>,
        f: impl Fn(&T, &M) -> P + Send + Sync + 'static,
    ) -> Self {
        self.activities.push(Activity::Schedule {
            schedule: schedule.index,
            build: Arc::new(move |i, m| MessageEnvelope::new(f(i, m))),
            delay: None,
        });
        self
    }

    /// Schedule the timeout with a computed delay.
    pub fn schedule_after<P: Any + Send + Sync>(
        mut self,
        schedule: Schedule<T, P>,
        delay: impl Fn(&T, &M) -> Duration + Send + Sync + 'static,
        f: impl Fn(&T, &M) -> P + Send + Sync + 'static,
    ) -> Self {
        self.activities.push(Activity::Schedule {
            schedule: schedule.index,
            build: Arc::new(move |i, m| MessageEnvelope::new(f(i, m))),
            delay: Some(Arc::new(delay)),
        });
        self
    }

    /// Cancel an outstanding timeout and clear its token.
    pub fn unschedule<P>(mut self, schedule: Schedule<T, P>) -> Self {
        self.activities.push(Activity::Unschedule {
            schedule: schedule.index,
        });
        self
    }

    /// Move the instance to the given state.
    pub fn transition_to(mut self, state: State) -> Self {
        self.activities.push(Activity::TransitionTo(state));
        self
    }

    /// Move the instance to `Final`.
    pub fn finalize(mut self) -> Self {
        self.activities.push(Activity::TransitionTo(State {
            index: 1,
            name: FINAL_STATE,
        }));
        self
    }

    /// Declare a faulted handler for errors downcastable to `E`.
    ///
    /// Clauses are tried in declaration order; the first whose error type
    /// matches wins. An error no clause matches propagates to the caller
    /// and the turn persists nothing.
    pub fn catch<E: std::error::Error + Send + Sync + 'static>(
        mut self,
        configure: impl FnOnce(CatchBuilder<T, M>) -> CatchBuilder<T, M>,
    ) -> Self {
        let builder = configure(CatchBuilder::new());
        self.catches.push(CatchClause {
            matches: Arc::new(|error: &anyhow::Error| error.downcast_ref::<E>().is_some()),
            error_type: std::any::type_name::<E>(),
            activities: builder.activities,
        });
        self
    }
}

/// Collects a faulted handler's activity list.
///
/// Deliberately narrower than [`TransitionBuilder`]: a handler observes
/// the error and may mutate, publish, respond, or transition. It cannot
/// start new requests or schedules.
pub struct CatchBuilder<T, M> {
    activities: Vec<FaultActivity<T, M>>,
}

impl<T: SagaStateMachineInstance, M: Any + Send + Sync> CatchBuilder<T, M> {
    fn new() -> Self {
        Self {
            activities: Vec::new(),
        }
    }

    /// Mutate the instance in response to the error.
    pub fn then(mut self, f: impl Fn(&mut T, &M, &anyhow::Error) + Send + Sync + 'static) -> Self {
        self.activities.push(FaultActivity::Mutate(Arc::new(f)));
        self
    }

    /// Publish a message built from instance, message, and error.
    pub fn publish<P: Any + Send + Sync>(
        mut self,
        f: impl Fn(&T, &M, &anyhow::Error) -> P + Send + Sync + 'static,
    ) -> Self {
        self.activities
            .push(FaultActivity::Publish(Arc::new(move |i, m, e| {
                MessageEnvelope::new(f(i, m, e))
            })));
        self
    }

    /// Respond to the inbound message's originator with a failure message.
    pub fn respond<P: Any + Send + Sync>(
        mut self,
        f: impl Fn(&T, &M, &anyhow::Error) -> P + Send + Sync + 'static,
    ) -> Self {
        self.activities
            .push(FaultActivity::Respond(Arc::new(move |i, m, e| {
                MessageEnvelope::new(f(i, m, e))
            })));
        self
    }

    /// Move the instance to the given state.
    pub fn transition_to(mut self, state: State) -> Self {
        self.activities.push(FaultActivity::TransitionTo(state));
        self
    }

    /// Move the instance to `Final`.
    pub fn finalize(mut self) -> Self {
        self.activities.push(FaultActivity::TransitionTo(State {
            index: 1,
            name: FINAL_STATE,
        }));
        self
    }
}

// =============================================================================
// State machine
// =============================================================================

/// An immutable, validated state graph plus its dispatch table.
pub struct StateMachine<T: SagaStateMachineInstance> {
    states: Vec<&'static str>,
    events: Vec<EventEntry>,
    schedules: Vec<ScheduleInfo<T>>,
    requests: Vec<RequestInfo<T>>,
    transitions: HashMap<(usize, usize), Arc<dyn Any + Send + Sync>>,
    creating_events: Vec<usize>,
    connectors: Vec<Box<dyn MessageConnector<T>>>,
    completed_when_finalized: bool,
}

impl<T: SagaStateMachineInstance> StateMachine<T> {
    /// The implicit initial state.
    pub fn initial(&self) -> State {
        State {
            index: 0,
            name: INITIAL_STATE,
        }
    }

    /// The implicit final state.
    pub fn final_state(&self) -> State {
        State {
            index: 1,
            name: FINAL_STATE,
        }
    }

    /// All declared states, `Initial` and `Final` included.
    pub fn states(&self) -> Vec<State> {
        self.states
            .iter()
            .enumerate()
            .map(|(index, name)| State { index, name })
            .collect()
    }

    /// All declared events with their kinds.
    pub fn events(&self) -> Vec<EventDescriptor> {
        self.events
            .iter()
            .map(|entry| EventDescriptor {
                name: entry.name,
                kind: match entry.binding {
                    EventBinding::Plain => EventKind::Plain,
                    EventBinding::ScheduleReceived { .. } => EventKind::Schedule,
                    EventBinding::Request { .. } => EventKind::Request,
                },
            })
            .collect()
    }

    /// Names of the declared schedules.
    pub fn schedules(&self) -> Vec<&'static str> {
        self.schedules.iter().map(|s| s.name).collect()
    }

    /// Names of the declared requests.
    pub fn requests(&self) -> Vec<&'static str> {
        self.requests.iter().map(|r| r.name).collect()
    }

    /// Look up a state by name.
    pub fn state(&self, name: &str) -> Option<State> {
        self.state_index(name).map(|index| State {
            index,
            name: self.states[index],
        })
    }

    /// Resolve the state an instance is currently in.
    ///
    /// A blank current state reads as `Initial`; an unknown name (a
    /// corrupt or out-of-date snapshot) is `None`.
    pub fn state_of(&self, instance: &T) -> Option<State> {
        let current = instance.current_state();
        if current.is_empty() {
            return Some(self.initial());
        }
        self.state(current)
    }

    /// Does the machine delete the instance on reaching `Final`?
    pub fn completed_when_finalized(&self) -> bool {
        self.completed_when_finalized
    }

    /// May this event create a new instance?
    ///
    /// True exactly when the event has a transition out of `Initial`.
    pub fn is_creating<M>(&self, event: Event<M>) -> bool {
        self.creating_events.contains(&event.index)
    }

    /// The correlation expression declared for an event.
    pub fn correlation_for<M: Any + Send + Sync>(
        &self,
        event: Event<M>,
    ) -> &EventCorrelation<T, M> {
        self.events[event.index]
            .correlation
            .downcast_ref()
            .expect("event handle does not belong to this state machine")
    }

    pub(crate) fn connectors(&self) -> &[Box<dyn MessageConnector<T>>] {
        &self.connectors
    }

    fn state_index(&self, name: &str) -> Option<usize> {
        self.states.iter().position(|s| *s == name)
    }

    /// Run the transition bound to (current state, event), if any.
    ///
    /// This is the runtime entry used by the pipe the repository forwards
    /// to; the per-key critical section is already held.
    pub(crate) async fn run_transition<M: Any + Send + Sync>(
        &self,
        event: Event<M>,
        context: &mut SagaConsumeContext<T, M>,
        services: &SagaServices,
    ) -> Result<(), SagaError> {
        let correlation_id = context.instance().correlation_id();
        let state_index = {
            let current = context.instance().current_state();
            let name = if current.is_empty() { INITIAL_STATE } else { current };
            match self.state_index(name) {
                Some(index) => index,
                None => {
                    let state = name.to_string();
                    return Err(SagaError::activity::<T, M>(
                        correlation_id,
                        &state,
                        anyhow::anyhow!("instance is in undeclared state {state}"),
                    ));
                }
            }
        };
        let state_name = self.states[state_index];

        let Some(plan) = self.transitions.get(&(state_index, event.index)) else {
            debug!(
                saga = std::any::type_name::<T>(),
                %correlation_id,
                state = state_name,
                event = event.name,
                "no transition declared, ignoring"
            );
            return Ok(());
        };
        let plan = plan
            .downcast_ref::<TransitionPlan<T, M>>()
            .expect("event handle does not belong to this state machine");

        if !self.pass_token_gate(event, context) {
            return Ok(());
        }

        let message = context.context().message_arc();
        if let Err(error) = self.run_chain(&plan.activities, context, services, &message).await {
            let Some(clause) = plan.catches.iter().find(|c| (c.matches)(&error)) else {
                return Err(SagaError::activity::<T, M>(correlation_id, state_name, error));
            };
            debug!(
                saga = std::any::type_name::<T>(),
                %correlation_id,
                event = event.name,
                error_type = clause.error_type,
                "routing to faulted handler"
            );
            for activity in &clause.activities {
                self.run_fault_activity(activity, context, &message, &error);
            }
        }

        if self.completed_when_finalized && context.instance().current_state() == FINAL_STATE {
            context.set_completed();
        }
        Ok(())
    }

    /// Compare the delivery's token against the instance's field.
    ///
    /// Schedule and request events only fire while their token is live; a
    /// matching delivery consumes the token so a duplicate is dropped too.
    fn pass_token_gate<M: Any + Send + Sync>(
        &self,
        event: Event<M>,
        context: &mut SagaConsumeContext<T, M>,
    ) -> bool {
        let (accessor, delivered, kind) = match self.events[event.index].binding {
            EventBinding::Plain => return true,
            EventBinding::ScheduleReceived { schedule } => (
                &self.schedules[schedule].token,
                context.context().scheduling_token(),
                "schedule",
            ),
            EventBinding::Request { request, .. } => (
                &self.requests[request].token,
                context.context().request_id(),
                "request",
            ),
        };

        match (accessor.get(context.instance()), delivered) {
            (Some(stored), Some(delivered)) if stored == delivered => {
                accessor.set(context.instance_mut(), None);
                true
            }
            (stored, delivered) => {
                debug!(
                    saga = std::any::type_name::<T>(),
                    event = event.name,
                    kind,
                    ?stored,
                    ?delivered,
                    "token mismatch, dropping delivery"
                );
                false
            }
        }
    }

    async fn run_chain<M: Any + Send + Sync>(
        &self,
        activities: &[Activity<T, M>],
        context: &mut SagaConsumeContext<T, M>,
        services: &SagaServices,
        message: &M,
    ) -> anyhow::Result<()> {
        for activity in activities {
            self.run_activity(activity, context, services, message).await?;
        }
        Ok(())
    }

    async fn run_activity<M: Any + Send + Sync>(
        &self,
        activity: &Activity<T, M>,
        context: &mut SagaConsumeContext<T, M>,
        services: &SagaServices,
        message: &M,
    ) -> anyhow::Result<()> {
        match activity {
            Activity::Mutate(f) => f(context.instance_mut(), message),
            Activity::Publish(build) => {
                let envelope = build(context.instance(), message);
                context.context().publish_envelope(envelope);
                Ok(())
            }
            Activity::Send { destination, build } => {
                let envelope = build(context.instance(), message);
                context.context().send_envelope(destination.clone(), envelope);
                Ok(())
            }
            Activity::Respond(build) => {
                let envelope = build(context.instance(), message);
                context.context().respond_envelope(envelope);
                Ok(())
            }
            Activity::Request { request, build } => {
                let info = &self.requests[*request];
                let token = Uuid::new_v4();
                let envelope = build(context.instance(), message)
                    .with_request_id(token)
                    .with_response_address(services.input_address.clone());
                info.token.set(context.instance_mut(), Some(token));
                context
                    .context()
                    .send_envelope(info.service_address.clone(), envelope);
                if !info.timeout.is_zero() {
                    services
                        .scheduler
                        .schedule_send(
                            services.input_address.clone(),
                            info.timeout,
                            (info.make_timeout)(token),
                        )
                        .await?;
                }
                debug!(request = info.name, %token, "request sent");
                Ok(())
            }
            Activity::Schedule {
                schedule,
                build,
                delay,
            } => {
                let info = &self.schedules[*schedule];
                if let Some(previous) = info.token.get(context.instance()) {
                    services.scheduler.cancel_scheduled_send(previous).await?;
                }
                let delay = delay
                    .as_ref()
                    .map(|f| f(context.instance(), message))
                    .unwrap_or(info.settings.delay);
                let mut envelope = build(context.instance(), message);
                if envelope.correlation_id.is_none() {
                    envelope.correlation_id = Some(context.instance().correlation_id());
                }
                let token = services
                    .scheduler
                    .schedule_send(services.input_address.clone(), delay, envelope)
                    .await?;
                info.token.set(context.instance_mut(), Some(token));
                debug!(schedule = info.name, %token, ?delay, "timeout scheduled");
                Ok(())
            }
            Activity::Unschedule { schedule } => {
                let info = &self.schedules[*schedule];
                if let Some(token) = info.token.get(context.instance()) {
                    services.scheduler.cancel_scheduled_send(token).await?;
                    info.token.set(context.instance_mut(), None);
                    debug!(schedule = info.name, %token, "timeout unscheduled");
                }
                Ok(())
            }
            Activity::TransitionTo(state) => {
                debug!(
                    saga = std::any::type_name::<T>(),
                    to = state.name,
                    "transition"
                );
                context.instance_mut().set_current_state(state.name);
                Ok(())
            }
        }
    }

    fn run_fault_activity<M: Any + Send + Sync>(
        &self,
        activity: &FaultActivity<T, M>,
        context: &mut SagaConsumeContext<T, M>,
        message: &M,
        error: &anyhow::Error,
    ) {
        match activity {
            FaultActivity::Mutate(f) => f(context.instance_mut(), message, error),
            FaultActivity::Publish(build) => {
                let envelope = build(context.instance(), message, error);
                context.context().publish_envelope(envelope);
            }
            FaultActivity::Respond(build) => {
                let envelope = build(context.instance(), message, error);
                context.context().respond_envelope(envelope);
            }
            FaultActivity::TransitionTo(state) => {
                context.instance_mut().set_current_state(state.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::context::ConsumeContext;
    use crate::scheduler::InMemoryScheduler;
    use serde::{Deserialize, Serialize};

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
    struct CartRemoved {
        member_number: String,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("item rejected: {reason}")]
    struct ItemRejected {
        reason: String,
    }

    struct Fixture {
        machine: StateMachine<CartState>,
        item_added: Event<CartItemAdded>,
        timeout: Schedule<CartState, CartExpired>,
        active: State,
    }

    fn cart_machine(fail_item: bool) -> Fixture {
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
            let t = if fail_item {
                t.try_then(|_, _| {
                    Err(anyhow::Error::new(ItemRejected {
                        reason: "no stock".into(),
                    }))
                })
            } else {
                t
            };
            t.then(|s, m: &CartItemAdded| s.member_number = m.member_number.clone())
                .schedule(timeout, |s, _| CartExpired {
                    member_number: s.member_number.clone(),
                })
                .transition_to(active)
                .catch::<ItemRejected>(|c| {
                    c.publish(|_, m: &CartItemAdded, e| CartRemoved {
                        member_number: format!("{}:{}", m.member_number, e),
                    })
                    .finalize()
                })
        });
        builder.during(active, timeout.received(), |t| {
            t.publish(|s, _| CartRemoved {
                member_number: s.member_number.clone(),
            })
            .finalize()
        });
        builder.set_completed_when_finalized();

        Fixture {
            machine: builder.build().unwrap(),
            item_added,
            timeout,
            active,
        }
    }

    fn services(bus: &MessageBus) -> (SagaServices, Arc<InMemoryScheduler>) {
        let scheduler = Arc::new(InMemoryScheduler::new(bus.clone()));
        (
            SagaServices {
                scheduler: scheduler.clone(),
                input_address: Address::new("queue:cart-saga"),
            },
            scheduler,
        )
    }

    fn new_instance() -> CartState {
        let mut instance = CartState::create(Uuid::new_v4());
        instance.set_current_state(INITIAL_STATE);
        instance
    }

    // =========================================================================
    // Introspection and validation
    // =========================================================================

    #[test]
    fn test_introspection() {
        let fixture = cart_machine(false);
        let machine = &fixture.machine;

        let names: Vec<_> = machine.states().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec![INITIAL_STATE, FINAL_STATE, "Active"]);

        let events = machine.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Plain);
        assert_eq!(events[1].kind, EventKind::Schedule);
        assert_eq!(machine.schedules(), vec!["CartTimeout"]);
        assert!(machine.requests().is_empty());

        assert!(machine.is_creating(fixture.item_added));
        assert!(!machine.is_creating(fixture.timeout.received()));
        assert!(machine.completed_when_finalized());
    }

    #[test]
    fn test_state_of_reads_instance() {
        let fixture = cart_machine(false);
        let mut instance = new_instance();

        assert_eq!(fixture.machine.state_of(&instance), Some(fixture.machine.initial()));

        instance.set_current_state("Active");
        assert_eq!(fixture.machine.state_of(&instance), Some(fixture.active));

        instance.set_current_state("Bogus");
        assert_eq!(fixture.machine.state_of(&instance), None);
    }

    #[test]
    fn test_duplicate_transition_fails_build() {
        let mut builder = StateMachineBuilder::<CartState>::new();
        let event = builder.event(
            "ItemAdded",
            EventCorrelation::by_query(|s: &CartState, m: &CartItemAdded| {
                s.member_number == m.member_number
            }),
        );
        builder.initially(event, |t| t.then(|_, _| {}));
        builder.initially(event, |t| t.then(|_, _| {}));

        let result = builder.build();
        assert!(matches!(
            result,
            Err(StateMachineBuildError::DuplicateTransition { .. })
        ));
    }

    #[test]
    fn test_duplicate_message_type_fails_build() {
        let mut builder = StateMachineBuilder::<CartState>::new();
        builder.event(
            "First",
            EventCorrelation::by_query(|s: &CartState, m: &CartItemAdded| {
                s.member_number == m.member_number
            }),
        );
        builder.event(
            "Second",
            EventCorrelation::by_query(|s: &CartState, m: &CartItemAdded| {
                s.member_number == m.member_number
            }),
        );

        let result = builder.build();
        assert!(matches!(
            result,
            Err(StateMachineBuildError::DuplicateMessageType { .. })
        ));
    }

    #[test]
    fn test_duplicate_state_name_fails_build() {
        let mut builder = StateMachineBuilder::<CartState>::new();
        builder.state("Active");
        builder.state("Active");

        let result = builder.build();
        assert!(matches!(
            result,
            Err(StateMachineBuildError::DuplicateState { name: "Active" })
        ));
    }

    #[test]
    fn test_transition_from_final_fails_build() {
        let mut builder = StateMachineBuilder::<CartState>::new();
        let event = builder.event(
            "ItemAdded",
            EventCorrelation::by_query(|s: &CartState, m: &CartItemAdded| {
                s.member_number == m.member_number
            }),
        );
        let final_state = builder.final_state();
        builder.during(final_state, event, |t| t.then(|_, _| {}));

        let result = builder.build();
        assert!(matches!(
            result,
            Err(StateMachineBuildError::TransitionFromFinal { .. })
        ));
    }

    // =========================================================================
    // Runtime
    // =========================================================================

    #[tokio::test]
    async fn test_transition_runs_activities_in_order() {
        let fixture = cart_machine(false);
        let bus = MessageBus::new();
        let (services, scheduler) = services(&bus);

        let ctx = ConsumeContext::new(
            CartItemAdded {
                member_number: "m-1".into(),
            },
            bus.clone(),
        );
        let mut saga_ctx = SagaConsumeContext::new(ctx, new_instance());

        fixture
            .machine
            .run_transition(fixture.item_added, &mut saga_ctx, &services)
            .await
            .unwrap();

        assert_eq!(saga_ctx.instance().current_state(), "Active");
        assert_eq!(saga_ctx.instance().member_number, "m-1");
        assert!(saga_ctx.instance().timeout_token.is_some());
        assert_eq!(scheduler.pending_count(), 1);
        assert!(!saga_ctx.is_completed());
    }

    #[tokio::test]
    async fn test_unmatched_event_is_ignored() {
        let fixture = cart_machine(false);
        let bus = MessageBus::new();
        let (services, scheduler) = services(&bus);

        // Timeout delivery while still in Initial: no transition declared.
        let ctx = ConsumeContext::new(
            CartExpired {
                member_number: "m-1".into(),
            },
            bus.clone(),
        );
        let mut saga_ctx = SagaConsumeContext::new(ctx, new_instance());

        fixture
            .machine
            .run_transition(fixture.timeout.received(), &mut saga_ctx, &services)
            .await
            .unwrap();

        assert_eq!(saga_ctx.instance().current_state(), INITIAL_STATE);
        assert_eq!(scheduler.pending_count(), 0);
        assert!(!saga_ctx.is_completed());
    }

    #[tokio::test]
    async fn test_live_token_fires_and_clears() {
        let fixture = cart_machine(false);
        let bus = MessageBus::new();
        let (services, _) = services(&bus);
        let mut receiver = bus.subscribe();

        let token = Uuid::new_v4();
        let mut instance = new_instance();
        instance.set_current_state("Active");
        instance.member_number = "m-1".into();
        instance.timeout_token = Some(token);

        let envelope = MessageEnvelope::new(CartExpired {
            member_number: "m-1".into(),
        })
        .with_scheduling_token(token);
        let ctx = ConsumeContext::from_envelope(
            &envelope,
            bus.clone(),
            tokio_util::sync::CancellationToken::new(),
        )
        .unwrap();
        let mut saga_ctx = SagaConsumeContext::new(ctx, instance);

        fixture
            .machine
            .run_transition(fixture.timeout.received(), &mut saga_ctx, &services)
            .await
            .unwrap();

        assert_eq!(saga_ctx.instance().current_state(), FINAL_STATE);
        assert_eq!(saga_ctx.instance().timeout_token, None);
        assert!(saga_ctx.is_completed(), "completed-when-finalized");

        let published = receiver.try_recv().unwrap();
        assert!(published.is::<CartRemoved>());
    }

    #[tokio::test]
    async fn test_stale_token_is_dropped() {
        let fixture = cart_machine(false);
        let bus = MessageBus::new();
        let (services, _) = services(&bus);
        let mut receiver = bus.subscribe();

        let live = Uuid::new_v4();
        let mut instance = new_instance();
        instance.set_current_state("Active");
        instance.member_number = "m-1".into();
        instance.timeout_token = Some(live);

        // Delivery from an older, superseded schedule.
        let envelope = MessageEnvelope::new(CartExpired {
            member_number: "m-1".into(),
        })
        .with_scheduling_token(Uuid::new_v4());
        let ctx = ConsumeContext::from_envelope(
            &envelope,
            bus.clone(),
            tokio_util::sync::CancellationToken::new(),
        )
        .unwrap();
        let mut saga_ctx = SagaConsumeContext::new(ctx, instance);

        fixture
            .machine
            .run_transition(fixture.timeout.received(), &mut saga_ctx, &services)
            .await
            .unwrap();

        assert_eq!(saga_ctx.instance().current_state(), "Active");
        assert_eq!(saga_ctx.instance().timeout_token, Some(live));
        assert!(receiver.try_recv().is_err(), "nothing published");
    }

    #[tokio::test]
    async fn test_reschedule_overwrites_token() {
        let fixture = cart_machine(false);
        let bus = MessageBus::new();
        let (services, scheduler) = services(&bus);

        let ctx = ConsumeContext::new(
            CartItemAdded {
                member_number: "m-1".into(),
            },
            bus.clone(),
        );
        let mut saga_ctx = SagaConsumeContext::new(ctx.clone(), new_instance());
        fixture
            .machine
            .run_transition(fixture.item_added, &mut saga_ctx, &services)
            .await
            .unwrap();
        let first = saga_ctx.instance().timeout_token.unwrap();

        // Second ItemAdded while Active re-runs the schedule activity.
        // The cart fixture has no Active+ItemAdded transition, so drive the
        // schedule directly through another initially-built machine state:
        // replay the same transition from Initial.
        saga_ctx.instance_mut().set_current_state(INITIAL_STATE);
        fixture
            .machine
            .run_transition(fixture.item_added, &mut saga_ctx, &services)
            .await
            .unwrap();
        let second = saga_ctx.instance().timeout_token.unwrap();

        assert_ne!(first, second);
        // The first delivery was cancelled when the second was armed.
        assert_eq!(scheduler.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_faulted_handler_catches_and_finalizes() {
        let fixture = cart_machine(true);
        let bus = MessageBus::new();
        let (services, _) = services(&bus);
        let mut receiver = bus.subscribe();

        let ctx = ConsumeContext::new(
            CartItemAdded {
                member_number: "m-1".into(),
            },
            bus.clone(),
        );
        let mut saga_ctx = SagaConsumeContext::new(ctx, new_instance());

        fixture
            .machine
            .run_transition(fixture.item_added, &mut saga_ctx, &services)
            .await
            .unwrap();

        // Handler published and finalized; the failed chain's later
        // activities never ran.
        assert_eq!(saga_ctx.instance().current_state(), FINAL_STATE);
        assert!(saga_ctx.instance().timeout_token.is_none());
        let published = receiver.try_recv().unwrap();
        let removed = published.downcast_ref::<CartRemoved>().unwrap();
        assert!(removed.member_number.contains("no stock"));
    }

    #[tokio::test]
    async fn test_unmatched_error_propagates() {
        #[derive(Debug, thiserror::Error)]
        #[error("unrelated")]
        struct Unrelated;

        let mut builder = StateMachineBuilder::<CartState>::new();
        let event = builder.event(
            "ItemAdded",
            EventCorrelation::by_query(|s: &CartState, m: &CartItemAdded| {
                s.member_number == m.member_number
            }),
        );
        builder.initially(event, |t| {
            t.try_then(|_, _| Err(anyhow::Error::new(Unrelated)))
                .catch::<ItemRejected>(|c| c.finalize())
        });
        let machine = builder.build().unwrap();

        let bus = MessageBus::new();
        let (services, _) = services(&bus);
        let ctx = ConsumeContext::new(
            CartItemAdded {
                member_number: "m-1".into(),
            },
            bus.clone(),
        );
        let mut saga_ctx = SagaConsumeContext::new(ctx, new_instance());

        let result = machine.run_transition(event, &mut saga_ctx, &services).await;
        assert!(matches!(result, Err(SagaError::Activity { .. })));
    }

    #[tokio::test]
    async fn test_request_activity_stamps_token_and_schedules_timeout() {
        #[derive(Debug, Clone)]
        struct ValidateName {
            name: String,
        }
        #[derive(Debug, Clone)]
        struct NameValidated;

        let mut builder = StateMachineBuilder::<CartState>::new();
        let register = builder.event(
            "Register",
            EventCorrelation::by_id(|_: &CartItemAdded| Some(Uuid::new_v4())),
        );
        let validate: Request<CartState, ValidateName, NameValidated> = builder.request(
            "ValidateName",
            TokenAccessor::new(
                |s: &CartState| s.timeout_token,
                |s, t| s.timeout_token = t,
            ),
            RequestSettings::new(Address::new("queue:validator"))
                .with_timeout(Duration::from_secs(10)),
        );
        builder.initially(register, move |t| {
            t.request(validate, |_, m: &CartItemAdded| ValidateName {
                name: m.member_number.clone(),
            })
            .transition_to(validate.pending())
        });
        let machine = builder.build().unwrap();

        let bus = MessageBus::new();
        let (services, scheduler) = services(&bus);
        let mut receiver = bus.subscribe();

        let ctx = ConsumeContext::new(
            CartItemAdded {
                member_number: "Frank".into(),
            },
            bus.clone(),
        );
        let mut saga_ctx = SagaConsumeContext::new(ctx, new_instance());
        machine
            .run_transition(register, &mut saga_ctx, &services)
            .await
            .unwrap();

        let token = saga_ctx.instance().timeout_token.expect("token stamped");
        assert_eq!(saga_ctx.instance().current_state(), "ValidateName");
        assert_eq!(scheduler.pending_count(), 1, "timeout fallback armed");

        let sent = receiver.try_recv().unwrap();
        assert!(sent.is::<ValidateName>());
        assert_eq!(sent.destination, Some(Address::new("queue:validator")));
        assert_eq!(sent.request_id, Some(token));
        assert_eq!(sent.response_address, Some(Address::new("queue:cart-saga")));
    }
}
