//! # Sagabus
//!
//! A correlated saga layer for at-least-once message buses: policies
//! resolve instances, repositories guard the turn, and state machines
//! decide.
//!
//! ## Core Concepts
//!
//! A **saga** is a long-lived, message-correlated business-process
//! instance. Every inbound message resolves to exactly one instance - or
//! creates one, or is deliberately ignored - and is processed in a
//! **turn**: one message against one instance, inside that instance's
//! per-key critical section.
//!
//! ## Architecture
//!
//! ```text
//! MessageBus / transport
//!     │
//!     ▼ envelope
//! StateMachineSaga (endpoint)
//!     │  correlation expression per event
//!     ▼
//! SagaRepository ── SagaPolicy ── SagaStore
//!     │  per-key critical section,
//!     │  speculative pre-insert, deferred insert
//!     ▼
//! StateMachine.run_transition
//!     │  (state, event) dispatch table
//!     ├─► mutate / publish / send / respond
//!     ├─► Request  ──► service + timeout fallback ─┐
//!     ├─► Schedule ──► MessageScheduler ───────────┤
//!     └─► transition / finalize                    │
//!                                                  ▼
//!                          tokens stamped on the instance,
//!                          stale deliveries dropped on mismatch
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One instance per key** - concurrent creators are arbitrated by the
//!    store's insert-uniqueness; the loser proceeds against the winner's
//!    record
//! 2. **Turns serialize per key** - the critical section spans the whole
//!    asynchronous turn; different keys run fully in parallel
//! 3. **Unmatched events are ignored** - a missing transition or a missing
//!    instance under a silent policy is a no-op, not an error
//! 4. **Tokens arbitrate races** - response vs. timeout, stale vs. live
//!    schedule: whichever turn clears the token first wins, the loser is
//!    dropped
//! 5. **No partial persistence** - an error or cancellation mid-turn
//!    leaves the stored instance untouched
//!
//! ## Example
//!
//! ```ignore
//! use sagabus::{
//!     Address, EventCorrelation, MessageBus, InMemoryScheduler, InMemorySagaStore,
//!     SagaRepository, ScheduleSettings, StateMachineBuilder, StateMachineSaga,
//!     TokenAccessor,
//! };
//!
//! let mut builder = StateMachineBuilder::<CartState>::new();
//! let active = builder.state("Active");
//! let item_added = builder.event("ItemAdded", EventCorrelation::by_query_with_id(
//!     |s: &CartState, m: &CartItemAdded| s.member_number == m.member_number,
//!     |_| Uuid::new_v4(),
//! ));
//! let cart_timeout = builder.schedule(
//!     "CartTimeout",
//!     TokenAccessor::new(|s| s.cart_timeout_token, |s, t| s.cart_timeout_token = t),
//!     ScheduleSettings::new(Duration::from_secs(30)),
//!     EventCorrelation::by_query(|s, m: &CartExpired| s.member_number == m.member_number),
//! );
//! builder.initially(item_added, move |t| {
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
//! let bus = MessageBus::new();
//! let saga = StateMachineSaga::new(
//!     builder.build()?,
//!     Arc::new(SagaRepository::new(Arc::new(InMemorySagaStore::new()))),
//!     Arc::new(InMemoryScheduler::new(bus.clone())),
//!     bus.clone(),
//!     Address::new("queue:cart-saga"),
//! );
//! let worker = saga.start();
//!
//! bus.publish(CartItemAdded { member_number: "8675309".into() });
//! ```
//!
//! ## What This Is Not
//!
//! Sagabus is **not**:
//! - a wire transport or broker topology
//! - a routing-slip / compensation engine
//! - an exactly-once delivery layer (idempotency comes from correlation
//!   and tokens, redelivery from the host transport)

#![warn(missing_docs)]

// Correlation and contexts
mod bus;
mod context;
mod correlation;
mod saga;

// Resolution
mod error;
mod pipe;
mod policy;
mod repository;
mod store;

// State machine runtime
mod endpoint;
mod machine;
mod request;
mod schedule;
mod scheduler;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// === Re-exports ===

// Bus and contexts
pub use bus::{Address, MessageBus, MessageEnvelope};
pub use context::{ConsumeContext, SagaConsumeContext};

// Correlation
pub use correlation::{EventCorrelation, SagaQuery};

// Instances
pub use saga::{Saga, SagaStateMachineInstance, TokenAccessor};

// Policies and resolution
pub use error::SagaError;
pub use pipe::{from_fn, FnPipe, Pipe, ProbeContext};
pub use policy::{AnyExistingSagaPolicy, NewOrExistingSagaPolicy, SagaFactory, SagaPolicy};
pub use repository::{MissingPipe, SagaRepository};
pub use store::{DocumentSagaStore, InMemorySagaStore, SagaStore, StoreError};

// State machine
pub use endpoint::StateMachineSaga;
pub use machine::{
    Event, EventDescriptor, EventKind, SagaServices, State, StateMachine, StateMachineBuildError,
    StateMachineBuilder, TransitionBuilder, CatchBuilder, FINAL_STATE, INITIAL_STATE,
};
pub use request::{
    Fault, Request, RequestSettings, RequestTimeoutExpired, DEFAULT_REQUEST_TIMEOUT,
};
pub use schedule::{Schedule, ScheduleSettings};
pub use scheduler::{InMemoryScheduler, MessageScheduler};

// Re-export commonly used external types
pub use async_trait::async_trait;
