//! Deferred timeouts for state-machine sagas.
//!
//! A [`Schedule`] is a declared, named timeout: a transition's Schedule
//! activity computes a delay, asks the scheduler collaborator to deliver
//! the timeout message at now+delay, and stores the returned token in an
//! `Option<Uuid>` field on the instance.
//!
//! Token rules:
//!
//! - **Unschedule** cancels via the token and clears it
//! - **Re-scheduling** before a prior delivery fires cancels it and
//!   overwrites the token
//! - a stale delivery that still physically arrives carries a token that
//!   no longer matches the instance and is ignored
//! - receiving a live delivery clears the token, so a duplicate physical
//!   delivery of the same message is also ignored

use std::marker::PhantomData;
use std::time::Duration;

use crate::machine::Event;

/// Configuration for a declared schedule.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleSettings {
    /// Delay used when the Schedule activity does not compute its own.
    pub delay: Duration,
}

impl ScheduleSettings {
    /// Settings with a fixed default delay.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

/// Handle to a declared timeout.
///
/// Obtained from the state-machine builder; exposes the auto-declared
/// Received event so transitions can be attached to the delivery.
pub struct Schedule<T, M> {
    pub(crate) index: usize,
    pub(crate) name: &'static str,
    pub(crate) received: Event<M>,
    pub(crate) _marker: PhantomData<fn(T)>,
}

impl<T, M> Schedule<T, M> {
    /// The schedule's declared name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Event raised when the scheduled message is delivered with a live
    /// token.
    pub fn received(&self) -> Event<M> {
        self.received
    }
}

impl<T, M> Clone for Schedule<T, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, M> Copy for Schedule<T, M> {}
