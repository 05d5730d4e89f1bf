//! Request/response correlation for state-machine sagas.
//!
//! A [`Request`] is a declared, named exchange: the saga sends a request
//! message to a service address, stamps a fresh token into an
//! `Option<Uuid>` field on the instance, and asks the scheduler for a
//! fallback timeout delivery. Exactly one of three events then clears the
//! token and moves the saga out of the request's pending state:
//!
//! - **Completed** - the response arrived with a matching token
//! - **Faulted** - the service published a [`Fault`] for the request
//! - **TimeoutExpired** - the scheduled fallback fired while the token was
//!   still set
//!
//! Whichever arrives later loses: its token no longer matches the instance
//! and the delivery is dropped. This is honest event-driven behavior, not
//! RPC - nothing guarantees a response exists.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::bus::Address;
use crate::machine::{Event, State};

/// Default timeout for request/response exchanges.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a declared request.
#[derive(Debug, Clone)]
pub struct RequestSettings {
    /// Where request messages are sent.
    pub service_address: Address,
    /// How long to wait for a response before the TimeoutExpired fallback
    /// fires. A zero timeout disables the fallback entirely.
    pub timeout: Duration,
}

impl RequestSettings {
    /// Settings with the default timeout.
    pub fn new(service_address: Address) -> Self {
        Self {
            service_address,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Handle to a declared request exchange.
///
/// Obtained from the state-machine builder; exposes the auto-declared
/// events and pending state so transitions can be attached to them.
pub struct Request<T, Req, Resp> {
    pub(crate) index: usize,
    pub(crate) name: &'static str,
    pub(crate) completed: Event<Resp>,
    pub(crate) faulted: Event<Fault<Req>>,
    pub(crate) timeout_expired: Event<RequestTimeoutExpired<Req>>,
    pub(crate) pending: State,
    pub(crate) _marker: PhantomData<fn(T)>,
}

impl<T, Req, Resp> Request<T, Req, Resp> {
    /// The request's declared name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Event raised when a response with a matching token arrives.
    pub fn completed(&self) -> Event<Resp> {
        self.completed
    }

    /// Event raised when the service faults the request.
    pub fn faulted(&self) -> Event<Fault<Req>> {
        self.faulted
    }

    /// Event raised when the timeout fallback fires first.
    pub fn timeout_expired(&self) -> Event<RequestTimeoutExpired<Req>> {
        self.timeout_expired
    }

    /// The state the saga waits in while the request is outstanding.
    ///
    /// Shares the request's name.
    pub fn pending(&self) -> State {
        self.pending
    }
}

impl<T, Req, Resp> Clone for Request<T, Req, Resp> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, Req, Resp> Copy for Request<T, Req, Resp> {}

/// Fault notification for a message that could not be processed.
///
/// Published by a service endpoint in place of a response when handling
/// the original message failed. Carries the original message so observers
/// can correlate without re-parsing.
pub struct Fault<M> {
    /// The message that faulted.
    pub message: Arc<M>,
    /// Description of the failure.
    pub description: String,
}

impl<M> Fault<M> {
    /// Wrap a failed message.
    pub fn new(message: M, description: impl Into<String>) -> Self {
        Self {
            message: Arc::new(message),
            description: description.into(),
        }
    }
}

impl<M> Clone for Fault<M> {
    fn clone(&self) -> Self {
        Self {
            message: Arc::clone(&self.message),
            description: self.description.clone(),
        }
    }
}

impl<M> std::fmt::Debug for Fault<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fault")
            .field("message_type", &std::any::type_name::<M>())
            .field("description", &self.description)
            .finish()
    }
}

/// Scheduled fallback delivered when a request outlives its timeout.
///
/// The envelope (and this message) carry the request's token; if the
/// instance cleared it in the meantime, the delivery is dropped.
pub struct RequestTimeoutExpired<R> {
    /// Token of the request that timed out.
    pub request_id: Uuid,
    _marker: PhantomData<fn() -> R>,
}

impl<R> RequestTimeoutExpired<R> {
    /// Timeout notification for the given request token.
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            _marker: PhantomData,
        }
    }
}

impl<R> Clone for RequestTimeoutExpired<R> {
    fn clone(&self) -> Self {
        Self {
            request_id: self.request_id,
            _marker: PhantomData,
        }
    }
}

impl<R> std::fmt::Debug for RequestTimeoutExpired<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTimeoutExpired")
            .field("request", &std::any::type_name::<R>())
            .field("request_id", &self.request_id)
            .finish()
    }
}
