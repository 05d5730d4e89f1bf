//! Type-erased in-process message bus.
//!
//! This is the delivery fabric the in-memory scheduler and the test
//! harness ride on. It stands in for the out-of-scope wire transport:
//! the saga layers themselves only ever see [`ConsumeContext`] and pipe
//! interfaces, never the bus directly.
//!
//! # Guarantees
//!
//! - **At-least-once is the caller's problem**: the bus itself is
//!   at-most-once; redelivery comes from the transport this crate is
//!   embedded in
//! - **In-memory only**: envelopes are not persisted
//! - **No replay**: lagged receivers get `RecvError::Lagged`
//!
//! # Headers
//!
//! Every [`MessageEnvelope`] carries transport-level metadata the saga
//! subsystem correlates on: the correlation id, the request token of an
//! outstanding request/response exchange, the token of a scheduled
//! delivery, and the destination/response addresses.
//!
//! [`ConsumeContext`]: crate::context::ConsumeContext

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

/// Default channel capacity for the message bus.
const DEFAULT_CAPACITY: usize = 10000;

/// A queue or endpoint address.
///
/// Cheap to clone and compare; the in-memory transport treats addresses as
/// opaque names (`"queue:order-saga"`, `"queue:validate-service"`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(Arc<str>);

impl Address {
    /// Create an address from a queue name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Address(Arc::from(name.as_ref()))
    }

    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl From<&str> for Address {
    fn from(name: &str) -> Self {
        Address::new(name)
    }
}

/// Envelope wrapping a message with transport-level metadata.
///
/// Domain message types stay clean; correlation is envelope metadata.
#[derive(Clone)]
pub struct MessageEnvelope {
    /// Correlation id relating this message to a saga instance, if known.
    pub correlation_id: Option<Uuid>,
    /// Token of the request/response exchange this message belongs to.
    pub request_id: Option<Uuid>,
    /// Token of the scheduled delivery that produced this message.
    pub scheduling_token: Option<Uuid>,
    /// Where this message was sent; `None` means published to all.
    pub destination: Option<Address>,
    /// Where responses to this message should be sent.
    pub response_address: Option<Address>,
    /// Type id of the payload message.
    pub type_id: TypeId,
    /// The actual message payload.
    pub payload: Arc<dyn Any + Send + Sync>,
}

impl MessageEnvelope {
    /// Wrap a message with no metadata.
    pub fn new<M: Any + Send + Sync>(message: M) -> Self {
        Self {
            correlation_id: None,
            request_id: None,
            scheduling_token: None,
            destination: None,
            response_address: None,
            type_id: TypeId::of::<M>(),
            payload: Arc::new(message),
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Set the request token.
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Set the scheduled-delivery token.
    pub fn with_scheduling_token(mut self, token: Uuid) -> Self {
        self.scheduling_token = Some(token);
        self
    }

    /// Address the envelope to a destination queue.
    pub fn with_destination(mut self, destination: Address) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Set the address responses should be sent to.
    pub fn with_response_address(mut self, address: Address) -> Self {
        self.response_address = Some(address);
        self
    }

    /// Downcast the payload to a concrete message type.
    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        self.payload.downcast_ref()
    }

    /// Check if the payload is of the given message type.
    pub fn is<M: Any>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }
}

impl fmt::Debug for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("correlation_id", &self.correlation_id)
            .field("request_id", &self.request_id)
            .field("scheduling_token", &self.scheduling_token)
            .field("destination", &self.destination)
            .field("type_id", &self.type_id)
            .finish_non_exhaustive()
    }
}

/// Broadcast bus carrying [`MessageEnvelope`]s between endpoints.
///
/// Publish delivers to every subscriber; send addresses one destination
/// (subscribers filter on `destination`). Cloning the bus shares the
/// underlying channel.
#[derive(Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<MessageEnvelope>,
}

impl MessageBus {
    /// Create a new bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new bus with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a message to all subscribers (no destination).
    ///
    /// Returns the number of receivers that saw the envelope.
    pub fn publish<M: Any + Send + Sync>(&self, message: M) -> usize {
        self.deliver(MessageEnvelope::new(message))
    }

    /// Send a message to one destination address.
    pub fn send<M: Any + Send + Sync>(&self, destination: Address, message: M) -> usize {
        self.deliver(MessageEnvelope::new(message).with_destination(destination))
    }

    /// Deliver a fully built envelope.
    pub fn deliver(&self, envelope: MessageEnvelope) -> usize {
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Subscribe to envelopes delivered after this point.
    pub fn subscribe(&self) -> broadcast::Receiver<MessageEnvelope> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
