//! Consume contexts for inbound messages and resolved saga instances.
//!
//! [`ConsumeContext`] is the message-side view of one delivery: the payload,
//! the envelope headers the saga subsystem correlates on, the outbound
//! surfaces (publish/send/respond), and the ambient cancellation signal of
//! the receive pipeline.
//!
//! [`SagaConsumeContext`] adds the loaded (or freshly created) instance and
//! the `is_completed` flag. The flag is owned here, not by the instance:
//! it tells the repository whether to persist, delete, or discard at the
//! end of the turn.
//!
//! # Immutability Invariant
//!
//! `ConsumeContext` is cheap to clone and clones are semantically
//! identical. Nothing per-delivery mutable lives on it except the
//! correlation id, which the endpoint resolves exactly once before
//! dispatch.

use std::any::Any;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{Address, MessageBus, MessageEnvelope};

/// Context for one inbound message delivery.
pub struct ConsumeContext<M> {
    message: Arc<M>,
    correlation_id: Option<Uuid>,
    request_id: Option<Uuid>,
    scheduling_token: Option<Uuid>,
    response_address: Option<Address>,
    bus: MessageBus,
    cancellation: CancellationToken,
}

impl<M> Clone for ConsumeContext<M> {
    fn clone(&self) -> Self {
        Self {
            message: Arc::clone(&self.message),
            correlation_id: self.correlation_id,
            request_id: self.request_id,
            scheduling_token: self.scheduling_token,
            response_address: self.response_address.clone(),
            bus: self.bus.clone(),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<M: Any + Send + Sync> ConsumeContext<M> {
    /// Create a context for a bare message, with no envelope headers.
    ///
    /// Useful at edges and in tests; endpoint dispatch uses
    /// [`ConsumeContext::from_envelope`].
    pub fn new(message: M, bus: MessageBus) -> Self {
        Self {
            message: Arc::new(message),
            correlation_id: None,
            request_id: None,
            scheduling_token: None,
            response_address: None,
            bus,
            cancellation: CancellationToken::new(),
        }
    }

    /// Build a context from a received envelope.
    ///
    /// Returns `None` if the payload is not an `M`.
    pub fn from_envelope(
        envelope: &MessageEnvelope,
        bus: MessageBus,
        cancellation: CancellationToken,
    ) -> Option<Self> {
        if !envelope.is::<M>() {
            return None;
        }
        let payload = Arc::clone(&envelope.payload);
        let message = payload.downcast::<M>().ok()?;
        Some(Self {
            message,
            correlation_id: envelope.correlation_id,
            request_id: envelope.request_id,
            scheduling_token: envelope.scheduling_token,
            response_address: envelope.response_address.clone(),
            bus,
            cancellation,
        })
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// The inbound message.
    pub fn message(&self) -> &M {
        &self.message
    }

    /// Shared handle to the message, for queries that outlive the borrow.
    pub(crate) fn message_arc(&self) -> Arc<M> {
        Arc::clone(&self.message)
    }

    /// Correlation id of this delivery, if resolved.
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Resolve the correlation id for this delivery.
    ///
    /// Called once by the endpoint after the event's correlation expression
    /// has been applied.
    pub fn set_correlation_id(&mut self, correlation_id: Uuid) {
        self.correlation_id = Some(correlation_id);
    }

    /// Request token this message belongs to, if any.
    pub fn request_id(&self) -> Option<Uuid> {
        self.request_id
    }

    /// Token of the scheduled delivery that produced this message, if any.
    pub fn scheduling_token(&self) -> Option<Uuid> {
        self.scheduling_token
    }

    /// Ambient cancellation signal for this delivery.
    ///
    /// Cancellation mid-turn discards the in-flight mutation instead of
    /// partially persisting it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Publish a message to all subscribers, propagating the correlation id.
    pub fn publish<P: Any + Send + Sync>(&self, message: P) -> usize {
        self.bus.deliver(self.outgoing(message))
    }

    /// Send a message to one destination, propagating the correlation id.
    pub fn send<P: Any + Send + Sync>(&self, destination: Address, message: P) -> usize {
        self.bus
            .deliver(self.outgoing(message).with_destination(destination))
    }

    /// Send a request to a service, stamped with the exchange token and a
    /// response address.
    pub fn send_request<P: Any + Send + Sync>(
        &self,
        destination: Address,
        message: P,
        request_id: Uuid,
        response_address: Address,
    ) -> usize {
        self.bus.deliver(
            self.outgoing(message)
                .with_destination(destination)
                .with_request_id(request_id)
                .with_response_address(response_address),
        )
    }

    /// Respond to this message's originator.
    ///
    /// The response carries the inbound request token so the requestor can
    /// match it against its outstanding-request field. If the envelope had
    /// no response address the response is published.
    pub fn respond<P: Any + Send + Sync>(&self, message: P) -> usize {
        let mut envelope = self.outgoing(message);
        if let Some(request_id) = self.request_id {
            envelope = envelope.with_request_id(request_id);
        }
        if let Some(address) = &self.response_address {
            envelope = envelope.with_destination(address.clone());
        }
        self.bus.deliver(envelope)
    }

    fn outgoing<P: Any + Send + Sync>(&self, message: P) -> MessageEnvelope {
        let mut envelope = MessageEnvelope::new(message);
        if let Some(cid) = self.correlation_id {
            envelope = envelope.with_correlation_id(cid);
        }
        envelope
    }

    /// Deliver a pre-built envelope, stamping this turn's correlation id
    /// unless the envelope already carries one.
    pub(crate) fn publish_envelope(&self, mut envelope: MessageEnvelope) -> usize {
        if envelope.correlation_id.is_none() {
            envelope.correlation_id = self.correlation_id;
        }
        self.bus.deliver(envelope)
    }

    /// Deliver a pre-built envelope to one destination.
    pub(crate) fn send_envelope(&self, destination: Address, envelope: MessageEnvelope) -> usize {
        self.publish_envelope(envelope.with_destination(destination))
    }

    /// Deliver a pre-built envelope as a response to this message.
    pub(crate) fn respond_envelope(&self, mut envelope: MessageEnvelope) -> usize {
        if let Some(request_id) = self.request_id {
            envelope = envelope.with_request_id(request_id);
        }
        if let Some(address) = &self.response_address {
            envelope = envelope.with_destination(address.clone());
        }
        self.publish_envelope(envelope)
    }
}

/// Context for one turn against one saga instance.
///
/// Created by the repository after the instance has been located or
/// created, and handed down the pipe. The turn's ownership rules are
/// strict: this context holds the only in-flight copy of the instance, and
/// the repository reads it back (via [`SagaConsumeContext::into_parts`])
/// when the pipe returns.
pub struct SagaConsumeContext<T, M> {
    context: ConsumeContext<M>,
    instance: T,
    completed: bool,
}

impl<T, M: Any + Send + Sync> SagaConsumeContext<T, M> {
    /// Wrap an instance for one turn.
    pub fn new(context: ConsumeContext<M>, instance: T) -> Self {
        Self {
            context,
            instance,
            completed: false,
        }
    }

    /// The message-side context.
    pub fn context(&self) -> &ConsumeContext<M> {
        &self.context
    }

    /// The inbound message.
    pub fn message(&self) -> &M {
        self.context.message()
    }

    /// The instance this turn runs against.
    pub fn instance(&self) -> &T {
        &self.instance
    }

    /// Mutable access to the instance.
    pub fn instance_mut(&mut self) -> &mut T {
        &mut self.instance
    }

    /// Whether this turn marked the saga completed.
    ///
    /// A completed context makes the repository delete the instance (or
    /// skip the deferred insert of a new one) instead of persisting it.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Mark the saga completed.
    pub fn set_completed(&mut self) {
        self.completed = true;
    }

    /// Take the turn's results back out of the context.
    pub fn into_parts(self) -> (T, bool) {
        (self.instance, self.completed)
    }
}
