//! Message scheduling: deferred delivery with cancellable tokens.
//!
//! The saga runtime never owns timers. It asks a [`MessageScheduler`] for a
//! future delivery and stores the returned token on the instance; a later
//! `cancel_scheduled_send` with that token stops the delivery if it has not
//! fired yet.
//!
//! The delivered envelope carries its token in the `scheduling_token`
//! header. That is what makes stale deliveries harmless: if the instance
//! re-scheduled in the meantime, its stored token no longer matches and the
//! runtime drops the message.
//!
//! [`InMemoryScheduler`] is the tokio-timer implementation riding the
//! in-process bus - test and single-process grade. Quartz-style durable
//! schedulers plug in behind the same trait.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{Address, MessageBus, MessageEnvelope};

/// Deferred message delivery with cancellation.
#[async_trait]
pub trait MessageScheduler: Send + Sync + 'static {
    /// Deliver the envelope to `destination` after `delay`.
    ///
    /// Returns the token identifying this delivery; the envelope arrives
    /// with the token in its `scheduling_token` header.
    async fn schedule_send(
        &self,
        destination: Address,
        delay: Duration,
        envelope: MessageEnvelope,
    ) -> Result<Uuid>;

    /// Cancel a scheduled delivery.
    ///
    /// Unknown or already-fired tokens are a no-op; cancellation is
    /// idempotent.
    async fn cancel_scheduled_send(&self, token: Uuid) -> Result<()>;
}

struct PendingDelivery {
    cancel: CancellationToken,
    deliver_at: DateTime<Utc>,
}

/// Tokio-timer scheduler delivering through the in-process bus.
pub struct InMemoryScheduler {
    bus: MessageBus,
    pending: Arc<DashMap<Uuid, PendingDelivery>>,
}

impl InMemoryScheduler {
    /// Create a scheduler delivering on the given bus.
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Number of deliveries armed but not yet fired or cancelled.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// When the given pending delivery will fire, if it is still armed.
    pub fn deliver_at(&self, token: Uuid) -> Option<DateTime<Utc>> {
        self.pending.get(&token).map(|entry| entry.deliver_at)
    }
}

#[async_trait]
impl MessageScheduler for InMemoryScheduler {
    async fn schedule_send(
        &self,
        destination: Address,
        delay: Duration,
        envelope: MessageEnvelope,
    ) -> Result<Uuid> {
        let token = Uuid::new_v4();
        let envelope = envelope
            .with_destination(destination.clone())
            .with_scheduling_token(token);

        let cancel = CancellationToken::new();
        let deliver_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);

        // Armed before the timer starts; delivery only happens if the token
        // is still armed when it fires.
        self.pending.insert(
            token,
            PendingDelivery {
                cancel: cancel.clone(),
                deliver_at,
            },
        );

        let bus = self.bus.clone();
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if pending.remove(&token).is_some() {
                        debug!(%token, destination = %destination, "scheduled delivery fired");
                        bus.deliver(envelope);
                    }
                }
            }
        });

        Ok(token)
    }

    async fn cancel_scheduled_send(&self, token: Uuid) -> Result<()> {
        if let Some((_, entry)) = self.pending.remove(&token) {
            entry.cancel.cancel();
            debug!(%token, "scheduled delivery cancelled");
        }
        Ok(())
    }
}
