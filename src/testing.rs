//! Testing utilities for saga machines and repositories.
//!
//! Only available with the `testing` feature (or inside this crate's own
//! tests):
//!
//! ```toml
//! [dev-dependencies]
//! sagabus = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use sagabus::testing::{await_message, should_contain_saga};
//!
//! let mut receiver = bus.subscribe();
//! bus.publish(CartItemAdded { member_number: "m-1".into() });
//!
//! let saga = should_contain_saga(
//!     store.as_ref(),
//!     &SagaQuery::new(|s: &CartState| s.current_state == "Active"),
//!     Duration::from_secs(5),
//! )
//! .await
//! .expect("saga created");
//!
//! let removed = await_message::<CartRemoved>(&mut receiver, Duration::from_secs(35)).await?;
//! ```

use std::any::Any;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::bus::MessageEnvelope;
use crate::correlation::SagaQuery;
use crate::saga::Saga;
use crate::store::SagaStore;

/// Poll interval for [`should_contain_saga`].
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Wait until the store contains exactly one saga matching the query.
///
/// Returns its correlation id, or `None` on timeout. Mirrors the
/// assert-eventually style used when the saga is driven through an
/// asynchronous endpoint rather than called directly.
pub async fn should_contain_saga<T: Saga>(
    store: &dyn SagaStore<T>,
    query: &SagaQuery<T>,
    timeout: Duration,
) -> Option<Uuid> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(ids) = store.find(query).await {
            if ids.len() == 1 {
                return Some(ids[0]);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Receive envelopes until one carries a message of type `M`.
///
/// Envelopes of other types are discarded. Fails on timeout or if the bus
/// closes.
pub async fn await_message<M: Any>(
    receiver: &mut broadcast::Receiver<MessageEnvelope>,
    timeout: Duration,
) -> Result<MessageEnvelope> {
    let receive = async {
        loop {
            match receiver.recv().await {
                Ok(envelope) if envelope.is::<M>() => return Ok(envelope),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow!("message bus closed"));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "test receiver lagged");
                    continue;
                }
            }
        }
    };
    tokio::time::timeout(timeout, receive)
        .await
        .map_err(|_| {
            anyhow!(
                "no {} received within {:?}",
                std::any::type_name::<M>(),
                timeout
            )
        })?
}

/// Count how many envelopes of type `M` are immediately available.
///
/// Non-blocking; useful for asserting "exactly one was published".
pub fn drain_count<M: Any>(receiver: &mut broadcast::Receiver<MessageEnvelope>) -> usize {
    let mut count = 0;
    while let Ok(envelope) = receiver.try_recv() {
        if envelope.is::<M>() {
            count += 1;
        }
    }
    count
}
