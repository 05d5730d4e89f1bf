//! Structured error types for saga resolution and execution.
//!
//! `SagaError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses the repository boundary.**
//!
//! - `anyhow` is internal transport (storage backends, activity bodies)
//! - `SagaError` is the only externalized error, and it always carries the
//!   saga type, the message type, and (when known) the correlation id, so a
//!   dead-letter queue entry can be traced back to one instance
//!
//! # Taxonomy
//!
//! | Variant                | Meaning                                      | Caller reaction     |
//! |------------------------|----------------------------------------------|---------------------|
//! | `MissingCorrelationId` | Message has no usable correlation            | Dead-letter         |
//! | `PolicyViolation`      | Policy rejected the resolved instance        | Dead-letter         |
//! | `InstanceMissing`      | No instance and the policy faults on miss    | Retry / dead-letter |
//! | `Repository`           | Storage failed mid-turn                      | Redeliver           |
//! | `Activity`             | Unhandled business error inside a transition | Redeliver           |
//!
//! Two outcomes are deliberately NOT errors:
//! - a missing instance under a silent policy (multiple sagas sharing a
//!   message type), which completes as a no-op
//! - a lost pre-insert race, which is recovered locally by reloading the
//!   winner's record

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Errors surfaced by saga repositories and the state-machine runtime.
///
/// An error returned from a turn means nothing was persisted for that turn;
/// the transport's redelivery policy decides what happens next.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The message carried no correlation id and the event declared no way
    /// to extract one.
    #[error("the correlation id was not specified: saga {saga_type} message {message_type}")]
    MissingCorrelationId {
        /// Type name of the saga instance.
        saga_type: &'static str,
        /// Type name of the inbound message.
        message_type: &'static str,
    },

    /// The policy located an instance but refused to dispatch to it.
    #[error("saga policy rejected {message_type} for {saga_type}:{correlation_id}: {reason}")]
    PolicyViolation {
        /// Type name of the saga instance.
        saga_type: &'static str,
        /// Type name of the inbound message.
        message_type: &'static str,
        /// The resolved correlation id.
        correlation_id: Uuid,
        /// Why the policy rejected the dispatch.
        reason: String,
    },

    /// No instance matched and the policy was configured to fault instead of
    /// ignoring the message.
    #[error("no {saga_type} instance found for {message_type}")]
    InstanceMissing {
        /// Type name of the saga instance.
        saga_type: &'static str,
        /// Type name of the inbound message.
        message_type: &'static str,
    },

    /// The storage driver failed in a way the turn could not recover from.
    ///
    /// Duplicate-key conflicts during pre-insert never surface here; they
    /// are resolved by falling back to the existing record.
    #[error("repository failure for {saga_type}:{correlation_id} handling {message_type}")]
    Repository {
        /// Type name of the saga instance.
        saga_type: &'static str,
        /// Type name of the inbound message.
        message_type: &'static str,
        /// The correlation id of the turn, nil when resolution never got
        /// that far.
        correlation_id: Uuid,
        /// The underlying storage error.
        #[source]
        source: StoreError,
    },

    /// An activity inside a transition returned an error no declared catch
    /// clause matched.
    #[error("activity faulted for {saga_type}:{correlation_id} handling {message_type} in state {state}")]
    Activity {
        /// Type name of the saga instance.
        saga_type: &'static str,
        /// Type name of the inbound message.
        message_type: &'static str,
        /// The correlation id of the instance.
        correlation_id: Uuid,
        /// The state the instance was in when the activity faulted.
        state: String,
        /// The business error raised by the activity.
        #[source]
        source: anyhow::Error,
    },
}

impl SagaError {
    /// Missing-correlation error for a (saga, message) pair.
    pub fn missing_correlation_id<T, M>() -> Self {
        SagaError::MissingCorrelationId {
            saga_type: std::any::type_name::<T>(),
            message_type: std::any::type_name::<M>(),
        }
    }

    /// Wrap a storage failure with the turn's identity.
    pub fn repository<T, M>(correlation_id: Uuid, source: StoreError) -> Self {
        SagaError::Repository {
            saga_type: std::any::type_name::<T>(),
            message_type: std::any::type_name::<M>(),
            correlation_id,
            source,
        }
    }

    /// Wrap an unhandled activity error with the turn's identity.
    pub fn activity<T, M>(correlation_id: Uuid, state: &str, source: anyhow::Error) -> Self {
        SagaError::Activity {
            saga_type: std::any::type_name::<T>(),
            message_type: std::any::type_name::<M>(),
            correlation_id,
            state: state.to_string(),
            source,
        }
    }

    /// The correlation id this error is about, if resolution got that far.
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            SagaError::MissingCorrelationId { .. } | SagaError::InstanceMissing { .. } => None,
            SagaError::PolicyViolation { correlation_id, .. }
            | SagaError::Repository { correlation_id, .. }
            | SagaError::Activity { correlation_id, .. } => Some(*correlation_id),
        }
    }
}
