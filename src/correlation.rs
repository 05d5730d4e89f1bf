//! Correlation expressions mapping inbound messages to saga instances.
//!
//! Each event of a saga type declares exactly one correlation expression,
//! applied consistently for every delivery of that event:
//!
//! - **By id** - extract the correlation id from the message itself. The
//!   repository resolves the instance with a keyed load.
//! - **By query** - a predicate over (instance, message), for messages that
//!   carry a business key instead of the saga's id. The repository resolves
//!   instances with a scan (`send_query`). An optional id selector decides
//!   the id of a newly created instance.
//! - **By request token** - match the envelope's request token against an
//!   outstanding-request field on the instance. Used by the runtime for
//!   request Completed/Faulted/TimeoutExpired events; never creates.

use std::sync::Arc;

use uuid::Uuid;

use crate::context::ConsumeContext;

/// A predicate locating saga instances by content rather than by key.
pub struct SagaQuery<T> {
    filter: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T> SagaQuery<T> {
    /// Create a query from a predicate.
    pub fn new(filter: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            filter: Arc::new(filter),
        }
    }

    /// Does the instance match?
    pub fn matches(&self, instance: &T) -> bool {
        (self.filter)(instance)
    }
}

impl<T> Clone for SagaQuery<T> {
    fn clone(&self) -> Self {
        Self {
            filter: Arc::clone(&self.filter),
        }
    }
}

impl<T> std::fmt::Debug for SagaQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaQuery").finish_non_exhaustive()
    }
}

/// The correlation expression declared for one event.
pub enum EventCorrelation<T, M> {
    /// The message carries the saga's correlation id.
    ById {
        /// Extract the id from the message; `None` means the message is
        /// unusable and the turn fails with a missing-correlation error.
        extract: Arc<dyn Fn(&M) -> Option<Uuid> + Send + Sync>,
    },
    /// Instances are located by a predicate over instance and message.
    ByQuery {
        /// The predicate.
        filter: Arc<dyn Fn(&T, &M) -> bool + Send + Sync>,
        /// Id for a newly created instance; defaults to a fresh random id.
        select_id: Option<Arc<dyn Fn(&M) -> Uuid + Send + Sync>>,
    },
    /// The envelope's request token is matched against an instance field
    /// holding the token of an outstanding request.
    ByRequestToken {
        /// Read the outstanding-request token from the instance.
        get_token: Arc<dyn Fn(&T) -> Option<Uuid> + Send + Sync>,
    },
}

impl<T, M> EventCorrelation<T, M> {
    /// Correlate by an id carried on the message.
    pub fn by_id(extract: impl Fn(&M) -> Option<Uuid> + Send + Sync + 'static) -> Self {
        EventCorrelation::ById {
            extract: Arc::new(extract),
        }
    }

    /// Correlate by a predicate over instance and message.
    pub fn by_query(filter: impl Fn(&T, &M) -> bool + Send + Sync + 'static) -> Self {
        EventCorrelation::ByQuery {
            filter: Arc::new(filter),
            select_id: None,
        }
    }

    /// Correlate by predicate, selecting the id for created instances from
    /// the message.
    pub fn by_query_with_id(
        filter: impl Fn(&T, &M) -> bool + Send + Sync + 'static,
        select_id: impl Fn(&M) -> Uuid + Send + Sync + 'static,
    ) -> Self {
        EventCorrelation::ByQuery {
            filter: Arc::new(filter),
            select_id: Some(Arc::new(select_id)),
        }
    }

    /// Correlate by the envelope request token against an instance field.
    pub fn by_request_token(
        get_token: impl Fn(&T) -> Option<Uuid> + Send + Sync + 'static,
    ) -> Self {
        EventCorrelation::ByRequestToken {
            get_token: Arc::new(get_token),
        }
    }

    /// Is this an id-keyed correlation (repository `send` path)?
    pub fn is_by_id(&self) -> bool {
        matches!(self, EventCorrelation::ById { .. })
    }
}

impl<T: Send + Sync + 'static, M: Send + Sync + 'static> EventCorrelation<T, M> {
    /// The correlation id for an id-correlated delivery.
    ///
    /// `None` for query-style correlations, or when the extractor cannot
    /// produce an id from the message.
    pub fn resolve_id(&self, message: &M) -> Option<Uuid> {
        match self {
            EventCorrelation::ById { extract } => extract(message),
            _ => None,
        }
    }

    /// The id a newly created instance should be assigned for this
    /// delivery.
    pub fn new_instance_id(&self, context: &ConsumeContext<M>) -> Uuid {
        match self {
            EventCorrelation::ById { extract } => extract(context.message())
                .or_else(|| context.correlation_id())
                .unwrap_or_else(Uuid::new_v4),
            EventCorrelation::ByQuery { select_id, .. } => select_id
                .as_ref()
                .map(|f| f(context.message()))
                .or_else(|| context.correlation_id())
                .unwrap_or_else(Uuid::new_v4),
            EventCorrelation::ByRequestToken { .. } => Uuid::new_v4(),
        }
    }

    /// Build the repository query for a query-style delivery.
    ///
    /// Returns `None` for id-keyed correlations, and for token correlations
    /// when the envelope carries no request token (such deliveries can
    /// never match an instance and are dropped upstream).
    pub fn to_query(&self, context: &ConsumeContext<M>) -> Option<SagaQuery<T>> {
        match self {
            EventCorrelation::ById { .. } => None,
            EventCorrelation::ByQuery { filter, .. } => {
                let filter = Arc::clone(filter);
                let message = context.message_arc();
                Some(SagaQuery::new(move |instance: &T| {
                    filter(instance, &message)
                }))
            }
            EventCorrelation::ByRequestToken { get_token } => {
                let request_id = context.request_id()?;
                let get_token = Arc::clone(get_token);
                Some(SagaQuery::new(move |instance: &T| {
                    get_token(instance) == Some(request_id)
                }))
            }
        }
    }
}

impl<T, M> Clone for EventCorrelation<T, M> {
    fn clone(&self) -> Self {
        match self {
            EventCorrelation::ById { extract } => EventCorrelation::ById {
                extract: Arc::clone(extract),
            },
            EventCorrelation::ByQuery { filter, select_id } => EventCorrelation::ByQuery {
                filter: Arc::clone(filter),
                select_id: select_id.as_ref().map(Arc::clone),
            },
            EventCorrelation::ByRequestToken { get_token } => EventCorrelation::ByRequestToken {
                get_token: Arc::clone(get_token),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MessageBus, MessageEnvelope};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone)]
    struct CartState {
        member_number: String,
        timeout_token: Option<Uuid>,
    }

    #[derive(Debug, Clone)]
    struct SubmitOrder {
        order_id: Option<Uuid>,
        member_number: String,
    }

    fn context(message: SubmitOrder) -> ConsumeContext<SubmitOrder> {
        ConsumeContext::new(message, MessageBus::new())
    }

    #[test]
    fn test_by_id_resolves_from_message() {
        let id = Uuid::new_v4();
        let correlation: EventCorrelation<CartState, SubmitOrder> =
            EventCorrelation::by_id(|m: &SubmitOrder| m.order_id);

        let resolved = correlation.resolve_id(&SubmitOrder {
            order_id: Some(id),
            member_number: "m-1".into(),
        });
        assert_eq!(resolved, Some(id));
        assert!(correlation.is_by_id());
    }

    #[test]
    fn test_by_id_missing_id_is_none() {
        let correlation: EventCorrelation<CartState, SubmitOrder> =
            EventCorrelation::by_id(|m: &SubmitOrder| m.order_id);

        let resolved = correlation.resolve_id(&SubmitOrder {
            order_id: None,
            member_number: "m-1".into(),
        });
        assert!(resolved.is_none());
    }

    #[test]
    fn test_by_query_matches_on_instance_and_message() {
        let correlation: EventCorrelation<CartState, SubmitOrder> =
            EventCorrelation::by_query(|s: &CartState, m: &SubmitOrder| s.member_number == m.member_number);

        let ctx = context(SubmitOrder {
            order_id: None,
            member_number: "m-7".into(),
        });
        let query = correlation.to_query(&ctx).expect("query correlation");

        assert!(query.matches(&CartState {
            member_number: "m-7".into(),
            timeout_token: None,
        }));
        assert!(!query.matches(&CartState {
            member_number: "m-8".into(),
            timeout_token: None,
        }));
    }

    #[test]
    fn test_select_id_decides_created_instance_id() {
        let chosen = Uuid::new_v4();
        let correlation: EventCorrelation<CartState, SubmitOrder> =
            EventCorrelation::by_query_with_id(
                |s: &CartState, m: &SubmitOrder| s.member_number == m.member_number,
                move |_| chosen,
            );

        let ctx = context(SubmitOrder {
            order_id: None,
            member_number: "m-7".into(),
        });
        assert_eq!(correlation.new_instance_id(&ctx), chosen);
    }

    #[test]
    fn test_request_token_query_requires_envelope_token() {
        let correlation: EventCorrelation<CartState, SubmitOrder> =
            EventCorrelation::by_request_token(|s: &CartState| s.timeout_token);

        // No request id on the envelope: no query, delivery is dropped.
        let ctx = context(SubmitOrder {
            order_id: None,
            member_number: "m-1".into(),
        });
        assert!(correlation.to_query(&ctx).is_none());

        // Request id present: only the instance holding that token matches.
        let token = Uuid::new_v4();
        let bus = MessageBus::new();
        let envelope = MessageEnvelope::new(SubmitOrder {
            order_id: None,
            member_number: "m-1".into(),
        })
        .with_request_id(token);
        let ctx: ConsumeContext<SubmitOrder> =
            ConsumeContext::from_envelope(&envelope, bus, CancellationToken::new()).unwrap();

        let query = correlation.to_query(&ctx).unwrap();
        assert!(query.matches(&CartState {
            member_number: "m-1".into(),
            timeout_token: Some(token),
        }));
        assert!(!query.matches(&CartState {
            member_number: "m-1".into(),
            timeout_token: Some(Uuid::new_v4()),
        }));
        assert!(!query.matches(&CartState {
            member_number: "m-1".into(),
            timeout_token: None,
        }));
    }
}
