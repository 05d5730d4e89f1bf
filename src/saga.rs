//! Saga instance traits.
//!
//! A saga is a long-lived, message-correlated business-process instance.
//! Its identity is a correlation id assigned exactly once, at creation, and
//! never reassigned afterwards.
//!
//! # Ownership
//!
//! The repository exclusively owns durable storage. During one turn the
//! runtime owns the single in-flight copy of the instance; no session or
//! pipe back-pointer is ever stored on the instance itself.

use uuid::Uuid;

/// A correlated saga instance.
///
/// Implementations own all saga-scoped fields. The only requirement at this
/// level is a stable identity.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct OrderState {
///     correlation_id: Uuid,
///     member_number: String,
/// }
///
/// impl Saga for OrderState {
///     fn correlation_id(&self) -> Uuid {
///         self.correlation_id
///     }
/// }
/// ```
pub trait Saga: Send + Sync + 'static {
    /// The identity of this instance. Assigned once at creation.
    fn correlation_id(&self) -> Uuid;
}

/// A saga instance driven by a declarative state machine.
///
/// On top of [`Saga`] identity, the instance stores the name of its current
/// state. The name (not a numeric id) is what gets persisted, so snapshots
/// in a document store remain readable across machine revisions.
///
/// `create` is a plain associated constructor, called by the repository's
/// create path when an instance-creating event arrives for a new correlation
/// id. New instances start with an empty current state; the runtime places
/// them in the machine's initial state before the first transition runs.
pub trait SagaStateMachineInstance: Saga + Clone {
    /// Construct a fresh instance for a never-before-seen correlation id.
    fn create(correlation_id: Uuid) -> Self;

    /// Name of the state this instance is currently in.
    fn current_state(&self) -> &str;

    /// Record a transition to the named state.
    fn set_current_state(&mut self, state: &str);
}

/// Accessor pair for an `Option<Uuid>` token field on an instance.
///
/// Tokens correlate one outstanding scheduled delivery or request back to
/// the instance that started it. A saga declares one accessor per
/// schedule/request so the runtime can stamp, compare, and clear the field
/// without knowing the instance's layout.
pub struct TokenAccessor<T> {
    get: std::sync::Arc<dyn Fn(&T) -> Option<Uuid> + Send + Sync>,
    set: std::sync::Arc<dyn Fn(&mut T, Option<Uuid>) + Send + Sync>,
}

impl<T> TokenAccessor<T> {
    /// Create an accessor from a getter and a setter.
    ///
    /// ```ignore
    /// TokenAccessor::new(
    ///     |s: &CartState| s.cart_timeout_token,
    ///     |s, token| s.cart_timeout_token = token,
    /// )
    /// ```
    pub fn new(
        get: impl Fn(&T) -> Option<Uuid> + Send + Sync + 'static,
        set: impl Fn(&mut T, Option<Uuid>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            get: std::sync::Arc::new(get),
            set: std::sync::Arc::new(set),
        }
    }

    /// Read the token.
    pub fn get(&self, instance: &T) -> Option<Uuid> {
        (self.get)(instance)
    }

    /// Write (or clear) the token.
    pub fn set(&self, instance: &mut T, token: Option<Uuid>) {
        (self.set)(instance, token)
    }
}

impl<T> Clone for TokenAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            get: std::sync::Arc::clone(&self.get),
            set: std::sync::Arc::clone(&self.set),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct CartState {
        correlation_id: Uuid,
        current_state: String,
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
            }
        }

        fn current_state(&self) -> &str {
            &self.current_state
        }

        fn set_current_state(&mut self, state: &str) {
            self.current_state = state.to_string();
        }
    }

    #[test]
    fn test_create_assigns_identity_once() {
        let id = Uuid::new_v4();
        let instance = CartState::create(id);

        assert_eq!(instance.correlation_id(), id);
        assert_eq!(instance.current_state(), "");
    }

    #[test]
    fn test_current_state_round_trip() {
        let mut instance = CartState::create(Uuid::new_v4());

        instance.set_current_state("Active");
        assert_eq!(instance.current_state(), "Active");

        instance.set_current_state("Final");
        assert_eq!(instance.current_state(), "Final");
    }

    #[derive(Clone)]
    struct Tokened {
        correlation_id: Uuid,
        timeout_token: Option<Uuid>,
    }

    impl Saga for Tokened {
        fn correlation_id(&self) -> Uuid {
            self.correlation_id
        }
    }

    #[test]
    fn test_token_accessor_round_trip() {
        let accessor = TokenAccessor::new(
            |s: &Tokened| s.timeout_token,
            |s, token| s.timeout_token = token,
        );

        let mut instance = Tokened {
            correlation_id: Uuid::new_v4(),
            timeout_token: None,
        };
        assert_eq!(accessor.get(&instance), None);

        let token = Uuid::new_v4();
        accessor.set(&mut instance, Some(token));
        assert_eq!(accessor.get(&instance), Some(token));

        accessor.set(&mut instance, None);
        assert_eq!(accessor.get(&instance), None);
    }
}
