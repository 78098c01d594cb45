//! Error types for flow evaluation.

use std::fmt;
use std::sync::Arc;

/// Errors produced while evaluating or notifying flows.
///
/// User errors can be propagated from derivations using the `?` operator, which
/// converts any `Into<anyhow::Error>` type into `FlowError::User`.
///
/// Equality is identity-based: two `User` errors are equal only if they share
/// the same allocation. This is what the dependency tracker relies on to tell
/// whether a failing source has failed again with a new error.
#[derive(Debug, Clone)]
pub enum FlowError {
    /// The computation was skipped or superseded.
    ///
    /// Returned by `skip()` and by cancelled asynchronous derivations. It only
    /// reaches consumers when no fallback state exists.
    Cancelled,

    /// Dependency cycle detected.
    ///
    /// `path` lists the flows on the evaluation stack, ending with the flow
    /// that was re-entered.
    Cycle {
        /// Display representation of the flows forming the cycle.
        path: Vec<String>,
    },

    /// One or more listeners failed during notification.
    Listeners(ListenerErrors),

    /// Error raised by a derivation or a listener.
    User(Arc<anyhow::Error>),
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::Cancelled => write!(f, "computation cancelled"),
            FlowError::Cycle { path } => {
                write!(f, "dependency cycle detected: {}", path.join(" -> "))
            }
            FlowError::Listeners(errors) => fmt::Display::fmt(errors, f),
            FlowError::User(e) => write!(f, "user error: {}", e),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for FlowError {
    fn from(err: T) -> Self {
        FlowError::User(Arc::new(err.into()))
    }
}

impl PartialEq for FlowError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FlowError::Cancelled, FlowError::Cancelled) => true,
            (FlowError::Cycle { path: a }, FlowError::Cycle { path: b }) => a == b,
            (FlowError::Listeners(a), FlowError::Listeners(b)) => a.errors == b.errors,
            (FlowError::User(a), FlowError::User(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl FlowError {
    /// Returns `true` if this is the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlowError::Cancelled)
    }

    /// Returns a reference to the inner user error if this is a `User` variant.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            FlowError::User(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a `User` error containing an error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }
}

/// Failures collected from listeners during a single notification pass.
///
/// Every listener is called even if an earlier one failed; the failures are
/// then reported together. Nested aggregates are flattened.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} listener(s) failed: {}", .errors.len(), summary(.errors))]
pub struct ListenerErrors {
    errors: Vec<FlowError>,
}

fn summary(errors: &[FlowError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ListenerErrors {
    pub(crate) fn new(failures: Vec<FlowError>) -> Self {
        let mut errors = Vec::with_capacity(failures.len());
        for failure in failures {
            match failure {
                FlowError::Listeners(nested) => errors.extend(nested.errors),
                other => errors.push(other),
            }
        }
        Self { errors }
    }

    /// The individual listener failures, in delivery order.
    pub fn errors(&self) -> &[FlowError] {
        &self.errors
    }

    /// Number of failed listeners.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns `true` if no failure was recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_identity() {
        let a: FlowError = anyhow::anyhow!("boom").into();
        let b: FlowError = anyhow::anyhow!("boom").into();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_question_mark_conversion() {
        fn parse(input: &str) -> Result<i32, FlowError> {
            Ok(input.parse::<i32>()?)
        }

        assert_eq!(parse("7").unwrap(), 7);
        let err = parse("seven").unwrap_err();
        assert!(err.is::<std::num::ParseIntError>());
        assert!(err.to_string().contains("invalid digit"));
    }

    #[test]
    fn test_listener_errors_flatten() {
        let inner = FlowError::Listeners(ListenerErrors::new(vec![
            FlowError::Cancelled,
            anyhow::anyhow!("first").into(),
        ]));
        let outer = ListenerErrors::new(vec![inner, anyhow::anyhow!("second").into()]);

        assert_eq!(outer.len(), 3);
        assert!(outer.errors()[0].is_cancelled());
        assert!(outer.to_string().starts_with("3 listener(s) failed"));
    }
}
