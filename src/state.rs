//! State of an asynchronous flow.

use crate::FlowError;

/// Status tag of an [`AsyncState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// A computation is in flight.
    Pending,
    /// The last computation produced a value.
    Success,
    /// The last computation failed.
    Error,
}

/// Value of an asynchronous derived flow.
///
/// `data` may be present alongside `Pending` and `Error` to carry the last
/// known good payload, so consumers can keep rendering stale data while a
/// reload is in progress or after it failed.
///
/// # Example
///
/// ```
/// use reflow::{AsyncState, Status};
///
/// let reloading = AsyncState::Pending { data: Some(3) };
/// assert_eq!(reloading.status(), Status::Pending);
/// assert_eq!(reloading.data(), Some(&3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncState<T> {
    /// Waiting for a computation to settle.
    Pending {
        /// Payload of the previous computation, if any.
        data: Option<T>,
    },
    /// The computation produced `data`.
    Success {
        /// The computed payload.
        data: T,
    },
    /// The computation failed.
    Error {
        /// The failure.
        error: FlowError,
        /// Payload of the previous computation, if any.
        data: Option<T>,
    },
}

impl<T> AsyncState<T> {
    /// Pending state without data.
    pub fn pending() -> Self {
        AsyncState::Pending { data: None }
    }

    /// Successful state.
    pub fn success(data: T) -> Self {
        AsyncState::Success { data }
    }

    /// Status tag of this state.
    pub fn status(&self) -> Status {
        match self {
            AsyncState::Pending { .. } => Status::Pending,
            AsyncState::Success { .. } => Status::Success,
            AsyncState::Error { .. } => Status::Error,
        }
    }

    /// Check if a computation is still in flight.
    pub fn is_pending(&self) -> bool {
        matches!(self, AsyncState::Pending { .. })
    }

    /// Check if the state holds a successful value.
    pub fn is_success(&self) -> bool {
        matches!(self, AsyncState::Success { .. })
    }

    /// Check if the state holds an error.
    pub fn is_error(&self) -> bool {
        matches!(self, AsyncState::Error { .. })
    }

    /// The payload, whether fresh or carried over.
    pub fn data(&self) -> Option<&T> {
        match self {
            AsyncState::Pending { data } | AsyncState::Error { data, .. } => data.as_ref(),
            AsyncState::Success { data } => Some(data),
        }
    }

    /// The payload, consuming the state.
    pub fn into_data(self) -> Option<T> {
        match self {
            AsyncState::Pending { data } | AsyncState::Error { data, .. } => data,
            AsyncState::Success { data } => Some(data),
        }
    }

    /// The error, if the state is `Error`.
    pub fn error(&self) -> Option<&FlowError> {
        match self {
            AsyncState::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Convert a settled state into a result. `Pending` yields `None`.
    pub fn into_result(self) -> Option<Result<T, FlowError>> {
        match self {
            AsyncState::Pending { .. } => None,
            AsyncState::Success { data } => Some(Ok(data)),
            AsyncState::Error { error, .. } => Some(Err(error)),
        }
    }
}

impl<T: Clone> AsyncState<T> {
    /// Compare two states as a consumer would see them.
    ///
    /// Statuses must match, payloads are compared with `equals` and errors by
    /// identity.
    pub(crate) fn equivalent(&self, other: &Self, equals: fn(&T, &T) -> bool) -> bool {
        let data_eq = |a: Option<&T>, b: Option<&T>| match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => equals(a, b),
            _ => false,
        };
        match (self, other) {
            (AsyncState::Pending { data: a }, AsyncState::Pending { data: b }) => {
                data_eq(a.as_ref(), b.as_ref())
            }
            (AsyncState::Success { data: a }, AsyncState::Success { data: b }) => equals(a, b),
            (
                AsyncState::Error { error: ea, data: a },
                AsyncState::Error { error: eb, data: b },
            ) => ea == eb && data_eq(a.as_ref(), b.as_ref()),
            _ => false,
        }
    }
}
