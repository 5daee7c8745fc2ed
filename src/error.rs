//! Error types.
//!
//! Request lifecycle failures travel on a request's error channel as
//! [`RequestError`]. Declaration-time mistakes are returned synchronously as
//! [`MockError`]. Failures raised by virtual clock callbacks surface from
//! [`VirtualClock::advance`](crate::timers::VirtualClock::advance) as
//! [`ClockError`].

use thiserror::Error;

/// Connection-reset code reported for aborted requests.
pub const ECONNRESET: &str = "ECONNRESET";

/// An error delivered to the listeners of a mocked request.
///
/// Cloneable because a scripted error is replayed every time its route runs,
/// and every error listener receives the same value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// No route accepted the request.
    #[error("no route for {url}")]
    NoRoute { url: String },

    /// The caller aborted the request or destroyed its socket.
    #[error("socket hang up")]
    Aborted,

    /// Error injected with the `throw` action.
    #[error("{message}")]
    Scripted { message: String },

    /// An action failed its continuation.
    #[error("{message}")]
    Action { message: String },

    /// An action dropped its continuation without calling it.
    #[error("action dropped its continuation without calling it")]
    ContinuationDropped,

    /// The forwarded network call failed.
    #[error("forwarded request failed: {message}")]
    Forward { message: String },

    /// A response template could not be rendered.
    #[error("template render failed: {message}")]
    Template { message: String },
}

impl RequestError {
    /// Build an action failure from any message.
    pub fn msg(message: impl Into<String>) -> Self {
        RequestError::Action {
            message: message.into(),
        }
    }

    /// Build a scripted failure, as used by the `throw` action.
    pub fn scripted(message: impl Into<String>) -> Self {
        RequestError::Scripted {
            message: message.into(),
        }
    }

    /// Node-style error code, if the error carries one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            RequestError::Aborted => Some(ECONNRESET),
            _ => None,
        }
    }
}

impl From<&str> for RequestError {
    fn from(message: &str) -> Self {
        RequestError::scripted(message)
    }
}

impl From<String> for RequestError {
    fn from(message: String) -> Self {
        RequestError::scripted(message)
    }
}

impl From<anyhow::Error> for RequestError {
    fn from(err: anyhow::Error) -> Self {
        RequestError::Action {
            message: format!("{err:#}"),
        }
    }
}

/// Declaration-time error, raised at the call site.
#[derive(Debug, Error)]
pub enum MockError {
    /// A route condition could not be built.
    #[error("when-condition not recognized: {reason}")]
    InvalidMatcher { reason: String },

    /// A chunk could not be decoded with the requested encoding.
    #[error("invalid {encoding} chunk: {reason}")]
    InvalidEncoding { encoding: String, reason: String },

    /// A route file failed validation.
    #[error("invalid route configuration: {0}")]
    Config(String),
}

impl MockError {
    pub(crate) fn invalid_matcher(reason: impl std::fmt::Display) -> Self {
        MockError::InvalidMatcher {
            reason: reason.to_string(),
        }
    }
}

/// A scheduled callback failed while the virtual clock was being driven.
#[derive(Debug, Error)]
pub enum ClockError {
    #[error("scheduled callback failed at {at}ms: {source:#}")]
    Callback {
        /// Logical timestamp of the failing tick.
        at: u64,
        source: anyhow::Error,
    },
}

impl ClockError {
    /// Logical timestamp at which the failure happened.
    pub fn at(&self) -> u64 {
        match self {
            ClockError::Callback { at, .. } => *at,
        }
    }
}
