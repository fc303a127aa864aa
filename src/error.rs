use thiserror::Error;

use crate::client::TransportError;

/// Errors returned by the engine itself.
///
/// Per-request and per-user failures never surface here: they are recorded as
/// failed outcomes or population counters. Only configuration problems and
/// misuse of the run lifecycle abort a call.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed workload or ramp configuration, raised at load/start time.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The requested lifecycle operation is not valid in the current run state.
    #[error("operation `{operation}` is not valid while the run is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: crate::controller::RunState,
    },
    /// The scheduler task went away unexpectedly.
    #[error("scheduler task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn config(detail: impl Into<String>) -> Self {
        Error::Configuration(detail.into())
    }
}

/// Outcome of a single action invocation.
pub type ActionResult = Result<(), ActionError>;

/// Errors an action (or a hook) can hand back to its virtual user.
///
/// Only [`ActionError::FatalStart`] changes control flow, and only when
/// returned from an `on_start` hook: the user stops immediately and is counted
/// as a start failure. Every other variant is logged and the loop continues.
#[derive(Debug, Error)]
pub enum ActionError {
    /// A response arrived but the action judged it a business failure.
    #[error("assertion failed: {0}")]
    Assertion(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The user cannot continue, for example authentication was rejected.
    #[error("fatal start failure: {0}")]
    FatalStart(String),
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ActionError {
    fn from(err: serde_json::Error) -> Self {
        ActionError::Other(format!("json: {err}"))
    }
}
