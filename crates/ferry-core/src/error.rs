//! Error types for ferry-core.

use std::time::Duration;

use thiserror::Error;

use crate::context::{ContextId, LifecycleState};
use crate::dispatch::ActionKind;

/// Result type for ferry-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ferry-core.
///
/// Every variant produced by an action surfaces only through that action's
/// completion; none of them abort the hosting context.
#[derive(Debug, Error)]
pub enum Error {
    /// An import specifier could not be located or fetched.
    #[error("cannot resolve '{specifier}': {message}")]
    Resolution { specifier: String, message: String },

    /// The module graph failed to link (missing export, unresolvable static import).
    #[error("link error in '{specifier}': {message}")]
    Link { specifier: String, message: String },

    /// A script or module body threw, or failed to compile.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// A named load target does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An action was submitted to a context that is no longer accepting work.
    #[error("context {context} is {state}, not accepting actions")]
    InactiveContext {
        context: ContextId,
        state: LifecycleState,
    },

    /// A worker failed to reach its ready state.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// An action exceeded the configured deadline.
    #[error("{kind} action timed out after {}ms", .after.as_millis())]
    Timeout { kind: ActionKind, after: Duration },

    /// The context went away before the action completed.
    #[error("context {0} terminated before completing the action")]
    ContextGone(ContextId),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Render the error with a recovery hint, if one applies.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::Resolution { .. } => {
                Some("check the loader root and that the specifier names an existing module")
            }
            Error::Link { .. } => {
                Some("every name in `import {..} from` must be exported by the target module")
            }
            Error::NotFound(_) => {
                Some("named scripts are looked up in the engine's script library")
            }
            Error::InactiveContext { .. } => {
                Some("the context is shutting down; resubmit the action to another context")
            }
            Error::Spawn(_) => Some("raise FERRY_SPAWN_TIMEOUT_MS if engines are slow to start"),
            Error::Timeout { .. } => Some("raise FERRY_ACTION_TIMEOUT_MS or unset it to disable"),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{self}\n  hint: {hint}"),
            None => self.to_string(),
        }
    }
}
