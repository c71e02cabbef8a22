//! Actions and their single-use completion sinks.

use std::fmt;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::context::ContextId;
use crate::engine::{Engine, ScriptError};
use crate::error::{Error, Result};

/// Outcome delivered to an action's completion.
pub type ActionResult = Result<Value>;

/// Host closure run against a context's engine.
pub type ExecFn = Box<dyn FnOnce(&dyn Engine) -> std::result::Result<Value, ScriptError> + Send>;

/// The kinds of work a host can submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Eval,
    EvalModule,
    Load,
    ImportAsync,
    Exec,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Eval => "eval",
            ActionKind::EvalModule => "eval-module",
            ActionKind::Load => "load",
            ActionKind::ImportAsync => "import",
            ActionKind::Exec => "exec",
        };
        f.write_str(name)
    }
}

/// What an action carries.
pub enum ActionPayload {
    /// Script source.
    Eval(String),
    /// Module source.
    EvalModule(String),
    /// Named script.
    Load(String),
    /// Import specifier.
    ImportAsync(String),
    Exec(ExecFn),
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Eval(_) => ActionKind::Eval,
            ActionPayload::EvalModule(_) => ActionKind::EvalModule,
            ActionPayload::Load(_) => ActionKind::Load,
            ActionPayload::ImportAsync(_) => ActionKind::ImportAsync,
            ActionPayload::Exec(_) => ActionKind::Exec,
        }
    }
}

impl fmt::Debug for ActionPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionPayload::Eval(code) => f.debug_tuple("Eval").field(code).finish(),
            ActionPayload::EvalModule(code) => f.debug_tuple("EvalModule").field(code).finish(),
            ActionPayload::Load(name) => f.debug_tuple("Load").field(name).finish(),
            ActionPayload::ImportAsync(spec) => f.debug_tuple("ImportAsync").field(spec).finish(),
            ActionPayload::Exec(_) => f.write_str("Exec(..)"),
        }
    }
}

/// A unit of work plus the sink that hears about its outcome exactly once.
#[derive(Debug)]
pub struct Action {
    pub payload: ActionPayload,
    pub completion: Completion,
}

impl Action {
    pub fn new(payload: ActionPayload, completion: Completion) -> Self {
        Self {
            payload,
            completion,
        }
    }

    pub fn eval(code: impl Into<String>, completion: Completion) -> Self {
        Self::new(ActionPayload::Eval(code.into()), completion)
    }

    pub fn eval_module(source: impl Into<String>, completion: Completion) -> Self {
        Self::new(ActionPayload::EvalModule(source.into()), completion)
    }

    pub fn load(name: impl Into<String>, completion: Completion) -> Self {
        Self::new(ActionPayload::Load(name.into()), completion)
    }

    pub fn import(specifier: impl Into<String>, completion: Completion) -> Self {
        Self::new(ActionPayload::ImportAsync(specifier.into()), completion)
    }

    pub fn exec<F>(callback: F, completion: Completion) -> Self
    where
        F: FnOnce(&dyn Engine) -> std::result::Result<Value, ScriptError> + Send + 'static,
    {
        Self::new(ActionPayload::Exec(Box::new(callback)), completion)
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }
}

enum Sink {
    Channel(oneshot::Sender<ActionResult>),
    Callback(Box<dyn FnOnce(ActionResult) + Send>),
}

/// Single-use result sink.
///
/// The first call to [`Completion::complete`] delivers the result; later
/// calls are no-ops. A completion dropped without firing fires itself with
/// [`Error::ContextGone`].
pub struct Completion {
    sink: Option<Sink>,
    context: ContextId,
}

impl Completion {
    /// A completion paired with a receiver to await.
    pub fn channel() -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            sink: Some(Sink::Channel(tx)),
            context: ContextId::Main,
        };
        (completion, CompletionReceiver { rx })
    }

    /// A completion that invokes `callback` with the result.
    pub fn callback(callback: impl FnOnce(ActionResult) + Send + 'static) -> Self {
        Self {
            sink: Some(Sink::Callback(Box::new(callback))),
            context: ContextId::Main,
        }
    }

    /// Record which context owns this completion, for the drop error.
    pub(crate) fn bind(&mut self, context: ContextId) {
        self.context = context;
    }

    /// Deliver `result`. Returns `false` if the completion had already fired.
    pub fn complete(&mut self, result: ActionResult) -> bool {
        match self.sink.take() {
            Some(Sink::Channel(tx)) => {
                // A host that stopped listening is not our failure.
                let _ = tx.send(result);
                true
            }
            Some(Sink::Callback(callback)) => {
                callback(result);
                true
            }
            None => {
                tracing::warn!(
                    "Ignoring second completion of an action on context {}",
                    self.context
                );
                false
            }
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.sink.is_none()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("context", &self.context)
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.sink.is_some() {
            let context = self.context;
            self.complete(Err(Error::ContextGone(context)));
        }
    }
}

/// Receiving half of [`Completion::channel`].
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: oneshot::Receiver<ActionResult>,
}

impl CompletionReceiver {
    pub async fn wait(self) -> ActionResult {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Error::ContextGone(ContextId::Main)))
    }
}
