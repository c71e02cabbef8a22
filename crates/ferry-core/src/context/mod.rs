//! Execution contexts.
//!
//! A context wraps one engine instance on its own thread. The host talks to
//! it through a [`ContextHandle`]; everything on the far side (engine,
//! module cache, in-flight table) is owned by the context thread alone.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──handshake──▶ Active ──stop──▶ Draining ──in-flight = 0,
//!                                                     streams closed──▶ Terminated
//! ```
//!
//! No transition skips a state and none goes backwards.

mod runner;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::dispatch::{Action, ActionPayload, Completion};
use crate::engine::{Engine, ScriptError};
use crate::error::{Error, Result};

pub(crate) use runner::{ContextCore, ContextSpawner, ContextUnit};

/// Identifier of a context, unique within a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContextId {
    Main,
    Worker(u64),
}

impl ContextId {
    pub fn kind(&self) -> ContextKind {
        match self {
            ContextId::Main => ContextKind::Main,
            ContextId::Worker(_) => ContextKind::Worker,
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextId::Main => f.write_str("main"),
            ContextId::Worker(id) => write!(f, "worker:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Main,
    Worker,
}

/// Where a context is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifecycleState {
    Created,
    Active,
    Draining,
    Terminated,
}

impl LifecycleState {
    /// The only state a transition into `self` may start from.
    pub fn predecessor(self) -> Option<LifecycleState> {
        match self {
            LifecycleState::Created => None,
            LifecycleState::Active => Some(LifecycleState::Created),
            LifecycleState::Draining => Some(LifecycleState::Active),
            LifecycleState::Terminated => Some(LifecycleState::Draining),
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Created,
            1 => LifecycleState::Active,
            2 => LifecycleState::Draining,
            _ => LifecycleState::Terminated,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Active => "active",
            LifecycleState::Draining => "draining",
            LifecycleState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Lifecycle state and in-flight count, shared between a context and its handles.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    in_flight: AtomicUsize,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Created as u8),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` if the current state is its predecessor.
    pub fn advance(&self, next: LifecycleState) -> bool {
        let Some(from) = next.predecessor() else {
            return false;
        };
        self.state
            .compare_exchange(from as u8, next as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_flight(&self, count: usize) {
        self.in_flight.store(count, Ordering::Release);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Messages a context thread receives.
pub(crate) enum ContextMessage {
    Action(Action),
    Stop { ack: oneshot::Sender<()> },
}

/// Host-side handle to a context.
///
/// Cheap to clone and safe to use from any thread. Dropping every handle to
/// a context acts as a stop signal.
#[derive(Clone)]
pub struct ContextHandle {
    id: ContextId,
    tx: mpsc::UnboundedSender<ContextMessage>,
    lifecycle: Arc<Lifecycle>,
}

impl ContextHandle {
    pub(crate) fn new(
        id: ContextId,
        tx: mpsc::UnboundedSender<ContextMessage>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self { id, tx, lifecycle }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.id.kind()
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Number of actions the context is currently running.
    pub fn in_flight(&self) -> usize {
        self.lifecycle.in_flight()
    }

    /// Hand an action to the context without waiting for it to run.
    ///
    /// Fails with [`Error::InactiveContext`] once the context has left
    /// `Active`; the action's completion fires with the same error.
    pub fn dispatch(&self, mut action: Action) -> Result<()> {
        action.completion.bind(self.id);

        let state = self.lifecycle.state();
        if state != LifecycleState::Active {
            action.completion.complete(Err(self.inactive(state)));
            return Err(self.inactive(state));
        }

        // A closed channel drops the action, and its completion reports the context gone.
        self.tx
            .send(ContextMessage::Action(action))
            .map_err(|_| Error::ContextGone(self.id))
    }

    fn inactive(&self, state: LifecycleState) -> Error {
        Error::InactiveContext {
            context: self.id,
            state,
        }
    }

    /// Dispatch `payload` and wait for its completion.
    pub async fn submit(&self, payload: ActionPayload) -> Result<Value> {
        let (completion, rx) = Completion::channel();
        self.dispatch(Action::new(payload, completion))?;
        rx.wait().await
    }

    /// Evaluate a script, returning its completion value.
    pub async fn eval(&self, code: impl Into<String>) -> Result<Value> {
        self.submit(ActionPayload::Eval(code.into())).await
    }

    /// Evaluate module source, including everything it imports.
    pub async fn eval_module(&self, source: impl Into<String>) -> Result<()> {
        self.submit(ActionPayload::EvalModule(source.into()))
            .await
            .map(drop)
    }

    /// Run a named script through the engine's own lookup.
    pub async fn load(&self, name: impl Into<String>) -> Result<()> {
        self.submit(ActionPayload::Load(name.into())).await.map(drop)
    }

    /// Import a module for its side effects.
    pub async fn import(&self, specifier: impl Into<String>) -> Result<()> {
        self.submit(ActionPayload::ImportAsync(specifier.into()))
            .await
            .map(drop)
    }

    /// Run `callback` on the context thread with access to the engine.
    pub async fn exec<F>(&self, callback: F) -> Result<Value>
    where
        F: FnOnce(&dyn Engine) -> std::result::Result<Value, ScriptError> + Send + 'static,
    {
        self.submit(ActionPayload::Exec(Box::new(callback))).await
    }

    /// Ask the context to drain and terminate, and wait until it has.
    ///
    /// Idempotent: every caller receives the one terminal acknowledgement,
    /// and stopping a terminated context returns at once.
    pub async fn stop(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self.tx.send(ContextMessage::Stop { ack }).is_err() {
            tracing::debug!("Context {} already terminated", self.id);
            return Ok(());
        }
        if done.await.is_err() {
            tracing::debug!("Context {} went away without acknowledging stop", self.id);
        }
        Ok(())
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_walks_forward_only() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Created);

        // No skipping.
        assert!(!lifecycle.advance(LifecycleState::Draining));
        assert!(!lifecycle.advance(LifecycleState::Terminated));

        assert!(lifecycle.advance(LifecycleState::Active));
        assert!(lifecycle.advance(LifecycleState::Draining));
        // Shutdown is one-way.
        assert!(!lifecycle.advance(LifecycleState::Active));
        assert!(lifecycle.advance(LifecycleState::Terminated));
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    }

    #[test]
    fn test_context_id_display() {
        assert_eq!(ContextId::Main.to_string(), "main");
        assert_eq!(ContextId::Worker(12).to_string(), "worker:12");
        assert_eq!(ContextId::Worker(1).kind(), ContextKind::Worker);
    }

    #[tokio::test]
    async fn test_dispatch_rejected_before_active() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ContextHandle::new(ContextId::Worker(4), tx, Arc::new(Lifecycle::new()));

        let (completion, rx) = Completion::channel();
        let err = handle.dispatch(Action::eval("1", completion)).unwrap_err();
        assert!(matches!(
            err,
            Error::InactiveContext {
                state: LifecycleState::Created,
                ..
            }
        ));
        assert!(matches!(
            rx.wait().await,
            Err(Error::InactiveContext { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_to_dead_context() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.advance(LifecycleState::Active);
        let handle = ContextHandle::new(ContextId::Main, tx, lifecycle);

        let err = handle.eval("1").await.unwrap_err();
        assert!(matches!(err, Error::ContextGone(ContextId::Main)));
        // Stopping a context that is gone is a no-op.
        handle.stop().await.unwrap();
    }
}
