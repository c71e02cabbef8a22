//! Action dispatch.
//!
//! Submission never runs an action inline. The host hands an [`Action`] to a
//! [`ContextHandle`](crate::ContextHandle), which only queues it; the context
//! thread then spawns the body as a local task that yields once before doing
//! any work, so actions on one context interleave at their suspension points
//! and no submission waits on another action's execution.
//!
//! Every action's [`Completion`] fires exactly once: on success, on failure,
//! on timeout, on panic, and when the action is rejected or discarded.

mod action;
mod pending;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use futures::FutureExt;

pub use action::{
    Action, ActionKind, ActionPayload, ActionResult, Completion, CompletionReceiver, ExecFn,
};
pub use pending::{ActionId, PendingActions};

use crate::context::{ContextCore, LifecycleState};
use crate::error::Error;

/// Schedule `action` on the context that owns `core`.
pub(crate) fn accept(core: &Rc<ContextCore>, mut action: Action) {
    action.completion.bind(core.id);

    let state = core.lifecycle.state();
    if state != LifecycleState::Active {
        tracing::warn!(
            "Rejecting {} action submitted to context {} while {}",
            action.kind(),
            core.id,
            state
        );
        action.completion.complete(Err(Error::InactiveContext {
            context: core.id,
            state,
        }));
        return;
    }

    let kind = action.kind();
    let id = core.pending.add(kind);
    let core = core.clone();

    tokio::task::spawn_local(async move {
        tokio::task::yield_now().await;

        let Action {
            payload,
            mut completion,
        } = action;

        let body = AssertUnwindSafe(core.execute(payload)).catch_unwind();
        let outcome = match core.action_timeout {
            Some(after) => match tokio::time::timeout(after, body).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(Error::Timeout { kind, after })),
            },
            None => body.await,
        };

        let result = outcome.unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            tracing::error!("{} action on context {} panicked: {}", kind, core.id, message);
            Err(Error::Evaluation(format!("action panicked: {}", message)))
        });

        // The host may read the in-flight count as soon as it hears back.
        core.pending.remove(id);
        completion.complete(result);
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
