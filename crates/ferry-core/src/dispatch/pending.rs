//! Table of in-flight actions for one context.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::Notify;

use super::ActionKind;
use crate::context::Lifecycle;

/// Identifier of an in-flight action, unique within its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

/// Counted pending-operation table.
///
/// Owned by the context thread. The count is mirrored into the shared
/// [`Lifecycle`] so the host can observe it.
pub struct PendingActions {
    entries: RefCell<FxHashMap<ActionId, ActionKind>>,
    next_id: Cell<u64>,
    changed: Notify,
    lifecycle: Arc<Lifecycle>,
}

impl PendingActions {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            entries: RefCell::new(FxHashMap::default()),
            next_id: Cell::new(0),
            changed: Notify::new(),
            lifecycle,
        }
    }

    pub fn add(&self, kind: ActionKind) -> ActionId {
        let id = ActionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let mut entries = self.entries.borrow_mut();
        entries.insert(id, kind);
        self.lifecycle.set_in_flight(entries.len());
        id
    }

    pub fn remove(&self, id: ActionId) {
        let mut entries = self.entries.borrow_mut();
        if entries.remove(&id).is_none() {
            tracing::warn!("Removing unknown in-flight action {:?}", id);
        }
        self.lifecycle.set_in_flight(entries.len());
        drop(entries);
        self.changed.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// The ids in flight right now.
    pub fn snapshot(&self) -> Vec<ActionId> {
        let mut ids: Vec<_> = self.entries.borrow().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Wait until none of `ids` is in flight any more.
    pub async fn wait_for(&self, ids: &[ActionId]) {
        loop {
            // Register before checking so a removal in between is not missed.
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let remaining = {
                let entries = self.entries.borrow();
                ids.iter().filter(|id| entries.contains_key(id)).count()
            };
            if remaining == 0 {
                return;
            }
            tracing::debug!("Waiting for {} in-flight actions", remaining);
            changed.await;
        }
    }

    /// Wait until the table is empty.
    pub async fn wait_idle(&self) {
        while !self.is_empty() {
            let ids = self.snapshot();
            self.wait_for(&ids).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use std::time::Duration;

    fn table() -> Rc<PendingActions> {
        Rc::new(PendingActions::new(Arc::new(Lifecycle::new())))
    }

    #[test]
    fn test_add_remove_counts() {
        let pending = table();
        let a = pending.add(ActionKind::Eval);
        let b = pending.add(ActionKind::Load);
        assert_ne!(a, b);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.lifecycle.in_flight(), 2);

        pending.remove(a);
        assert_eq!(pending.snapshot(), vec![b]);
        pending.remove(b);
        assert!(pending.is_empty());
        assert_eq!(pending.lifecycle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_snapshot() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let pending = table();
                let a = pending.add(ActionKind::Eval);
                let b = pending.add(ActionKind::EvalModule);
                let snapshot = pending.snapshot();

                let remover = pending.clone();
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    remover.remove(a);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    remover.remove(b);
                });

                pending.wait_for(&snapshot).await;
                assert!(pending.is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn test_wait_idle_on_empty_table() {
        let pending = table();
        pending.wait_idle().await;
        assert_eq!(pending.len(), 0);
    }
}
