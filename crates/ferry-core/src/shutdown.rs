//! Draining and finalizing a context.

use std::rc::Rc;

use tokio::sync::{mpsc, oneshot};

use crate::context::{ContextCore, ContextMessage, LifecycleState};
use crate::dispatch;

/// Runs the shutdown sequence of one context, on that context's thread.
///
/// 1. Flip the lifecycle to `Draining`; dispatch now fails fast.
/// 2. Wait for the actions in flight when the signal arrived. Actions that
///    still reach the context are rejected, not absorbed.
/// 3. Close the output and error streams.
/// 4. Move to `Terminated` and acknowledge every stop request once.
pub(crate) struct ShutdownCoordinator {
    core: Rc<ContextCore>,
    acks: Vec<oneshot::Sender<()>>,
}

impl ShutdownCoordinator {
    pub(crate) fn new(core: Rc<ContextCore>, acks: Vec<oneshot::Sender<()>>) -> Self {
        Self { core, acks }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ContextMessage>) {
        let id = self.core.id;
        if !self.core.lifecycle.advance(LifecycleState::Draining) {
            tracing::warn!(
                "Context {} asked to drain while {}",
                id,
                self.core.lifecycle.state()
            );
        }

        let snapshot = self.core.pending.snapshot();
        tracing::debug!("Draining context {} ({} in flight)", id, snapshot.len());

        {
            let core = self.core.clone();
            let drained = core.pending.wait_for(&snapshot);
            tokio::pin!(drained);
            let mut open = true;
            loop {
                tokio::select! {
                    _ = &mut drained => break,
                    message = rx.recv(), if open => match message {
                        Some(message) => self.handle_late(message),
                        None => open = false,
                    },
                }
            }
        }

        if !self.core.pending.is_empty() {
            tracing::warn!(
                "Context {} still has {} actions in flight after draining",
                id,
                self.core.pending.len()
            );
        }

        self.core.output.close();

        // Nothing can reach the context after this point.
        rx.close();
        while let Ok(message) = rx.try_recv() {
            self.handle_late(message);
        }

        self.core.lifecycle.advance(LifecycleState::Terminated);
        tracing::debug!("Context {} terminated", id);

        for ack in self.acks.drain(..) {
            let _ = ack.send(());
        }
    }

    fn handle_late(&mut self, message: ContextMessage) {
        match message {
            // The context is no longer Active, so this only rejects.
            ContextMessage::Action(action) => dispatch::accept(&self.core, action),
            ContextMessage::Stop { ack } => {
                tracing::debug!("Duplicate stop signal for context {}", self.core.id);
                self.acks.push(ack);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::bridge::Bridge;
    use crate::context::LifecycleState;
    use crate::error::Error;
    use crate::loader::MemoryLoader;
    use crate::output::CaptureSink;
    use crate::testing::{self, DelayedLoader, Log};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stops_while_draining_share_one_termination() {
        let log = Log::default();
        let loader = DelayedLoader::new(MemoryLoader::new().with_module("slow", "log slow done"))
            .delay("slow", &[200]);
        let bridge = Bridge::builder(testing::factory(log.clone()))
            .loader(loader)
            .sink(Arc::new(CaptureSink::new()))
            .start()
            .await
            .unwrap();
        let main = bridge.main().clone();

        let import = tokio::spawn({
            let main = main.clone();
            async move { main.import("slow").await }
        });
        while main.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stops: Vec<_> = (0..2)
            .map(|_| {
                let main = main.clone();
                tokio::spawn(async move { main.stop().await })
            })
            .collect();
        while main.state() == LifecycleState::Active {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Still draining the import: new work is turned away.
        assert_eq!(main.state(), LifecycleState::Draining);
        assert!(matches!(
            main.eval("1+1").await,
            Err(Error::InactiveContext {
                state: LifecycleState::Draining,
                ..
            })
        ));

        for stop in stops {
            stop.await.unwrap().unwrap();
        }
        import.await.unwrap().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["slow done".to_string()]);
        assert_eq!(main.state(), LifecycleState::Terminated);
        assert_eq!(main.in_flight(), 0);

        // A stop after termination returns at once.
        main.stop().await.unwrap();
        bridge.shutdown().await.unwrap();
    }
}
