//! The context thread: engine setup, event loop and action bodies.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;

use super::{ContextHandle, ContextId, ContextMessage, Lifecycle, LifecycleState};
use crate::config::BridgeConfig;
use crate::dispatch::{self, ActionPayload, ActionResult, PendingActions};
use crate::engine::{ContextInit, Engine, EngineFactory, Preprocess, ScriptError};
use crate::error::{Error, Result};
use crate::linker::ModuleLinker;
use crate::loader::ModuleLoader;
use crate::output::{self, ContextOutput, OutputChunk, OutputSink};
use crate::shutdown::ShutdownCoordinator;

/// Everything a context thread owns.
pub(crate) struct ContextCore {
    pub(crate) id: ContextId,
    pub(crate) engine: Rc<dyn Engine>,
    pub(crate) linker: ModuleLinker,
    pub(crate) pending: PendingActions,
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) output: ContextOutput,
    pub(crate) action_timeout: Option<Duration>,
    preprocess: Arc<dyn Preprocess>,
    anonymous_modules: Cell<u64>,
}

impl ContextCore {
    /// Run one action body to its result.
    pub(crate) async fn execute(&self, payload: ActionPayload) -> ActionResult {
        match payload {
            ActionPayload::Eval(code) => self.eval(&code),
            ActionPayload::EvalModule(source) => {
                self.eval_module(&source).await.map(|()| Value::Null)
            }
            ActionPayload::Load(name) => self.load(&name).map(|()| Value::Null),
            ActionPayload::ImportAsync(specifier) => {
                self.import(&specifier).await.map(|()| Value::Null)
            }
            ActionPayload::Exec(callback) => {
                callback(self.engine.as_ref()).map_err(|e| Error::Evaluation(e.to_string()))
            }
        }
    }

    fn eval(&self, code: &str) -> Result<Value> {
        let source = self
            .preprocess
            .preprocess(code)
            .map_err(|e| Error::Evaluation(e.to_string()))?;
        self.engine
            .eval_script(&source, &self.linker)
            .map_err(|e| Error::Evaluation(e.to_string()))
    }

    async fn eval_module(&self, source: &str) -> Result<()> {
        let n = self.anonymous_modules.get();
        self.anonymous_modules.set(n + 1);
        let identifier = format!("ferry:{}/module-{}", self.id, n);

        let record = self.linker.compile_anonymous(&identifier, source)?;
        self.linker.link(&record).await?;
        self.linker.evaluate(&record)
    }

    fn load(&self, name: &str) -> Result<()> {
        self.engine.load(name, &self.linker).map_err(|e| match e {
            ScriptError::NotFound(name) => Error::NotFound(name),
            other => Error::Evaluation(other.to_string()),
        })
    }

    async fn import(&self, specifier: &str) -> Result<()> {
        let record = self.linker.resolve(specifier).await?;
        self.linker.link(&record).await?;
        self.linker.evaluate(&record)
    }
}

/// The OS thread and output forwarder backing a context.
pub(crate) struct ContextUnit {
    id: ContextId,
    thread: JoinHandle<()>,
    forwarder: tokio::task::JoinHandle<()>,
}

impl ContextUnit {
    /// Wait for the thread to exit and its output to be fully forwarded.
    pub(crate) async fn reap(self) {
        let id = self.id;
        let thread = self.thread;
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::error!("Context {} thread panicked", id),
            Err(e) => tracing::warn!("Failed to join context {} thread: {}", id, e),
        }
        if let Err(e) = self.forwarder.await {
            tracing::warn!("Output forwarder of context {} failed: {}", id, e);
        }
        tracing::debug!("Context {} reaped", id);
    }

    /// Give up on a context that never became ready.
    ///
    /// Its output is discarded from here on. The thread notices the dropped
    /// handshake and exits on its own, so it is left detached.
    fn abandon(self) {
        self.forwarder.abort();
        tracing::debug!("Abandoned context {}", self.id);
    }
}

/// Creates contexts. Shared by the bridge and the worker registry.
pub(crate) struct ContextSpawner {
    pub(crate) factory: Arc<dyn EngineFactory>,
    pub(crate) loader: Arc<dyn ModuleLoader>,
    pub(crate) preprocess: Arc<dyn Preprocess>,
    pub(crate) sink: Arc<dyn OutputSink>,
    pub(crate) config: BridgeConfig,
}

impl ContextSpawner {
    /// Start a context thread and wait for its ready handshake.
    pub(crate) async fn spawn(&self, init: ContextInit) -> Result<(ContextHandle, ContextUnit)> {
        let id = init.id;
        let lifecycle = Arc::new(Lifecycle::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let forwarder = output::forward(id, out_rx, self.sink.clone());

        let thread = std::thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_name_prefix, id))
            .spawn({
                let setup = ThreadSetup {
                    init,
                    factory: self.factory.clone(),
                    loader: self.loader.clone(),
                    preprocess: self.preprocess.clone(),
                    lifecycle: lifecycle.clone(),
                    action_timeout: self.config.action_timeout(),
                };
                move || setup.run(rx, out_tx, ready_tx)
            })
            .map_err(|e| Error::Spawn(format!("failed to start thread for {}: {}", id, e)))?;

        let unit = ContextUnit {
            id,
            thread,
            forwarder,
        };

        let timeout = self.config.spawn_timeout();
        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                tracing::debug!("Context {} ready", id);
                Ok((ContextHandle::new(id, tx, lifecycle), unit))
            }
            Ok(Ok(Err(message))) => {
                unit.reap().await;
                Err(Error::Spawn(format!("{}: {}", id, message)))
            }
            Ok(Err(_)) => {
                unit.reap().await;
                Err(Error::Spawn(format!("{} exited before becoming ready", id)))
            }
            Err(_) => {
                unit.abandon();
                Err(Error::Spawn(format!(
                    "{} not ready after {}ms",
                    id,
                    timeout.as_millis()
                )))
            }
        }
    }
}

struct ThreadSetup {
    init: ContextInit,
    factory: Arc<dyn EngineFactory>,
    loader: Arc<dyn ModuleLoader>,
    preprocess: Arc<dyn Preprocess>,
    lifecycle: Arc<Lifecycle>,
    action_timeout: Option<Duration>,
}

impl ThreadSetup {
    fn run(
        self,
        rx: mpsc::UnboundedReceiver<ContextMessage>,
        out_tx: mpsc::UnboundedSender<OutputChunk>,
        ready: oneshot::Sender<std::result::Result<(), String>>,
    ) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = ready.send(Err(format!("failed to build runtime: {}", e)));
                return;
            }
        };

        let local = LocalSet::new();
        local.block_on(&runtime, async move {
            let id = self.init.id;
            let output = ContextOutput::new(out_tx);

            let engine: Rc<dyn Engine> = match self.factory.create(&self.init, output.clone()) {
                Ok(engine) => Rc::from(engine),
                Err(e) => {
                    let _ = ready.send(Err(format!("engine failed to start: {}", e)));
                    return;
                }
            };

            let core = Rc::new(ContextCore {
                id,
                linker: ModuleLinker::new(id, engine.clone(), self.loader),
                engine,
                pending: PendingActions::new(self.lifecycle.clone()),
                lifecycle: self.lifecycle,
                output,
                action_timeout: self.action_timeout,
                preprocess: self.preprocess,
                anonymous_modules: Cell::new(0),
            });

            core.lifecycle.advance(LifecycleState::Active);
            if ready.send(Ok(())).is_err() {
                tracing::warn!("Host stopped waiting for context {}; shutting it down", id);
                ShutdownCoordinator::new(core, Vec::new()).run(rx).await;
                return;
            }

            event_loop(core, rx).await;
        });
    }
}

/// Accept actions until a stop signal arrives or every handle is gone.
async fn event_loop(core: Rc<ContextCore>, mut rx: mpsc::UnboundedReceiver<ContextMessage>) {
    let mut acks = Vec::new();
    loop {
        match rx.recv().await {
            Some(ContextMessage::Action(action)) => dispatch::accept(&core, action),
            Some(ContextMessage::Stop { ack }) => {
                acks.push(ack);
                break;
            }
            None => {
                tracing::debug!("All handles to context {} dropped", core.id);
                break;
            }
        }
    }
    ShutdownCoordinator::new(core, acks).run(rx).await;
}
