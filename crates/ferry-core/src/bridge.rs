//! The embedding entry point: a main context plus its workers.

use std::sync::Arc;

use serde_json::Value;

use crate::config::BridgeConfig;
use crate::context::{ContextHandle, ContextId, ContextSpawner, ContextUnit};
use crate::engine::{ContextInit, EngineFactory, NoPreprocess, Preprocess};
use crate::error::Result;
use crate::loader::{MemoryLoader, ModuleLoader};
use crate::output::{OutputSink, StdioSink};
use crate::registry::{WorkerId, WorkerRegistry};

/// Builder for a [`Bridge`].
pub struct BridgeBuilder {
    factory: Arc<dyn EngineFactory>,
    loader: Arc<dyn ModuleLoader>,
    sink: Arc<dyn OutputSink>,
    preprocess: Arc<dyn Preprocess>,
    config: BridgeConfig,
}

impl BridgeBuilder {
    /// Where imports are fetched from. Defaults to an empty [`MemoryLoader`].
    pub fn loader(mut self, loader: impl ModuleLoader) -> Self {
        self.loader = Arc::new(loader);
        self
    }

    /// Where context output goes. Defaults to [`StdioSink`].
    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Source transform applied to every `Eval` payload.
    pub fn preprocess(mut self, preprocess: impl Preprocess) -> Self {
        self.preprocess = Arc::new(preprocess);
        self
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the main context and wait until it is ready.
    pub async fn start(self) -> Result<Bridge> {
        let init = ContextInit {
            id: ContextId::Main,
            kind: ContextId::Main.kind(),
            argv: self.config.main_argv.clone(),
            payload: self.config.main_payload.clone(),
        };
        let spawner = Arc::new(ContextSpawner {
            factory: self.factory,
            loader: self.loader,
            preprocess: self.preprocess,
            sink: self.sink,
            config: self.config,
        });

        let (main, unit) = spawner.spawn(init).await?;
        tracing::debug!("Bridge started");
        Ok(Bridge {
            main,
            unit,
            workers: WorkerRegistry::new(spawner),
        })
    }
}

/// A running main context and the workers spawned for it.
pub struct Bridge {
    main: ContextHandle,
    unit: ContextUnit,
    workers: WorkerRegistry,
}

impl Bridge {
    pub fn builder(factory: impl EngineFactory) -> BridgeBuilder {
        BridgeBuilder {
            factory: Arc::new(factory),
            loader: Arc::new(MemoryLoader::new()),
            sink: Arc::new(StdioSink),
            preprocess: Arc::new(NoPreprocess),
            config: BridgeConfig::default(),
        }
    }

    /// The main context.
    pub fn main(&self) -> &ContextHandle {
        &self.main
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub async fn spawn_worker(&self, argv: Vec<String>, payload: Value) -> Result<WorkerId> {
        self.workers.spawn(argv, payload).await
    }

    /// Handle for a registered worker.
    pub fn worker(&self, id: WorkerId) -> Option<ContextHandle> {
        self.workers.context(id)
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.ids()
    }

    pub async fn stop_worker(&self, id: WorkerId) -> Result<()> {
        self.workers.stop(id).await
    }

    pub async fn stop_all(&self) -> Result<()> {
        self.workers.stop_all().await
    }

    /// Stop every worker, then drain and terminate the main context.
    pub async fn shutdown(self) -> Result<()> {
        let workers = self.workers.stop_all().await;
        self.main.stop().await?;
        self.unit.reap().await;
        tracing::debug!("Bridge shut down");
        workers
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;
    use futures::future::BoxFuture;

    use super::*;
    use crate::context::LifecycleState;
    use crate::dispatch::{Action, Completion};
    use crate::error::Error;
    use crate::output::{CaptureSink, OutputStream};
    use crate::testing::{self, DelayedLoader, Log};

    async fn start(loader: impl ModuleLoader, log: Log, sink: Arc<CaptureSink>) -> Bridge {
        Bridge::builder(testing::factory(log))
            .loader(loader)
            .sink(sink)
            .start()
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_many_evals_complete_once_each() {
        let bridge = start(MemoryLoader::new(), Log::default(), Arc::new(CaptureSink::new())).await;

        let results = futures::future::join_all(
            (0..50).map(|i| bridge.main().eval(format!("{}+1", i))),
        )
        .await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i as i64 + 1);
        }
        assert_eq!(bridge.main().in_flight(), 0);

        bridge.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_import_evaluates_once() {
        let log = Log::default();
        let loader = MemoryLoader::new().with_module("side", "log side effect");
        let bridge = start(loader, log.clone(), Arc::new(CaptureSink::new())).await;

        bridge.main().import("side").await.unwrap();
        bridge.main().import("side").await.unwrap();
        bridge.main().eval("import side").await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["side effect".to_string()]);

        bridge.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_action_errors_leave_context_active() {
        let loader = MemoryLoader::new().with_module("dep", "export x");
        let bridge = start(loader, Log::default(), Arc::new(CaptureSink::new())).await;
        let main = bridge.main();

        assert!(matches!(main.eval("1 +").await, Err(Error::Evaluation(_))));
        assert!(matches!(main.eval("throw up").await, Err(Error::Evaluation(ref m)) if m == "up"));
        assert!(matches!(main.import("nowhere").await, Err(Error::Resolution { .. })));
        assert!(matches!(main.load("missing").await, Err(Error::NotFound(_))));
        assert!(matches!(main.eval_module("use dep: y").await, Err(Error::Link { .. })));
        assert!(matches!(main.eval("import nowhere").await, Err(Error::Evaluation(_))));

        assert_eq!(main.state(), LifecycleState::Active);
        assert_eq!(main.eval("1+1").await.unwrap(), 2);

        bridge.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_eval_module_with_dynamic_import() {
        let log = Log::default();
        let loader = MemoryLoader::new().with_module("lazy", "export x\nlog lazy loaded");
        let bridge = start(loader, log.clone(), Arc::new(CaptureSink::new())).await;

        bridge
            .main()
            .eval_module("dynamic lazy\nlog after")
            .await
            .unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["lazy loaded".to_string(), "after".to_string()]
        );

        bridge.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exec_reads_engine_state() {
        let bridge = start(MemoryLoader::new(), Log::default(), Arc::new(CaptureSink::new())).await;
        bridge.main().load("setup").await.unwrap();

        let len = bridge
            .main()
            .exec(|engine| Ok(engine.global("log_len").unwrap_or(Value::Null)))
            .await
            .unwrap();
        assert_eq!(len, 1);

        bridge.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_waits_for_in_flight_actions() {
        let bridge = start(MemoryLoader::new(), Log::default(), Arc::new(CaptureSink::new())).await;
        let main = bridge.main().clone();

        let (completion, rx) = Completion::channel();
        main.dispatch(Action::exec(
            |_| {
                std::thread::sleep(Duration::from_millis(50));
                Ok(Value::from("slow"))
            },
            completion,
        ))
        .unwrap();

        main.stop().await.unwrap();
        assert_eq!(main.state(), LifecycleState::Terminated);
        assert_eq!(main.in_flight(), 0);
        assert_eq!(rx.wait().await.unwrap(), "slow");

        // Idempotent, and everything after is rejected.
        main.stop().await.unwrap();
        assert!(matches!(
            main.eval("1").await,
            Err(Error::InactiveContext {
                state: LifecycleState::Terminated,
                ..
            })
        ));

        bridge.shutdown().await.unwrap();
    }

    struct HangingLoader;

    impl ModuleLoader for HangingLoader {
        fn fetch<'a>(
            &'a self,
            _specifier: &'a str,
        ) -> BoxFuture<'a, Result<crate::loader::ModuleSource>> {
            futures::future::pending().boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_action_timeout() {
        let config = BridgeConfig {
            action_timeout_ms: Some(20),
            ..BridgeConfig::default()
        };
        let bridge = Bridge::builder(testing::factory(Log::default()))
            .loader(HangingLoader)
            .sink(Arc::new(CaptureSink::new()))
            .config(config)
            .start()
            .await
            .unwrap();

        let main = bridge.main();
        let err = main.import("never").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                kind: crate::dispatch::ActionKind::ImportAsync,
                ..
            }
        ));
        assert_eq!(main.eval("2+2").await.unwrap(), 4);
        assert_eq!(main.in_flight(), 0);

        bridge.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_import_settles_its_modules() {
        let loader = DelayedLoader::new(
            MemoryLoader::new()
                .with_module("a", "use slow: x")
                .with_module("b", "use slow: x\nlog b")
                .with_module("slow", "export x"),
        )
        .delay("slow", &[300]);
        let config = BridgeConfig {
            action_timeout_ms: Some(100),
            ..BridgeConfig::default()
        };
        let log = Log::default();
        let bridge = Bridge::builder(testing::factory(log.clone()))
            .loader(loader)
            .sink(Arc::new(CaptureSink::new()))
            .config(config)
            .start()
            .await
            .unwrap();
        let main = bridge.main();

        assert!(matches!(main.import("a").await, Err(Error::Timeout { .. })));
        // The cancelled link is reported as such, not as a module stuck linking.
        assert!(matches!(
            main.import("a").await,
            Err(Error::Resolution { ref message, .. }) if message.contains("cancelled")
        ));
        main.import("b").await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["b".to_string()]);
        assert_eq!(main.state(), LifecycleState::Active);

        bridge.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_workers_are_isolated() {
        let sink = Arc::new(CaptureSink::new());
        let log = Log::default();
        let loader = MemoryLoader::new().with_module("side", "log once per context");
        let bridge = start(loader, log.clone(), sink.clone()).await;

        let a = bridge.spawn_worker(Vec::new(), Value::Null).await.unwrap();
        let b = bridge.spawn_worker(Vec::new(), Value::Null).await.unwrap();
        assert_eq!(bridge.worker_ids(), vec![a, b]);

        bridge.worker(a).unwrap().import("side").await.unwrap();
        bridge.worker(b).unwrap().import("side").await.unwrap();
        bridge.main().import("side").await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 3);

        bridge.stop_worker(a).await.unwrap();
        bridge.stop_worker(a).await.unwrap();
        assert_eq!(bridge.worker_ids(), vec![b]);

        bridge.shutdown().await.unwrap();
        assert_eq!(
            sink.text(a.context_id(), OutputStream::Stdout),
            "once per context\n"
        );
        assert_eq!(sink.text(ContextId::Main, OutputStream::Stdout), "once per context\n");
    }
}
