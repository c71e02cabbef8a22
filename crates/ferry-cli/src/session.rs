//! One bridge per CLI invocation.
//!
//! Every command starts a bridge, runs its actions, and shuts the bridge
//! down before printing results, so script output always precedes them.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::Context;
use ferry_core::{Bridge, BridgeConfig, FsLoader};
use ferry_script::{
    SCRIPT_EXTENSION, ScriptEngineFactory, ScriptLibrary, StripTypeAnnotations, display,
};
use serde_json::{Value, json};

/// Options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub config: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub root: Option<PathBuf>,
}

impl SessionOptions {
    fn bridge_config(&self, argv: Vec<String>) -> anyhow::Result<BridgeConfig> {
        let config = match &self.config {
            Some(path) => BridgeConfig::from_file(path)?,
            None => BridgeConfig::default(),
        };
        let mut config = config.with_env_overrides()?;
        if let Some(ms) = self.timeout_ms {
            config.action_timeout_ms = (ms > 0).then_some(ms);
        }
        config.main_argv = argv;
        Ok(config)
    }
}

pub struct Session {
    bridge: Bridge,
}

impl Session {
    pub async fn start(options: &SessionOptions, argv: Vec<String>) -> anyhow::Result<Self> {
        let root = options.root.clone().unwrap_or_else(|| PathBuf::from("."));
        let config = options.bridge_config(argv)?;
        tracing::debug!("Starting bridge with root {}", root.display());

        let bridge = Bridge::builder(ScriptEngineFactory::new(
            ScriptLibrary::new().with_root(&root),
        ))
        .loader(FsLoader::new(&root).with_extension(SCRIPT_EXTENSION))
        .preprocess(StripTypeAnnotations)
        .config(config)
        .start()
        .await?;

        Ok(Self { bridge })
    }

    /// Evaluate `code` in the main context and print a non-null result.
    pub async fn eval(self, code: String) -> anyhow::Result<()> {
        let result = interruptible(self.bridge.main().eval(code)).await;
        let value = self.finish(result).await?;
        if !value.is_null() {
            println!("{}", display(&value));
        }
        Ok(())
    }

    pub async fn eval_module(self, source: String) -> anyhow::Result<()> {
        let result = interruptible(self.bridge.main().eval_module(source)).await;
        self.finish(result).await
    }

    pub async fn import(self, specifier: String) -> anyhow::Result<()> {
        let result = interruptible(self.bridge.main().import(specifier)).await;
        self.finish(result).await
    }

    pub async fn load(self, name: String) -> anyhow::Result<()> {
        let result = interruptible(self.bridge.main().load(name)).await;
        self.finish(result).await
    }

    /// Run `code` once in each of `count` fresh workers.
    ///
    /// Worker `i` sees `argv == [i]` and `init == {"index": i}`. Prints one
    /// line per worker; fails with the first worker error, if any.
    pub async fn workers(self, code: String, count: usize) -> anyhow::Result<()> {
        let result = interruptible(self.run_workers(code, count)).await;
        let outcomes = self.finish(result).await?;

        let mut first_error = None;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(value) => println!("{}: {}", id.context_id(), display(&value)),
                Err(e) => {
                    eprintln!("{}: {}", id.context_id(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn run_workers(
        &self,
        code: String,
        count: usize,
    ) -> ferry_core::Result<Vec<(ferry_core::WorkerId, ferry_core::Result<Value>)>> {
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let id = self
                .bridge
                .spawn_worker(vec![index.to_string()], json!({ "index": index }))
                .await?;
            if let Some(handle) = self.bridge.worker(id) {
                workers.push((id, handle));
            }
        }

        let results = futures::future::join_all(
            workers.iter().map(|(_, handle)| handle.eval(code.clone())),
        )
        .await;
        self.bridge.stop_all().await?;

        Ok(workers.into_iter().map(|(id, _)| id).zip(results).collect())
    }

    /// Shut the bridge down, then hand back the command's own result.
    async fn finish<T>(self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        let shutdown = self.bridge.shutdown().await;
        let value = result?;
        shutdown?;
        Ok(value)
    }
}

/// Evaluate the module file at `path`. Imports resolve next to the file
/// unless a root was given.
pub async fn run_module(
    options: &SessionOptions,
    path: &Path,
    argv: Vec<String>,
) -> anyhow::Result<()> {
    let source = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read module {}", path.display()))?;

    let mut options = options.clone();
    if options.root.is_none() {
        options.root = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf);
    }

    let session = Session::start(&options, argv).await?;
    session.eval_module(source).await
}

/// Run `action` until it finishes or the user presses Ctrl-C.
async fn interruptible<T>(
    action: impl Future<Output = ferry_core::Result<T>>,
) -> anyhow::Result<T> {
    tokio::select! {
        result = action => Ok(result?),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::warn!("Interrupted, shutting down");
            anyhow::bail!("interrupted")
        }
    }
}
