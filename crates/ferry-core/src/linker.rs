//! Per-context module cache and the link/evaluate walk over it.
//!
//! A [`ModuleLinker`] belongs to exactly one context and never leaves its
//! thread. Each specifier maps to one [`ModuleRecord`]; once a record is in
//! the cache, later resolutions return that same record, so a module is
//! compiled and evaluated at most once per context.
//!
//! Linking is asynchronous because it may fetch sources; evaluation is
//! synchronous and only ever reads the cache. Literal dynamic imports are
//! reported by the engine at compile time and resolved during linking, so by
//! the time a module body runs every module it can reach is already cached.
//!
//! Actions on one context may link at the same time. A walk that reaches a
//! record another walk is linking waits for it to settle instead of taking a
//! lock for the whole graph.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;

use crate::context::ContextId;
use crate::engine::{CompiledModule, Engine, ModuleHandle, ModuleHost, ModuleRequest, ScriptError};
use crate::error::{Error, Result};
use crate::loader::ModuleLoader;

/// Where a module record is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Unlinked,
    Linking,
    Linked,
    Evaluating,
    Evaluated,
    Failed,
}

impl ModuleState {
    fn rank(self) -> u8 {
        match self {
            ModuleState::Unlinked => 0,
            ModuleState::Linking => 1,
            ModuleState::Linked => 2,
            ModuleState::Evaluating => 3,
            ModuleState::Evaluated => 4,
            ModuleState::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ModuleState::Evaluated | ModuleState::Failed)
    }

    /// Transitions only move forward; any live state may fail.
    pub fn can_advance_to(self, next: ModuleState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == ModuleState::Failed || next.rank() == self.rank() + 1
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Unlinked => "unlinked",
            ModuleState::Linking => "linking",
            ModuleState::Linked => "linked",
            ModuleState::Evaluating => "evaluating",
            ModuleState::Evaluated => "evaluated",
            ModuleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Link,
    Evaluation,
    Cancelled,
}

#[derive(Debug, Clone)]
struct Failure {
    kind: FailureKind,
    message: String,
}

/// A compiled module and how far it has progressed.
#[derive(Debug)]
pub struct ModuleRecord {
    specifier: String,
    handle: ModuleHandle,
    exports: Vec<String>,
    requests: Vec<ModuleRequest>,
    state: Cell<ModuleState>,
    failure: RefCell<Option<Failure>>,
    // The walk that moved the record into `Linking`.
    owner: Cell<Option<WalkId>>,
    link_done: Notify,
}

impl ModuleRecord {
    fn new(specifier: String, compiled: CompiledModule) -> Self {
        Self {
            specifier,
            handle: compiled.handle,
            exports: compiled.exports,
            requests: compiled.requests,
            state: Cell::new(ModuleState::Unlinked),
            failure: RefCell::new(None),
            owner: Cell::new(None),
            link_done: Notify::new(),
        }
    }

    pub fn specifier(&self) -> &str {
        &self.specifier
    }

    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    pub fn state(&self) -> ModuleState {
        self.state.get()
    }

    /// Export names as they were when the module was compiled.
    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn requests(&self) -> &[ModuleRequest] {
        &self.requests
    }

    fn advance(&self, next: ModuleState) -> bool {
        let current = self.state.get();
        if !current.can_advance_to(next) {
            tracing::warn!(
                "Ignoring module '{}' transition {} -> {}",
                self.specifier,
                current,
                next
            );
            return false;
        }
        self.state.set(next);
        if current == ModuleState::Linking {
            self.link_done.notify_waiters();
        }
        true
    }

    /// Wait until the record is no longer `Linking`.
    async fn linked(&self) {
        loop {
            let notified = self.link_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state() != ModuleState::Linking {
                return;
            }
            notified.await;
        }
    }

    fn fail(&self, kind: FailureKind, message: String) -> Error {
        if self.advance(ModuleState::Failed) {
            *self.failure.borrow_mut() = Some(Failure { kind, message });
        }
        self.failure_error()
    }

    /// The error a failed record replays to every later request.
    fn failure_error(&self) -> Error {
        let failure = self.failure.borrow().clone().unwrap_or(Failure {
            kind: FailureKind::Evaluation,
            message: "module failed".to_string(),
        });
        match failure.kind {
            FailureKind::Link => Error::Link {
                specifier: self.specifier.clone(),
                message: failure.message,
            },
            FailureKind::Evaluation => Error::Evaluation(failure.message),
            FailureKind::Cancelled => Error::Resolution {
                specifier: self.specifier.clone(),
                message: failure.message,
            },
        }
    }
}

/// Resolves specifiers to records and drives their lifecycle.
pub struct ModuleLinker {
    context: ContextId,
    engine: Rc<dyn Engine>,
    loader: Arc<dyn ModuleLoader>,
    cache: RefCell<FxHashMap<String, Rc<ModuleRecord>>>,
    compilations: Cell<usize>,
    next_walk: Cell<WalkId>,
    // Walks blocked on a record, keyed by walk, naming the walk that owns
    // the record. Never contains a cycle.
    waiting: RefCell<FxHashMap<WalkId, WalkId>>,
}

impl ModuleLinker {
    pub fn new(context: ContextId, engine: Rc<dyn Engine>, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            context,
            engine,
            loader,
            cache: RefCell::new(FxHashMap::default()),
            compilations: Cell::new(0),
            next_walk: Cell::new(0),
            waiting: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn get(&self, specifier: &str) -> Option<Rc<ModuleRecord>> {
        self.cache.borrow().get(specifier).cloned()
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.borrow().is_empty()
    }

    /// Number of modules compiled for cached specifiers.
    pub fn compilations(&self) -> usize {
        self.compilations.get()
    }

    /// Return the record for `specifier`, fetching and compiling it on first use.
    pub async fn resolve(&self, specifier: &str) -> Result<Rc<ModuleRecord>> {
        if let Some(record) = self.get(specifier) {
            return Ok(record);
        }

        let source = self.loader.fetch(specifier).await?;

        // Another action may have finished resolving the same specifier
        // while this one was fetching.
        if let Some(record) = self.get(specifier) {
            tracing::debug!(
                "Module '{}' was resolved concurrently in context {}",
                specifier,
                self.context
            );
            return Ok(record);
        }

        let compiled = self
            .engine
            .compile_module(&source.identifier, &source.text)
            .map_err(|e| Error::Resolution {
                specifier: specifier.to_string(),
                message: e.to_string(),
            })?;
        self.compilations.set(self.compilations.get() + 1);

        let record = Rc::new(ModuleRecord::new(specifier.to_string(), compiled));
        self.cache
            .borrow_mut()
            .insert(specifier.to_string(), record.clone());
        tracing::debug!(
            "Cached module '{}' as {} in context {}",
            specifier,
            record.handle,
            self.context
        );
        Ok(record)
    }

    /// Compile module source that has no specifier of its own.
    ///
    /// The record is not cached; each call compiles afresh.
    pub fn compile_anonymous(&self, identifier: &str, source: &str) -> Result<Rc<ModuleRecord>> {
        let compiled = self
            .engine
            .compile_module(identifier, source)
            .map_err(|e| Error::Evaluation(e.to_string()))?;
        Ok(Rc::new(ModuleRecord::new(identifier.to_string(), compiled)))
    }

    /// Resolve and link everything `record` depends on, then mark it linked.
    ///
    /// Several walks may run at once on one context. Dropping the returned
    /// future fails every record the walk left in `Linking`.
    pub async fn link(&self, record: &Rc<ModuleRecord>) -> Result<()> {
        let walk = LinkWalk::new(self);
        walk.link_record(record.clone()).await?;
        walk.settle_deferred(record).await
    }

    /// Whether `from`, following what each walk is waiting on, reaches `to`.
    fn waits_on(&self, from: WalkId, to: WalkId) -> bool {
        let waiting = self.waiting.borrow();
        let mut current = from;
        loop {
            if current == to {
                return true;
            }
            match waiting.get(&current) {
                Some(&next) => current = next,
                None => return false,
            }
        }
    }

    /// Evaluate a linked record, its static dependencies first.
    pub fn evaluate(&self, record: &Rc<ModuleRecord>) -> Result<()> {
        match record.state() {
            ModuleState::Linked => {}
            ModuleState::Evaluated | ModuleState::Evaluating => return Ok(()),
            ModuleState::Failed => return Err(record.failure_error()),
            state @ (ModuleState::Unlinked | ModuleState::Linking) => {
                return Err(Error::Link {
                    specifier: record.specifier().to_string(),
                    message: format!("cannot evaluate a module that is {}", state),
                });
            }
        }
        record.advance(ModuleState::Evaluating);

        for request in record.requests().iter().filter(|r| !r.dynamic) {
            let Some(dependency) = self.get(&request.specifier) else {
                continue;
            };
            if let Err(e) = self.evaluate(&dependency) {
                return Err(record.fail(FailureKind::Evaluation, evaluation_message(e)));
            }
        }

        if let Err(e) = self.engine.evaluate_module(record.handle(), self) {
            return Err(record.fail(FailureKind::Evaluation, e.to_string()));
        }

        record.advance(ModuleState::Evaluated);
        tracing::trace!("Evaluated module '{}'", record.specifier());
        Ok(())
    }
}

impl ModuleHost for ModuleLinker {
    fn import(&self, specifier: &str) -> std::result::Result<ModuleHandle, ScriptError> {
        let Some(record) = self.get(specifier) else {
            return Err(ScriptError::Import {
                specifier: specifier.to_string(),
                message: "module was not resolved before evaluation".to_string(),
            });
        };
        self.evaluate(&record).map_err(|e| ScriptError::Import {
            specifier: specifier.to_string(),
            message: evaluation_message(e),
        })?;
        Ok(record.handle())
    }
}

impl fmt::Debug for ModuleLinker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLinker")
            .field("context", &self.context)
            .field("modules", &self.len())
            .field("compilations", &self.compilations())
            .finish()
    }
}

type WalkId = u64;

/// One call to [`ModuleLinker::link`].
struct LinkWalk<'a> {
    linker: &'a ModuleLinker,
    id: WalkId,
    started: RefCell<Vec<Rc<ModuleRecord>>>,
    // Records owned by walks that were waiting on this one.
    deferred: RefCell<Vec<Rc<ModuleRecord>>>,
}

impl<'a> LinkWalk<'a> {
    fn new(linker: &'a ModuleLinker) -> Self {
        let id = linker.next_walk.get();
        linker.next_walk.set(id + 1);
        Self {
            linker,
            id,
            started: RefCell::new(Vec::new()),
            deferred: RefCell::new(Vec::new()),
        }
    }

    fn link_record(&self, record: Rc<ModuleRecord>) -> LocalBoxFuture<'_, Result<()>> {
        async move {
            match record.state() {
                ModuleState::Unlinked => {}
                ModuleState::Linking => return self.join(&record).await,
                ModuleState::Linked | ModuleState::Evaluating | ModuleState::Evaluated => {
                    return Ok(());
                }
                ModuleState::Failed => return Err(record.failure_error()),
            }
            record.advance(ModuleState::Linking);
            record.owner.set(Some(self.id));
            self.started.borrow_mut().push(record.clone());

            for request in record.requests() {
                let dependency = match self.linker.resolve(&request.specifier).await {
                    Ok(dependency) => dependency,
                    // Surfaces when the body actually performs the import.
                    Err(e) if request.dynamic => {
                        tracing::debug!(
                            "Dynamic import '{}' from '{}' left unresolved: {}",
                            request.specifier,
                            record.specifier(),
                            e
                        );
                        continue;
                    }
                    Err(e) => return Err(record.fail(FailureKind::Link, e.to_string())),
                };

                if let Err(e) = self.link_record(dependency.clone()).await {
                    if request.dynamic {
                        tracing::debug!(
                            "Dynamic import '{}' from '{}' failed to link: {}",
                            request.specifier,
                            record.specifier(),
                            e
                        );
                        continue;
                    }
                    return Err(record.fail(
                        FailureKind::Link,
                        format!("dependency '{}' failed: {}", request.specifier, e),
                    ));
                }

                if let Some(missing) = request
                    .imports
                    .iter()
                    .find(|name| !dependency.exports().contains(name))
                {
                    return Err(record.fail(
                        FailureKind::Link,
                        format!("'{}' does not export '{}'", request.specifier, missing),
                    ));
                }
            }

            record.advance(ModuleState::Linked);
            Ok(())
        }
        .boxed_local()
    }

    /// Handle a record that some walk is already linking.
    async fn join(&self, record: &Rc<ModuleRecord>) -> Result<()> {
        let owner = match record.owner.get() {
            Some(owner) if owner != self.id => owner,
            // A cycle back into this walk.
            _ => return Ok(()),
        };
        if self.linker.waits_on(owner, self.id) {
            tracing::trace!(
                "Deferring module '{}': its walk is waiting on walk {}",
                record.specifier(),
                self.id
            );
            self.deferred.borrow_mut().push(record.clone());
            return Ok(());
        }
        self.wait_for(record, owner).await
    }

    async fn wait_for(&self, record: &ModuleRecord, owner: WalkId) -> Result<()> {
        self.linker.waiting.borrow_mut().insert(self.id, owner);
        record.linked().await;
        self.linker.waiting.borrow_mut().remove(&self.id);
        match record.state() {
            ModuleState::Failed => Err(record.failure_error()),
            _ => Ok(()),
        }
    }

    /// Wait for deferred records now that this walk holds none in `Linking`.
    async fn settle_deferred(&self, root: &ModuleRecord) -> Result<()> {
        let deferred = self.deferred.take();
        for record in deferred {
            if let (ModuleState::Linking, Some(owner)) = (record.state(), record.owner.get()) {
                if let Err(e) = self.wait_for(&record, owner).await {
                    return Err(root.fail(
                        FailureKind::Link,
                        format!("dependency '{}' failed: {}", record.specifier(), e),
                    ));
                }
            } else if record.state() == ModuleState::Failed {
                return Err(root.fail(
                    FailureKind::Link,
                    format!(
                        "dependency '{}' failed: {}",
                        record.specifier(),
                        record.failure_error()
                    ),
                ));
            }
        }
        Ok(())
    }
}

impl Drop for LinkWalk<'_> {
    fn drop(&mut self) {
        for record in self.started.get_mut().drain(..) {
            if record.state() == ModuleState::Linking {
                tracing::debug!(
                    "Link of module '{}' was cancelled in context {}",
                    record.specifier(),
                    self.linker.context
                );
                record.fail(
                    FailureKind::Cancelled,
                    "linking was cancelled before it finished".to_string(),
                );
            }
        }
        self.linker.waiting.borrow_mut().remove(&self.id);
    }
}

fn evaluation_message(error: Error) -> String {
    match error {
        Error::Evaluation(message) => message,
        other => other.to_string(),
    }
}
