//! Core of ferry: runs isolated script contexts behind an action protocol.
//!
//! This crate provides:
//! - A [`Bridge`] owning a main context and the workers it spawns
//! - Action dispatch with exactly-once completion
//! - A per-context module linker over a pluggable [`ModuleLoader`]
//! - Drain-then-terminate shutdown for every context
//!
//! The script engine itself is supplied by the embedder through the
//! [`Engine`] and [`EngineFactory`] traits.

pub mod bridge;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod linker;
pub mod loader;
pub mod output;
pub mod registry;
mod shutdown;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{Bridge, BridgeBuilder};
pub use config::BridgeConfig;
pub use context::{ContextHandle, ContextId, ContextKind, Lifecycle, LifecycleState};
pub use dispatch::{
    Action, ActionKind, ActionPayload, ActionResult, Completion, CompletionReceiver,
};
pub use engine::{
    CompiledModule, ContextInit, Engine, EngineFactory, ModuleHandle, ModuleHost, ModuleRequest,
    NoImports, NoPreprocess, Preprocess, ScriptError,
};
pub use error::{Error, Result};
pub use linker::{ModuleLinker, ModuleRecord, ModuleState};
pub use loader::{FsLoader, MemoryLoader, ModuleLoader, ModuleSource};
pub use output::{CaptureSink, ContextOutput, OutputChunk, OutputSink, OutputStream, StdioSink};
pub use registry::{WorkerId, WorkerRegistry};
