//! The seam between ferry and the script engine it drives.
//!
//! The engine itself is external: ferry only needs it to compile and run
//! scripts and modules, report what a module exports and imports, and call
//! back into a [`ModuleHost`] whenever a module asks for another one.
//!
//! Engines are single-threaded. An engine instance is created on its
//! context's own thread by an [`EngineFactory`] and never leaves it.
//! All methods take `&self` because evaluating one module can re-enter the
//! engine to evaluate an import; implementations keep interior borrows short.

use std::borrow::Cow;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::context::{ContextId, ContextKind};
use crate::output::ContextOutput;

/// Opaque engine-side identifier of a compiled module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One import a compiled module will perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRequest {
    /// Specifier as written in the source.
    pub specifier: String,
    /// Names bound by a static import. Empty for dynamic imports.
    pub imports: Vec<String>,
    /// Whether the import happens at run time (`import("..")`).
    pub dynamic: bool,
}

impl ModuleRequest {
    /// A static import binding `imports` from `specifier`.
    pub fn fixed(specifier: impl Into<String>, imports: Vec<String>) -> Self {
        Self {
            specifier: specifier.into(),
            imports,
            dynamic: false,
        }
    }

    /// A dynamic import of `specifier`.
    pub fn dynamic(specifier: impl Into<String>) -> Self {
        Self {
            specifier: specifier.into(),
            imports: Vec::new(),
            dynamic: true,
        }
    }
}

/// Result of compiling module source text.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub handle: ModuleHandle,
    /// Names the module exports, known before it runs.
    pub exports: Vec<String>,
    pub requests: Vec<ModuleRequest>,
}

/// Errors reported by an engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("syntax error: {0}")]
    Syntax(String),

    /// The script threw.
    #[error("{0}")]
    Thrown(String),

    /// A named script does not exist.
    #[error("cannot find '{0}'")]
    NotFound(String),

    /// A module asked for an import the host could not provide.
    #[error("cannot import '{specifier}': {message}")]
    Import { specifier: String, message: String },
}

/// Import callback handed to the engine while it runs code.
pub trait ModuleHost {
    /// Return an evaluated module for `specifier`, evaluating it first if needed.
    fn import(&self, specifier: &str) -> Result<ModuleHandle, ScriptError>;
}

/// Host that refuses every import.
pub struct NoImports;

impl ModuleHost for NoImports {
    fn import(&self, specifier: &str) -> Result<ModuleHandle, ScriptError> {
        Err(ScriptError::Import {
            specifier: specifier.to_string(),
            message: "imports are not available here".to_string(),
        })
    }
}

/// A single-threaded script engine instance.
pub trait Engine {
    /// Run a classic script and return its completion value.
    fn eval_script(&self, source: &str, host: &dyn ModuleHost) -> Result<Value, ScriptError>;

    /// Compile module source. The module does not run yet.
    fn compile_module(&self, identifier: &str, source: &str)
    -> Result<CompiledModule, ScriptError>;

    /// Run the body of a compiled module.
    fn evaluate_module(&self, module: ModuleHandle, host: &dyn ModuleHost)
    -> Result<(), ScriptError>;

    /// Resolve and run a named script using the engine's own lookup rules.
    fn load(&self, name: &str, host: &dyn ModuleHost) -> Result<(), ScriptError>;

    /// Read a global binding.
    fn global(&self, name: &str) -> Option<Value>;
}

/// What a new context is told about itself.
#[derive(Debug, Clone)]
pub struct ContextInit {
    pub id: ContextId,
    pub kind: ContextKind,
    pub argv: Vec<String>,
    pub payload: Value,
}

/// Creates one engine per context, on that context's thread.
pub trait EngineFactory: Send + Sync + 'static {
    fn create(&self, init: &ContextInit, output: ContextOutput)
    -> Result<Box<dyn Engine>, ScriptError>;
}

impl<F> EngineFactory for F
where
    F: Fn(&ContextInit, ContextOutput) -> Result<Box<dyn Engine>, ScriptError>
        + Send
        + Sync
        + 'static,
{
    fn create(
        &self,
        init: &ContextInit,
        output: ContextOutput,
    ) -> Result<Box<dyn Engine>, ScriptError> {
        self(init, output)
    }
}

/// Pure source transform applied to `Eval` payloads before they run.
pub trait Preprocess: Send + Sync + 'static {
    fn preprocess<'a>(&self, source: &'a str) -> Result<Cow<'a, str>, ScriptError>;
}

/// Leaves sources untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPreprocess;

impl Preprocess for NoPreprocess {
    fn preprocess<'a>(&self, source: &'a str) -> Result<Cow<'a, str>, ScriptError> {
        Ok(Cow::Borrowed(source))
    }
}
