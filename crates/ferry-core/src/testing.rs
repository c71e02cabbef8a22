//! A line-oriented stub engine for unit tests.
//!
//! Module sources are one directive per line:
//!
//! ```text
//! export NAME        declare an export
//! use SPEC: a, b     static import
//! dynamic SPEC       dynamic import, performed when the body runs
//! log TEXT           record TEXT and print it to stdout
//! throw TEXT         fail the body
//! !                  syntax error
//! ```
//!
//! Scripts are `throw TEXT`, `import SPEC`, `print TEXT`, `argv`, `payload`,
//! or a sum of integers such as `1+1`.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};

use crate::engine::{
    CompiledModule, ContextInit, Engine, EngineFactory, ModuleHandle, ModuleHost, ModuleRequest,
    ScriptError,
};
use crate::error::Result as FerryResult;
use crate::loader::{MemoryLoader, ModuleLoader, ModuleSource};
use crate::output::ContextOutput;

pub(crate) type Log = Arc<Mutex<Vec<String>>>;

pub(crate) struct StubEngine {
    modules: RefCell<Vec<Vec<String>>>,
    log: Log,
    output: ContextOutput,
    argv: Vec<String>,
    payload: Value,
}

impl StubEngine {
    pub(crate) fn new() -> Self {
        Self {
            modules: RefCell::new(Vec::new()),
            log: Log::default(),
            output: ContextOutput::detached(),
            argv: Vec::new(),
            payload: Value::Null,
        }
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, text: &str) {
        self.log.lock().unwrap().push(text.to_string());
        self.output.stdout(&format!("{}\n", text));
    }
}

/// Factory sharing `log` with every engine it creates. An `argv` starting
/// with `fail` makes engine creation fail; one starting with `slow` makes it
/// take 200ms and print `late start` before returning.
pub(crate) fn factory(log: Log) -> impl EngineFactory {
    move |init: &ContextInit, output: ContextOutput| -> Result<Box<dyn Engine>, ScriptError> {
        match init.argv.first().map(String::as_str) {
            Some("fail") => {
                return Err(ScriptError::Thrown("engine refused to start".to_string()));
            }
            Some("slow") => {
                std::thread::sleep(Duration::from_millis(200));
                output.stdout("late start\n");
            }
            _ => {}
        }
        Ok(Box::new(StubEngine {
            modules: RefCell::new(Vec::new()),
            log: log.clone(),
            output,
            argv: init.argv.clone(),
            payload: init.payload.clone(),
        }))
    }
}

impl Engine for StubEngine {
    fn eval_script(&self, source: &str, host: &dyn ModuleHost) -> Result<Value, ScriptError> {
        let source = source.trim();
        if let Some(message) = source.strip_prefix("throw ") {
            return Err(ScriptError::Thrown(message.to_string()));
        }
        if let Some(specifier) = source.strip_prefix("import ") {
            let handle = host.import(specifier)?;
            return Ok(Value::String(handle.to_string()));
        }
        if let Some(text) = source.strip_prefix("print ") {
            self.output.stdout(&format!("{}\n", text));
            return Ok(Value::Null);
        }
        match source {
            "argv" => return Ok(json!(self.argv)),
            "payload" => return Ok(self.payload.clone()),
            _ => {}
        }

        let mut sum = 0i64;
        for term in source.split('+') {
            sum += term
                .trim()
                .parse::<i64>()
                .map_err(|_| ScriptError::Syntax(format!("unexpected '{}'", term.trim())))?;
        }
        Ok(json!(sum))
    }

    fn compile_module(
        &self,
        _identifier: &str,
        source: &str,
    ) -> Result<CompiledModule, ScriptError> {
        let lines: Vec<String> = source
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        let mut exports = Vec::new();
        let mut requests = Vec::new();
        for line in &lines {
            if line == "!" {
                return Err(ScriptError::Syntax("unexpected '!'".to_string()));
            } else if let Some(name) = line.strip_prefix("export ") {
                exports.push(name.to_string());
            } else if let Some(rest) = line.strip_prefix("use ") {
                let (specifier, names) = rest.split_once(':').unwrap_or((rest, ""));
                let names = names
                    .split(',')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .collect();
                requests.push(ModuleRequest::fixed(specifier.trim(), names));
            } else if let Some(specifier) = line.strip_prefix("dynamic ") {
                requests.push(ModuleRequest::dynamic(specifier));
            }
        }

        let mut modules = self.modules.borrow_mut();
        modules.push(lines);
        Ok(CompiledModule {
            handle: ModuleHandle(modules.len() as u64 - 1),
            exports,
            requests,
        })
    }

    fn evaluate_module(
        &self,
        module: ModuleHandle,
        host: &dyn ModuleHost,
    ) -> Result<(), ScriptError> {
        let lines = self
            .modules
            .borrow()
            .get(module.0 as usize)
            .cloned()
            .ok_or_else(|| ScriptError::Thrown(format!("unknown module {}", module)))?;

        for line in &lines {
            if let Some(rest) = line.strip_prefix("use ") {
                let specifier = rest.split(':').next().unwrap_or(rest).trim();
                host.import(specifier)?;
            } else if let Some(specifier) = line.strip_prefix("dynamic ") {
                host.import(specifier)?;
            } else if let Some(text) = line.strip_prefix("log ") {
                self.record(text);
            } else if let Some(message) = line.strip_prefix("throw ") {
                return Err(ScriptError::Thrown(message.to_string()));
            }
        }
        Ok(())
    }

    fn load(&self, name: &str, _host: &dyn ModuleHost) -> Result<(), ScriptError> {
        if name == "missing" {
            return Err(ScriptError::NotFound(name.to_string()));
        }
        self.record(&format!("load {}", name));
        Ok(())
    }

    fn global(&self, name: &str) -> Option<Value> {
        match name {
            "log_len" => Some(json!(self.log.lock().unwrap().len())),
            _ => None,
        }
    }
}

/// Serves modules from memory, holding chosen fetches back. Each delay
/// applies to one fetch of its specifier, in order.
pub(crate) struct DelayedLoader {
    modules: MemoryLoader,
    delays: Mutex<HashMap<String, VecDeque<Duration>>>,
}

impl DelayedLoader {
    pub(crate) fn new(modules: MemoryLoader) -> Self {
        Self {
            modules,
            delays: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn delay(self, specifier: &str, millis: &[u64]) -> Self {
        self.delays.lock().unwrap().insert(
            specifier.to_string(),
            millis.iter().copied().map(Duration::from_millis).collect(),
        );
        self
    }
}

impl ModuleLoader for DelayedLoader {
    fn fetch<'a>(&'a self, specifier: &'a str) -> BoxFuture<'a, FerryResult<ModuleSource>> {
        let delay = self
            .delays
            .lock()
            .unwrap()
            .get_mut(specifier)
            .and_then(VecDeque::pop_front);
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.modules.fetch(specifier).await
        }
        .boxed()
    }
}
