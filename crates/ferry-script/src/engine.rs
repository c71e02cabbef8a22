//! [`Engine`] implementation for fy.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use ferry_core::{
    CompiledModule, ContextId, ContextInit, ContextOutput, Engine, EngineFactory, ModuleHandle,
    ModuleHost, ModuleRequest, ScriptError,
};
use serde_json::{Map, Value, json};

use crate::ast::Program;
use crate::interp::{Bindings, Interpreter};
use crate::library::ScriptLibrary;
use crate::parser::parse;

struct ModuleSlot {
    identifier: String,
    program: Program,
    exports: Vec<String>,
    bindings: Bindings,
}

/// One fy interpreter instance, owned by a single context.
///
/// Globals visible to every script:
/// - `argv`: arguments the context was started with
/// - `init`: the context's initial payload
/// - `context`: the context id, e.g. `"main"` or `"worker:1"`
pub struct ScriptEngine {
    context: ContextId,
    globals: Bindings,
    modules: RefCell<Vec<Rc<ModuleSlot>>>,
    library: Arc<ScriptLibrary>,
    loaded: RefCell<HashSet<String>>,
    output: ContextOutput,
}

impl ScriptEngine {
    pub fn new(init: &ContextInit, output: ContextOutput, library: Arc<ScriptLibrary>) -> Self {
        let mut globals = Map::new();
        globals.insert("argv".to_string(), json!(init.argv));
        globals.insert("init".to_string(), init.payload.clone());
        globals.insert("context".to_string(), Value::String(init.id.to_string()));

        Self {
            context: init.id,
            globals: RefCell::new(globals),
            modules: RefCell::new(Vec::new()),
            library,
            loaded: RefCell::new(HashSet::new()),
            output,
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub(crate) fn globals(&self) -> &Bindings {
        &self.globals
    }

    pub(crate) fn output(&self) -> &ContextOutput {
        &self.output
    }

    fn slot(&self, handle: ModuleHandle) -> Result<Rc<ModuleSlot>, ScriptError> {
        usize::try_from(handle.0)
            .ok()
            .and_then(|index| self.modules.borrow().get(index).cloned())
            .ok_or_else(|| ScriptError::Thrown(format!("unknown module {}", handle)))
    }

    /// Current values of a module's exports.
    pub(crate) fn namespace(
        &self,
        handle: ModuleHandle,
    ) -> Result<Map<String, Value>, ScriptError> {
        let slot = self.slot(handle)?;
        let bindings = slot.bindings.borrow();
        Ok(slot
            .exports
            .iter()
            .map(|name| {
                let value = bindings.get(name).cloned().unwrap_or(Value::Null);
                (name.clone(), value)
            })
            .collect())
    }

    fn parse_script(&self, source: &str) -> Result<Program, ScriptError> {
        let program = parse(source).map_err(|e| ScriptError::Syntax(e.to_string()))?;
        if !program.static_imports().is_empty() {
            return Err(ScriptError::Syntax(
                "import declarations are only allowed in modules".to_string(),
            ));
        }
        if !program.exports().is_empty() {
            return Err(ScriptError::Syntax(
                "export declarations are only allowed in modules".to_string(),
            ));
        }
        Ok(program)
    }
}

impl Engine for ScriptEngine {
    fn eval_script(&self, source: &str, host: &dyn ModuleHost) -> Result<Value, ScriptError> {
        let program = self.parse_script(source)?;
        Interpreter::script(self, host).run(&program)
    }

    fn compile_module(
        &self,
        identifier: &str,
        source: &str,
    ) -> Result<CompiledModule, ScriptError> {
        let program = parse(source)
            .map_err(|e| ScriptError::Syntax(format!("{}: {}", identifier, e)))?;

        let mut requests: Vec<ModuleRequest> = program
            .static_imports()
            .into_iter()
            .map(|(specifier, names)| ModuleRequest::fixed(specifier, names))
            .collect();
        requests.extend(program.dynamic_imports().into_iter().map(ModuleRequest::dynamic));
        let exports = program.exports();

        let mut modules = self.modules.borrow_mut();
        let handle = ModuleHandle(modules.len() as u64);
        modules.push(Rc::new(ModuleSlot {
            identifier: identifier.to_string(),
            program,
            exports: exports.clone(),
            bindings: RefCell::new(Map::new()),
        }));
        tracing::trace!("Compiled module {} as {}", identifier, handle);

        Ok(CompiledModule {
            handle,
            exports,
            requests,
        })
    }

    fn evaluate_module(
        &self,
        module: ModuleHandle,
        host: &dyn ModuleHost,
    ) -> Result<(), ScriptError> {
        let slot = self.slot(module)?;
        tracing::trace!("Evaluating module {}", slot.identifier);
        Interpreter::module(self, host, &slot.bindings)
            .run(&slot.program)
            .map(drop)
    }

    fn load(&self, name: &str, host: &dyn ModuleHost) -> Result<(), ScriptError> {
        // Named scripts run once per context, like `require`.
        if !self.loaded.borrow_mut().insert(name.to_string()) {
            return Ok(());
        }

        let result = self
            .library
            .source(name)
            .and_then(|source| self.parse_script(&source))
            .and_then(|program| Interpreter::script(self, host).run(&program));

        if let Err(e) = result {
            self.loaded.borrow_mut().remove(name);
            return Err(e);
        }
        Ok(())
    }

    fn global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name).cloned()
    }
}

/// Creates a [`ScriptEngine`] per context, sharing one script library.
#[derive(Debug, Clone, Default)]
pub struct ScriptEngineFactory {
    library: Arc<ScriptLibrary>,
}

impl ScriptEngineFactory {
    pub fn new(library: ScriptLibrary) -> Self {
        Self {
            library: Arc::new(library),
        }
    }
}

impl EngineFactory for ScriptEngineFactory {
    fn create(
        &self,
        init: &ContextInit,
        output: ContextOutput,
    ) -> Result<Box<dyn Engine>, ScriptError> {
        tracing::debug!("Creating fy engine for context {}", init.id);
        Ok(Box::new(ScriptEngine::new(init, output, self.library.clone())))
    }
}
