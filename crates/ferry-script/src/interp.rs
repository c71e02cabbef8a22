//! Tree-walking evaluation of fy programs.

use std::cell::RefCell;

use ferry_core::{ModuleHost, ScriptError};
use serde_json::{Map, Number, Value};

use crate::ast::{BinaryOp, Expr, Literal, Program, Stmt, UnaryOp};
use crate::engine::ScriptEngine;
use crate::lexer::Position;

pub(crate) type Bindings = RefCell<Map<String, Value>>;

/// Evaluates one program against an engine.
///
/// Scripts bind into the engine's globals; modules bind into their own
/// `locals` and fall back to globals for reads.
pub(crate) struct Interpreter<'a> {
    engine: &'a ScriptEngine,
    host: &'a dyn ModuleHost,
    locals: Option<&'a Bindings>,
}

fn thrown(message: String, position: Position) -> ScriptError {
    ScriptError::Thrown(format!("{} at {}", message, position))
}

impl<'a> Interpreter<'a> {
    pub(crate) fn script(engine: &'a ScriptEngine, host: &'a dyn ModuleHost) -> Self {
        Self {
            engine,
            host,
            locals: None,
        }
    }

    pub(crate) fn module(
        engine: &'a ScriptEngine,
        host: &'a dyn ModuleHost,
        locals: &'a Bindings,
    ) -> Self {
        Self {
            engine,
            host,
            locals: Some(locals),
        }
    }

    fn scope(&self) -> &Bindings {
        self.locals.unwrap_or(self.engine.globals())
    }

    /// Run `program`, returning the value of its last expression statement.
    pub(crate) fn run(&self, program: &Program) -> Result<Value, ScriptError> {
        let mut completion = Value::Null;
        for stmt in &program.statements {
            if let Some(value) = self.exec(stmt)? {
                completion = value;
            }
        }
        Ok(completion)
    }

    fn exec(&self, stmt: &Stmt) -> Result<Option<Value>, ScriptError> {
        match stmt {
            Stmt::Let { name, value, .. } => {
                let value = self.eval(value)?;
                self.scope().borrow_mut().insert(name.clone(), value);
                Ok(None)
            }
            Stmt::Assign {
                name,
                op,
                value,
                position,
            } => {
                let value = self.eval(value)?;
                self.assign(name, *op, value, *position)?;
                Ok(None)
            }
            Stmt::Import {
                names,
                specifier,
                position,
            } => {
                let namespace = self.import(specifier)?;
                for name in names {
                    let value = namespace.get(name).cloned().ok_or_else(|| {
                        thrown(
                            format!("'{}' does not export '{}'", specifier, name),
                            *position,
                        )
                    })?;
                    self.scope().borrow_mut().insert(name.clone(), value);
                }
                Ok(None)
            }
            Stmt::Throw(value, _) => {
                let value = self.eval(value)?;
                Err(ScriptError::Thrown(display(&value)))
            }
            Stmt::Expr(expr) => self.eval(expr).map(Some),
        }
    }

    fn assign(
        &self,
        name: &str,
        op: Option<BinaryOp>,
        value: Value,
        position: Position,
    ) -> Result<(), ScriptError> {
        let target = match self.locals {
            Some(locals) if locals.borrow().contains_key(name) => locals,
            _ => self.engine.globals(),
        };

        let current = target.borrow().get(name).cloned();
        let value = match (op, current) {
            (None, _) => value,
            (Some(op), Some(current)) => binary(op, &current, &value, position)?,
            (Some(_), None) => {
                return Err(thrown(format!("'{}' is not defined", name), position));
            }
        };
        target.borrow_mut().insert(name.to_string(), value);
        Ok(())
    }

    fn lookup(&self, name: &str, position: Position) -> Result<Value, ScriptError> {
        if let Some(value) = self.locals.and_then(|locals| locals.borrow().get(name).cloned()) {
            return Ok(value);
        }
        self.engine
            .globals()
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| thrown(format!("'{}' is not defined", name), position))
    }

    fn import(&self, specifier: &str) -> Result<Map<String, Value>, ScriptError> {
        let handle = self.host.import(specifier)?;
        self.engine.namespace(handle)
    }

    fn eval(&self, expr: &Expr) -> Result<Value, ScriptError> {
        match expr {
            Expr::Literal(literal) => Ok(match literal {
                Literal::Null => Value::Null,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Integer(n) => Value::from(*n),
                Literal::Float(n) => float(*n),
                Literal::String(s) => Value::String(s.clone()),
            }),
            Expr::Identifier(name, position) => self.lookup(name, *position),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Object(fields) => {
                let mut object = Map::new();
                for (key, value) in fields {
                    object.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Object(object))
            }
            Expr::Member(target, name, position) => match self.eval(target)? {
                Value::Object(mut object) => Ok(object.remove(name).unwrap_or(Value::Null)),
                other => Err(thrown(
                    format!("cannot read '{}' of {}", name, type_name(&other)),
                    *position,
                )),
            },
            Expr::Index(target, index, position) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                index_value(target, &index, *position)
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Neg => match &value {
                        Value::Number(n) => Ok(match n.as_i64().and_then(i64::checked_neg) {
                            Some(i) => Value::from(i),
                            None => float(-n.as_f64().unwrap_or(f64::NAN)),
                        }),
                        other => Err(ScriptError::Thrown(format!(
                            "cannot negate {}",
                            type_name(other)
                        ))),
                    },
                }
            }
            Expr::Binary(BinaryOp::And, left, right, _) => {
                let left = self.eval(left)?;
                if truthy(&left) { self.eval(right) } else { Ok(left) }
            }
            Expr::Binary(BinaryOp::Or, left, right, _) => {
                let left = self.eval(left)?;
                if truthy(&left) { Ok(left) } else { self.eval(right) }
            }
            Expr::Binary(op, left, right, position) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, &left, &right, *position)
            }
            Expr::Call(name, args, position) => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(name, args, *position)
            }
            Expr::DynamicImport(target, position) => match self.eval(target)? {
                Value::String(specifier) => self.import(&specifier).map(Value::Object),
                other => Err(thrown(
                    format!("import() expects a string, got {}", type_name(&other)),
                    *position,
                )),
            },
        }
    }

    fn call(&self, name: &str, args: Vec<Value>, position: Position) -> Result<Value, ScriptError> {
        match name {
            "print" | "eprint" => {
                let mut line = args.iter().map(display).collect::<Vec<_>>().join(" ");
                line.push('\n');
                if name == "print" {
                    self.engine.output().stdout(&line);
                } else {
                    self.engine.output().stderr(&line);
                }
                Ok(Value::Null)
            }
            "len" => match args.first() {
                Some(Value::String(s)) => Ok(Value::from(s.chars().count())),
                Some(Value::Array(items)) => Ok(Value::from(items.len())),
                Some(Value::Object(fields)) => Ok(Value::from(fields.len())),
                other => Err(thrown(
                    format!(
                        "len() expects a string, list or object, got {}",
                        other.map_or("nothing", type_name)
                    ),
                    position,
                )),
            },
            "str" => Ok(Value::String(args.first().map(display).unwrap_or_default())),
            "keys" => match args.first() {
                Some(Value::Object(fields)) => Ok(Value::Array(
                    fields.keys().cloned().map(Value::String).collect(),
                )),
                _ => Err(thrown("keys() expects an object".to_string(), position)),
            },
            _ => Err(thrown(format!("'{}' is not a function", name), position)),
        }
    }
}

/// Text form of a value: strings raw, everything else as JSON.
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Integral floats become integers; non-finite results become null.
fn float(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn index_value(target: Value, index: &Value, position: Position) -> Result<Value, ScriptError> {
    match (target, index) {
        (Value::Array(mut items), Value::Number(n)) => {
            let i = n.as_u64().and_then(|i| usize::try_from(i).ok());
            Ok(match i {
                Some(i) if i < items.len() => items.swap_remove(i),
                _ => Value::Null,
            })
        }
        (Value::Object(mut fields), Value::String(key)) => {
            Ok(fields.remove(key).unwrap_or(Value::Null))
        }
        (Value::String(s), Value::Number(n)) => Ok(n
            .as_u64()
            .and_then(|i| s.chars().nth(i as usize))
            .map_or(Value::Null, |c| Value::String(c.to_string()))),
        (target, index) => Err(thrown(
            format!("cannot index {} with {}", type_name(&target), type_name(index)),
            position,
        )),
    }
}

fn binary(
    op: BinaryOp,
    left: &Value,
    right: &Value,
    position: Position,
) -> Result<Value, ScriptError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(equals(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!equals(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return Err(thrown(
                    format!("cannot compare {} with {}", type_name(left), type_name(right)),
                    position,
                ));
            };
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => arithmetic(op, a, b, position),
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", display(left), display(right))))
            }
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b).cloned().collect()))
            }
            _ => Err(operand_error(op, left, right, position)),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => match (left, right) {
            (Value::Number(a), Value::Number(b)) => arithmetic(op, a, b, position),
            _ => Err(operand_error(op, left, right, position)),
        },
        // Short-circuiting forms are evaluated by the interpreter.
        BinaryOp::And => Ok(if truthy(left) { right.clone() } else { left.clone() }),
        BinaryOp::Or => Ok(if truthy(left) { left.clone() } else { right.clone() }),
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn arithmetic(
    op: BinaryOp,
    a: &Number,
    b: &Number,
    position: Position,
) -> Result<Value, ScriptError> {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div if b == 0 => {
                return Err(thrown("division by zero".to_string(), position));
            }
            BinaryOp::Div => (a % b == 0).then(|| a / b),
            BinaryOp::Rem if b == 0 => {
                return Err(thrown("division by zero".to_string(), position));
            }
            BinaryOp::Rem => a.checked_rem(b),
            _ => None,
        };
        if let Some(n) = exact {
            return Ok(Value::from(n));
        }
    }

    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
    let n = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        _ => a % b,
    };
    Ok(float(n))
}

fn operand_error(op: BinaryOp, left: &Value, right: &Value, position: Position) -> ScriptError {
    thrown(
        format!(
            "unsupported operands for {:?}: {} and {}",
            op,
            type_name(left),
            type_name(right)
        ),
        position,
    )
}
