//! Syntax tree for fy programs.

use crate::lexer::Position;

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        value: Expr,
        exported: bool,
        position: Position,
    },
    Assign {
        name: String,
        /// Set for compound assignment (`+=`, `-=`).
        op: Option<BinaryOp>,
        value: Expr,
        position: Position,
    },
    /// `import { a, b } from "spec"`
    Import {
        names: Vec<String>,
        specifier: String,
        position: Position,
    },
    Throw(Expr, Position),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Identifier(String, Position),
    List(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Member(Box<Expr>, String, Position),
    Index(Box<Expr>, Box<Expr>, Position),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>, Position),
    /// Call of a builtin function.
    Call(String, Vec<Expr>, Position),
    /// `import(expr)`
    DynamicImport(Box<Expr>, Position),
}

impl Program {
    /// Names declared with `export let`, in source order.
    pub fn exports(&self) -> Vec<String> {
        self.statements
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::Let {
                    name,
                    exported: true,
                    ..
                } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Static imports as `(specifier, names)` pairs.
    pub fn static_imports(&self) -> Vec<(String, Vec<String>)> {
        self.statements
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::Import {
                    names, specifier, ..
                } => Some((specifier.clone(), names.clone())),
                _ => None,
            })
            .collect()
    }

    /// Specifiers of every `import("...")` with a literal argument.
    pub fn dynamic_imports(&self) -> Vec<String> {
        let mut found = Vec::new();
        for stmt in &self.statements {
            match stmt {
                Stmt::Let { value, .. } | Stmt::Assign { value, .. } | Stmt::Throw(value, _) => {
                    value.collect_dynamic_imports(&mut found)
                }
                Stmt::Expr(expr) => expr.collect_dynamic_imports(&mut found),
                Stmt::Import { .. } => {}
            }
        }
        found
    }
}

impl Expr {
    fn collect_dynamic_imports(&self, found: &mut Vec<String>) {
        match self {
            Expr::DynamicImport(target, _) => {
                if let Expr::Literal(Literal::String(specifier)) = target.as_ref() {
                    if !found.contains(specifier) {
                        found.push(specifier.clone());
                    }
                } else {
                    target.collect_dynamic_imports(found);
                }
            }
            Expr::List(items) | Expr::Call(_, items, _) => {
                for item in items {
                    item.collect_dynamic_imports(found);
                }
            }
            Expr::Object(fields) => {
                for (_, value) in fields {
                    value.collect_dynamic_imports(found);
                }
            }
            Expr::Member(target, _, _) | Expr::Unary(_, target) => {
                target.collect_dynamic_imports(found)
            }
            Expr::Index(target, index, _) | Expr::Binary(_, target, index, _) => {
                target.collect_dynamic_imports(found);
                index.collect_dynamic_imports(found);
            }
            Expr::Literal(_) | Expr::Identifier(..) => {}
        }
    }
}
