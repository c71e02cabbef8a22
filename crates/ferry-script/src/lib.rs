//! fy: a small dynamically typed language that runs inside ferry contexts.
//!
//! Values are JSON values. A script is a sequence of statements separated
//! by newlines or `;`, and its completion value is the value of the last
//! expression statement:
//!
//! ```text
//! let total = 0
//! total += len(argv)
//! print("started with " + str(total) + " arguments")
//! { total: total, tags: ["a", "b"] }
//! ```
//!
//! Modules may also declare imports and exports:
//!
//! ```text
//! import { scale } from "config"
//! export let area = scale * scale
//! let lazy = import("extras")
//! ```
//!
//! Builtins: `print`, `eprint`, `len`, `str` and `keys`.

pub mod ast;
pub mod engine;
mod interp;
pub mod lexer;
pub mod library;
pub mod parser;
pub mod preprocess;

pub use engine::{ScriptEngine, ScriptEngineFactory};
pub use interp::{display, truthy};
pub use library::{SCRIPT_EXTENSION, ScriptLibrary};
pub use parser::{ParseError, parse};
pub use preprocess::StripTypeAnnotations;
