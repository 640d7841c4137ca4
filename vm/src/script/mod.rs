//! The guest script engine.
//!
//! The important contract is the enumerated capability surface, not the
//! engine: guests see exactly the `system.*` namespaces the host installs,
//! and a script's exports are its `method` definitions. The engine itself
//! is a small deterministic language — pest grammar in `guest.pest`,
//! AST in [`ast`], async tree-walking evaluation in `interp`.

mod ast;
mod interp;
mod parser;

pub use ast::{BinOp, Block, Expr, MethodDef, Param, Script, Stmt, UnOp};
pub use parser::parse_script;

pub(crate) use interp::{invoke_method, CallCtx};

use thiserror::Error;

/// Errors from parsing or running guest code.
#[derive(Debug, Clone, Error)]
pub enum ScriptError {
    /// Syntax error with source position.
    #[error("parse error at {line}:{col}: {message}")]
    Parse {
        /// One-based line.
        line: usize,
        /// One-based column.
        col: usize,
        /// Parser message.
        message: String,
    },
    /// Two methods share a name.
    #[error("duplicate method `{name}`")]
    Duplicate {
        /// The contested name.
        name: String,
    },
    /// The guest tripped over its own semantics (unknown name, bad
    /// operand types, and so on).
    #[error("runtime error: {0}")]
    Runtime(String),
    /// A native namespace refused the call at a capacity bound. Kept
    /// structural so the kernel can surface it as a capacity error
    /// rather than a generic guest error.
    #[error("factory at capacity ({max} vms)")]
    Capacity {
        /// The configured bound.
        max: usize,
    },
    /// The guest raised deliberately (`fail(..)`), or a host call it made
    /// failed; the message is surfaced verbatim.
    #[error("{0}")]
    Guest(String),
}
