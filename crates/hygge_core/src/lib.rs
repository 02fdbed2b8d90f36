//! Hygge front-end interface: the typed AST handed to the back ends.

pub mod ast;
pub mod build;
pub mod types;

pub use ast::{BinOp, Expr, MatchCase, Position, TypedExpr, UnOp};
pub use types::{is_subtype_of, Type, TypeEnv};

pub const TOOL_NAME: &str = "hyggec";
pub const VERSION: &str = "0.1";
