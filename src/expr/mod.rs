//! Expression evaluation over rows.
//!
//! Configuration expressions (`ExpressionNode`, `CaseExpression`,
//! `HashExpression`) are compiled once at graph-build time into trees with
//! resolved column indices, then tree-walked per row. Column resolution
//! failures and bad literals are configuration errors; per-row evaluation
//! only produces values or row-local errors.

pub mod eval;
pub mod hash;

pub use eval::{CompiledCase, CompiledExpr, compile, compile_case, truthy};
pub use hash::{CompiledHash, compile_hash, hash_row_value};
