//! # Expression module
//!
//! This module provides the compile-and-evaluate seam the mapping layer
//! relies on. Expressions use a jq-compatible syntax; the engine behind the
//! [`Engine`] trait is replaceable, the built-in [`filter`] engine covers the
//! subset the mapping contract needs.

use std::sync::Arc;

use serde_json::Value;

pub mod filter;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("failed to parse expression '{expression}' at offset {offset}, {message}")]
    Parse {
        expression: String,
        offset: usize,
        message: String,
    },
    #[error("failed to evaluate expression, {0}")]
    Evaluate(String),
}

// -----------------------------------------------------------------------------
// Engine trait

/// compiles an expression source once; the compiled form is evaluated many
/// times against raw records
pub trait Engine: Send + Sync {
    fn compile(&self, source: &str) -> Result<Arc<dyn Expression>, Error>;
}

// -----------------------------------------------------------------------------
// Expression trait

pub trait Expression: Send + Sync {
    fn evaluate(&self, input: &Value) -> Result<Value, Error>;
}

// -----------------------------------------------------------------------------
// helpers

/// jq truthiness, everything except `null` and `false` is truthy
pub fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}
