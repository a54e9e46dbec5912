//! Errors from building and executing generated code.
//!
//! Build-time errors are configuration/codegen failures: once one is
//! returned the [`Generator`](crate::Generator) stays non-executable.
//! Execution errors carry the status reported by a generated function.

use thiserror::Error;

use crate::types::ScalarType;

/// Errors raised while generating code for a set of expressions.
#[derive(Debug, Error)]
pub enum BuildError {
    /// No primitive registered under this fully qualified name.
    #[error("no primitive registered as `{0}`")]
    UnknownFunction(String),

    /// A primitive exists but its arity or types disagree with the call site.
    #[error("signature mismatch calling `{name}`: {detail}")]
    SignatureMismatch { name: String, detail: String },

    /// A field descriptor points at a buffer slot the layout does not know.
    #[error("invalid field descriptor `{name}`: {detail}")]
    InvalidField { name: String, detail: String },

    /// A name-based field reference did not resolve against the schema.
    #[error("unknown field `{0}`")]
    UnknownField(String),

    /// The expression type does not match the output column type.
    #[error("type mismatch for `{name}`: expected {expected}, found {found}")]
    TypeMismatch {
        name: String,
        expected: ScalarType,
        found: ScalarType,
    },

    /// Arrow type without a fixed-width representation.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// The number of expressions differs from the number of declared outputs.
    #[error("expected {expected} expressions, got {actual}")]
    OutputCountMismatch { expected: usize, actual: usize },

    /// `build` was called on a generator that was already built (or failed).
    #[error("generator already built")]
    AlreadyBuilt,

    /// Cranelift settings, ISA or codegen error.
    #[error("codegen error: {0}")]
    Codegen(String),

    /// Module declaration/linking error.
    #[error("module error: {0}")]
    Module(String),

    /// Configuration could not be parsed.
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),
}

/// Errors raised while running generated code against a record batch.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("generator has not been built")]
    NotBuilt,

    #[error("expected {expected} output columns, got {actual}")]
    OutputCountMismatch { expected: usize, actual: usize },

    /// The batch does not match the schema the generator was built for.
    #[error("input mismatch: {0}")]
    InputMismatch(String),

    /// An output column has the wrong type or too little capacity.
    #[error("output {index} mismatch: {detail}")]
    OutputMismatch { index: usize, detail: String },

    /// Sliced arrays are not addressable by generated code.
    #[error("column `{0}` has a non-zero offset")]
    UnsupportedOffset(String),

    /// A generated function returned a non-zero status.
    #[error("expression {expr_index} failed with status {status}: {message}")]
    Function {
        expr_index: usize,
        status: i32,
        message: String,
    },

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
}

impl BuildError {
    pub(crate) fn codegen(e: impl std::fmt::Display) -> Self {
        BuildError::Codegen(e.to_string())
    }

    pub(crate) fn module(e: impl std::fmt::Display) -> Self {
        BuildError::Module(e.to_string())
    }
}
