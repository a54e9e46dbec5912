//! # dexjit: decomposed expressions → native loops via Cranelift JIT
//!
//! `dexjit` compiles scalar expressions over Arrow record batches into one
//! native function per expression. Each function loops over the rows of a
//! batch, reads column values straight out of Arrow buffers, calls
//! precompiled primitives, and writes an output value and validity bit per
//! row. Null propagation is decided at build time, not per call.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dexjit::{GeneratorConfig, Node, Projector};
//!
//! let projector = Projector::make(
//!     schema,
//!     vec![(Node::call("add", vec![Node::field("a"), Node::field("b")]),
//!           Field::new("a_plus_b", DataType::Int32, true))],
//!     GeneratorConfig::default(),
//! )?;
//! let out = projector.evaluate(&batch)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Node tree (names)           JSON projection (serde)
//!       │                            │
//!       ▼                            ▼
//! decompose  →  Dex tree (slots resolved, null handling chosen)
//!       │
//!       ▼
//! Visitor  →  CLIF for one row (LValue = value + validity)
//!       │
//!       ▼
//! Expression compiler  →  row loop, output store, hoisted bitmap list
//!       │
//!       ▼
//! Cranelift codegen  →  native code, one JIT module per Generator
//!       │
//!       ▼
//! Execute  →  call each function, then AND hoisted bitmaps into outputs
//! ```
//!
//! Nulls are handled at two levels:
//! - per row: argument validities of a null-if-null call are ANDed in
//!   generated code;
//! - per batch: column validity that only feeds infallible null-if-null
//!   calls is never loaded per row; the whole bitmap is ANDed into the
//!   output afterwards.

pub mod annotator;
pub mod bitmap;
pub mod compiler;
pub mod config;
pub mod context;
pub mod detect;
pub mod dex;
pub mod engine;
pub mod error;
pub mod generator;
pub mod lvalue;
pub mod primitives;
pub mod projector;
pub mod registry;
pub mod trace;
pub mod tree;
pub mod types;
pub mod visitor;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports
pub use annotator::{Annotator, OutputColumn};
pub use config::GeneratorConfig;
pub use context::ExecutionContext;
pub use dex::{Dex, Expression, FieldDescriptor, FuncDescriptor};
pub use error::{BuildError, ExecError};
pub use generator::{CompiledExpr, Generator};
pub use projector::Projector;
pub use registry::{FunctionRegistry, NullHandling};
pub use trace::{TraceEvent, TraceSink};
pub use tree::Node;
pub use types::{Literal, ScalarType};
