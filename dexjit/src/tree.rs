//! Name-based expression trees and their decomposition into [`Dex`].
//!
//! A [`Node`] refers to columns by name and to functions by base name.
//! [`decompose`] resolves names against the annotator, picks the primitive
//! by argument types, and chooses the Dex call kind from the primitive's
//! null handling.

use serde::{Deserialize, Serialize};

use crate::annotator::Annotator;
use crate::dex::{full_name, Dex, FuncDescriptor};
use crate::error::BuildError;
use crate::registry::{FunctionRegistry, NullHandling};
use crate::types::{Literal, ScalarType};

/// Logical expression node.
///
/// ```json
/// { "node": "call", "name": "add", "args": [
///     { "node": "field", "name": "a" },
///     { "node": "literal", "value": { "type": "int32", "value": 1 } } ] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    /// Value of a column.
    Field { name: String },
    /// Validity of a column as a boolean.
    Validity { name: String },
    Literal { value: Literal },
    Call { name: String, args: Vec<Node> },
}

impl Node {
    pub fn field(name: impl Into<String>) -> Self {
        Node::Field { name: name.into() }
    }

    pub fn validity(name: impl Into<String>) -> Self {
        Node::Validity { name: name.into() }
    }

    pub fn literal(value: Literal) -> Self {
        Node::Literal { value }
    }

    pub fn call(name: impl Into<String>, args: Vec<Node>) -> Self {
        Node::Call {
            name: name.into(),
            args,
        }
    }
}

/// Lower `node` to a Dex tree.
pub fn decompose(
    node: &Node,
    annotator: &Annotator,
    registry: &FunctionRegistry,
) -> Result<Dex, BuildError> {
    match node {
        Node::Field { name } => Ok(Dex::value(annotator.input(name)?)),
        Node::Validity { name } => Ok(Dex::validity(annotator.input(name)?)),
        Node::Literal { value } => Ok(Dex::literal(*value)),
        Node::Call { name, args } => {
            let args = args
                .iter()
                .map(|arg| decompose(arg, annotator, registry))
                .collect::<Result<Vec<_>, _>>()?;
            let types: Vec<ScalarType> = args.iter().map(Dex::result_type).collect();
            let primitive = registry
                .lookup_signature(name, &types)
                .ok_or_else(|| BuildError::UnknownFunction(full_name(name, &types)))?;
            let func = FuncDescriptor::new(name.as_str(), primitive.return_type);
            Ok(match primitive.null_handling {
                NullHandling::ResultNullIfNull => Dex::non_nullable(func, args),
                NullHandling::ResultNullNever => Dex::nullable_never(func, args),
            })
        }
    }
}
