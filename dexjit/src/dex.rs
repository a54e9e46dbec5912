//! Decomposed expression IR.
//!
//! A [`Dex`] tree is what code generation consumes: field references are
//! already resolved to buffer slots and every call already knows how its
//! result validity is derived. Trees own their children; there is no
//! sharing between nodes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{Literal, ScalarType};

/// One column's logical identity and its physical buffer slots in the
/// address array handed to generated code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: ScalarType,
    pub nullable: bool,
    /// Slot of the validity bitmap.
    pub validity_idx: usize,
    /// Slot of the data buffer.
    pub data_idx: usize,
}

/// A call target: base name plus declared return type. The fully qualified
/// name is derived from the argument types at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncDescriptor {
    pub name: String,
    pub return_type: ScalarType,
}

impl FuncDescriptor {
    pub fn new(name: impl Into<String>, return_type: ScalarType) -> Self {
        Self {
            name: name.into(),
            return_type,
        }
    }
}

/// Mangle a base name with its parameter types, e.g. `add_int32_int32`.
pub fn full_name(base: &str, params: &[ScalarType]) -> String {
    let mut name = String::from(base);
    for p in params {
        name.push('_');
        name.push_str(p.name());
    }
    name
}

/// Decomposed expression node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dex {
    /// Validity bit of a column at the current row, as a boolean value.
    VectorReadValidity { field: FieldDescriptor },
    /// Value of a column at the current row; valid iff the column's bit is set.
    VectorReadValue { field: FieldDescriptor },
    /// Constant, always valid.
    Literal { value: Literal },
    /// Valid iff every argument is valid.
    NonNullableFunc { func: FuncDescriptor, args: Vec<Dex> },
    /// Always valid; the primitive sees each argument's validity.
    NullableNeverFunc { func: FuncDescriptor, args: Vec<Dex> },
}

impl Dex {
    pub fn validity(field: FieldDescriptor) -> Self {
        Dex::VectorReadValidity { field }
    }

    pub fn value(field: FieldDescriptor) -> Self {
        Dex::VectorReadValue { field }
    }

    pub fn literal(value: Literal) -> Self {
        Dex::Literal { value }
    }

    pub fn non_nullable(func: FuncDescriptor, args: Vec<Dex>) -> Self {
        Dex::NonNullableFunc { func, args }
    }

    pub fn nullable_never(func: FuncDescriptor, args: Vec<Dex>) -> Self {
        Dex::NullableNeverFunc { func, args }
    }

    /// Type of the value this node produces.
    pub fn result_type(&self) -> ScalarType {
        match self {
            Dex::VectorReadValidity { .. } => ScalarType::Boolean,
            Dex::VectorReadValue { field } => field.ty,
            Dex::Literal { value } => value.scalar_type(),
            Dex::NonNullableFunc { func, .. } | Dex::NullableNeverFunc { func, .. } => {
                func.return_type
            }
        }
    }

    /// Every buffer slot this tree reads.
    pub fn buffer_slots(&self, out: &mut BTreeSet<usize>) {
        match self {
            Dex::VectorReadValidity { field } => {
                out.insert(field.validity_idx);
            }
            Dex::VectorReadValue { field } => {
                out.insert(field.data_idx);
                if field.nullable {
                    out.insert(field.validity_idx);
                }
            }
            Dex::Literal { .. } => {}
            Dex::NonNullableFunc { args, .. } | Dex::NullableNeverFunc { args, .. } => {
                for arg in args {
                    arg.buffer_slots(out);
                }
            }
        }
    }
}

/// One expression to compile: a Dex tree and the column it writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub root: Dex,
    pub output: FieldDescriptor,
}

impl Expression {
    pub fn new(root: Dex, output: FieldDescriptor) -> Self {
        Self { root, output }
    }
}
