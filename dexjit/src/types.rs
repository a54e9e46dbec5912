//! Scalar types understood by generated code and their machine mapping.
//!
//! Every type maps to exactly one Cranelift type. Booleans travel through
//! generated code as `I8` holding 0 or 1 and are stored bit-packed, the same
//! way validity bitmaps are.

use std::fmt;

use arrow::datatypes::DataType;
use cranelift_codegen::ir::{types, AbiParam, Type};
use serde::{Deserialize, Serialize};

use crate::error::BuildError;

/// Fixed-width scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl ScalarType {
    pub const ALL: [ScalarType; 11] = [
        ScalarType::Boolean,
        ScalarType::Int8,
        ScalarType::Int16,
        ScalarType::Int32,
        ScalarType::Int64,
        ScalarType::UInt8,
        ScalarType::UInt16,
        ScalarType::UInt32,
        ScalarType::UInt64,
        ScalarType::Float32,
        ScalarType::Float64,
    ];

    /// Name used when mangling primitive names, e.g. `add_int32_int32`.
    pub fn name(self) -> &'static str {
        match self {
            ScalarType::Boolean => "boolean",
            ScalarType::Int8 => "int8",
            ScalarType::Int16 => "int16",
            ScalarType::Int32 => "int32",
            ScalarType::Int64 => "int64",
            ScalarType::UInt8 => "uint8",
            ScalarType::UInt16 => "uint16",
            ScalarType::UInt32 => "uint32",
            ScalarType::UInt64 => "uint64",
            ScalarType::Float32 => "float32",
            ScalarType::Float64 => "float64",
        }
    }

    pub fn clif_type(self) -> Type {
        match self {
            ScalarType::Boolean | ScalarType::Int8 | ScalarType::UInt8 => types::I8,
            ScalarType::Int16 | ScalarType::UInt16 => types::I16,
            ScalarType::Int32 | ScalarType::UInt32 => types::I32,
            ScalarType::Int64 | ScalarType::UInt64 => types::I64,
            ScalarType::Float32 => types::F32,
            ScalarType::Float64 => types::F64,
        }
    }

    /// Element width in bytes; `None` for bit-packed booleans.
    pub fn byte_width(self) -> Option<usize> {
        match self {
            ScalarType::Boolean => None,
            ScalarType::Int8 | ScalarType::UInt8 => Some(1),
            ScalarType::Int16 | ScalarType::UInt16 => Some(2),
            ScalarType::Int32 | ScalarType::UInt32 | ScalarType::Float32 => Some(4),
            ScalarType::Int64 | ScalarType::UInt64 | ScalarType::Float64 => Some(8),
        }
    }

    /// Bytes needed to hold `len` values of this type.
    pub fn buffer_len(self, len: usize) -> usize {
        match self.byte_width() {
            Some(w) => w * len,
            None => len.div_ceil(8),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::Float32 | ScalarType::Float64)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ScalarType::Int8 | ScalarType::Int16 | ScalarType::Int32 | ScalarType::Int64
        )
    }

    /// ABI parameter for passing this type to a primitive. Narrow integers are
    /// extended by the caller, as the C ABI expects.
    pub fn abi_param(self) -> AbiParam {
        let param = AbiParam::new(self.clif_type());
        match self {
            ScalarType::Int8 | ScalarType::Int16 => param.sext(),
            ScalarType::Boolean | ScalarType::UInt8 | ScalarType::UInt16 => param.uext(),
            _ => param,
        }
    }

    pub fn to_arrow(self) -> DataType {
        match self {
            ScalarType::Boolean => DataType::Boolean,
            ScalarType::Int8 => DataType::Int8,
            ScalarType::Int16 => DataType::Int16,
            ScalarType::Int32 => DataType::Int32,
            ScalarType::Int64 => DataType::Int64,
            ScalarType::UInt8 => DataType::UInt8,
            ScalarType::UInt16 => DataType::UInt16,
            ScalarType::UInt32 => DataType::UInt32,
            ScalarType::UInt64 => DataType::UInt64,
            ScalarType::Float32 => DataType::Float32,
            ScalarType::Float64 => DataType::Float64,
        }
    }

    pub fn from_arrow(dt: &DataType) -> Result<Self, BuildError> {
        Ok(match dt {
            DataType::Boolean => ScalarType::Boolean,
            DataType::Int8 => ScalarType::Int8,
            DataType::Int16 => ScalarType::Int16,
            DataType::Int32 => ScalarType::Int32,
            DataType::Int64 => ScalarType::Int64,
            DataType::UInt8 => ScalarType::UInt8,
            DataType::UInt16 => ScalarType::UInt16,
            DataType::UInt32 => ScalarType::UInt32,
            DataType::UInt64 => ScalarType::UInt64,
            DataType::Float32 => ScalarType::Float32,
            DataType::Float64 => ScalarType::Float64,
            other => return Err(BuildError::UnsupportedType(other.to_string())),
        })
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Literal {
    Boolean(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
}

impl Literal {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Literal::Boolean(_) => ScalarType::Boolean,
            Literal::Int8(_) => ScalarType::Int8,
            Literal::Int16(_) => ScalarType::Int16,
            Literal::Int32(_) => ScalarType::Int32,
            Literal::Int64(_) => ScalarType::Int64,
            Literal::UInt8(_) => ScalarType::UInt8,
            Literal::UInt16(_) => ScalarType::UInt16,
            Literal::UInt32(_) => ScalarType::UInt32,
            Literal::UInt64(_) => ScalarType::UInt64,
            Literal::Float32(_) => ScalarType::Float32,
            Literal::Float64(_) => ScalarType::Float64,
        }
    }

    /// Integer immediate, zero-extended to the width of the literal's
    /// Cranelift type. `None` for floats.
    pub(crate) fn int_imm(&self) -> Option<i64> {
        Some(match *self {
            Literal::Boolean(b) => b as i64,
            Literal::Int8(v) => v as u8 as i64,
            Literal::Int16(v) => v as u16 as i64,
            Literal::Int32(v) => v as u32 as i64,
            Literal::Int64(v) => v,
            Literal::UInt8(v) => v as i64,
            Literal::UInt16(v) => v as i64,
            Literal::UInt32(v) => v as i64,
            Literal::UInt64(v) => v as i64,
            Literal::Float32(_) | Literal::Float64(_) => return None,
        })
    }
}
