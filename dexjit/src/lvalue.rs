//! Value/validity pair produced while generating code for one node.

use cranelift_codegen::ir::Value;

use crate::types::ScalarType;

/// SSA value of a node at the current row plus its validity flag.
///
/// `validity` is an I8 (0 or 1); `None` means the value is statically valid
/// at this point, either by nature (literals, null-never calls) or because
/// its validity was hoisted to the batch-level bitmap merge.
#[derive(Debug, Clone, Copy)]
pub struct LValue {
    pub value: Value,
    pub validity: Option<Value>,
    pub ty: ScalarType,
}

impl LValue {
    pub fn new(value: Value, validity: Option<Value>, ty: ScalarType) -> Self {
        Self {
            value,
            validity,
            ty,
        }
    }

    /// A value that is valid on every row.
    pub fn always_valid(value: Value, ty: ScalarType) -> Self {
        Self::new(value, None, ty)
    }
}
