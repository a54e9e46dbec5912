//! Field → buffer-slot layout and the per-call address array.
//!
//! Input column `k` of the schema owns slots `2k` (validity) and `2k + 1`
//! (data). Outputs are appended after the inputs in the order they are
//! added. The layout is fixed once a generator is built; every `execute`
//! call rebuilds only the address array.

use std::marker::PhantomData;

use arrow::array::{make_array, Array, ArrayData, ArrayRef, RecordBatch};
use arrow::buffer::MutableBuffer;
use arrow::datatypes::{ArrowNativeType, Field, SchemaRef};

use crate::bitmap::{bitmap_len, get_bit};
use crate::dex::{Dex, FieldDescriptor};
use crate::error::{BuildError, ExecError};
use crate::types::ScalarType;

/// Assigns buffer slots to input and output fields.
#[derive(Debug, Clone)]
pub struct Annotator {
    schema: SchemaRef,
    outputs: Vec<FieldDescriptor>,
}

impl Annotator {
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            outputs: Vec::new(),
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Descriptor of the input column `name`.
    pub fn input(&self, name: &str) -> Result<FieldDescriptor, BuildError> {
        let (k, field) = self
            .schema
            .column_with_name(name)
            .ok_or_else(|| BuildError::UnknownField(name.to_string()))?;
        Ok(FieldDescriptor {
            name: field.name().clone(),
            ty: ScalarType::from_arrow(field.data_type())?,
            nullable: field.is_nullable(),
            validity_idx: 2 * k,
            data_idx: 2 * k + 1,
        })
    }

    /// Reserve the slot pair for a new output column.
    pub fn add_output(&mut self, field: &Field) -> Result<FieldDescriptor, BuildError> {
        let base = self.num_slots();
        let desc = FieldDescriptor {
            name: field.name().clone(),
            ty: ScalarType::from_arrow(field.data_type())?,
            nullable: field.is_nullable(),
            validity_idx: base,
            data_idx: base + 1,
        };
        self.outputs.push(desc.clone());
        Ok(desc)
    }

    pub fn outputs(&self) -> &[FieldDescriptor] {
        &self.outputs
    }

    /// Total number of address slots.
    pub fn num_slots(&self) -> usize {
        2 * (self.schema.fields().len() + self.outputs.len())
    }

    /// Check that `desc` names a slot pair this layout owns.
    pub fn check_output(&self, desc: &FieldDescriptor) -> Result<(), BuildError> {
        let inputs = 2 * self.schema.fields().len();
        let in_range = desc.validity_idx >= inputs
            && desc.validity_idx % 2 == 0
            && desc.data_idx == desc.validity_idx + 1
            && desc.data_idx < self.num_slots();
        if in_range {
            Ok(())
        } else {
            Err(BuildError::InvalidField {
                name: desc.name.clone(),
                detail: format!(
                    "slots ({}, {}) are not an output pair of this layout",
                    desc.validity_idx, desc.data_idx
                ),
            })
        }
    }

    /// Check that every column read in `dex` is exactly the descriptor this
    /// layout hands out for that column.
    pub fn check_inputs(&self, dex: &Dex) -> Result<(), BuildError> {
        match dex {
            Dex::VectorReadValidity { field } | Dex::VectorReadValue { field } => {
                let expected = self.input(&field.name)?;
                if expected != *field {
                    return Err(BuildError::InvalidField {
                        name: field.name.clone(),
                        detail: format!(
                            "descriptor ({}, nullable={}, slots {}/{}) differs from \
                             the schema's ({}, nullable={}, slots {}/{})",
                            field.ty,
                            field.nullable,
                            field.validity_idx,
                            field.data_idx,
                            expected.ty,
                            expected.nullable,
                            expected.validity_idx,
                            expected.data_idx
                        ),
                    });
                }
                Ok(())
            }
            Dex::Literal { .. } => Ok(()),
            Dex::NonNullableFunc { args, .. } | Dex::NullableNeverFunc { args, .. } => {
                args.iter().try_for_each(|arg| self.check_inputs(arg))
            }
        }
    }

    /// Flat address array for one call.
    ///
    /// Columns without a null buffer point at a shared all-ones bitmap.
    /// Columns whose type generated code cannot read get null addresses; no
    /// generated function references them.
    pub fn prepare_buffers<'a>(
        &self,
        batch: &'a RecordBatch,
        outputs: &'a mut [OutputColumn],
    ) -> Result<EvalBuffers<'a>, ExecError> {
        let record_count = batch.num_rows();
        let fields = self.schema.fields();
        if batch.num_columns() != fields.len() {
            return Err(ExecError::InputMismatch(format!(
                "expected {} columns, got {}",
                fields.len(),
                batch.num_columns()
            )));
        }
        if outputs.len() != self.outputs.len() {
            return Err(ExecError::OutputCountMismatch {
                expected: self.outputs.len(),
                actual: outputs.len(),
            });
        }

        let all_ones = vec![0xFFu8; bitmap_len(record_count)];
        let mut addrs = Vec::with_capacity(self.num_slots());

        for (field, column) in fields.iter().zip(batch.columns()) {
            if column.data_type() != field.data_type() {
                return Err(ExecError::InputMismatch(format!(
                    "column `{}` is {}, expected {}",
                    field.name(),
                    column.data_type(),
                    field.data_type()
                )));
            }
            if ScalarType::from_arrow(field.data_type()).is_err() {
                addrs.push(std::ptr::null_mut());
                addrs.push(std::ptr::null_mut());
                continue;
            }

            let data = column.to_data();
            if data.offset() != 0 {
                return Err(ExecError::UnsupportedOffset(field.name().clone()));
            }
            let validity = match data.nulls() {
                Some(nulls) if nulls.offset() != 0 => {
                    return Err(ExecError::UnsupportedOffset(field.name().clone()))
                }
                Some(nulls) => nulls.buffer().as_ptr(),
                None => all_ones.as_ptr(),
            };
            addrs.push(validity as *mut u8);
            addrs.push(data.buffers()[0].as_ptr() as *mut u8);
        }

        for (index, (desc, out)) in self.outputs.iter().zip(outputs.iter_mut()).enumerate() {
            if out.ty != desc.ty {
                return Err(ExecError::OutputMismatch {
                    index,
                    detail: format!("column is {}, expected {}", out.ty, desc.ty),
                });
            }
            if out.capacity < record_count {
                return Err(ExecError::OutputMismatch {
                    index,
                    detail: format!(
                        "capacity {} is less than {record_count} rows",
                        out.capacity
                    ),
                });
            }
            addrs.push(out.validity.as_mut_ptr());
            addrs.push(out.data.as_mut_ptr());
        }

        Ok(EvalBuffers {
            addrs,
            record_count,
            _all_ones: all_ones,
            _borrow: PhantomData,
        })
    }
}

/// Address array handed to generated functions. Borrows the batch and the
/// outputs it points into.
pub struct EvalBuffers<'a> {
    addrs: Vec<*mut u8>,
    record_count: usize,
    _all_ones: Vec<u8>,
    _borrow: PhantomData<(&'a RecordBatch, &'a mut [OutputColumn])>,
}

impl EvalBuffers<'_> {
    pub fn addrs(&self) -> *const *mut u8 {
        self.addrs.as_ptr()
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// The bitmap at `slot`, covering `record_count` bits.
    ///
    /// # Safety
    ///
    /// `slot` must be a validity slot, and no mutable view of it may be live.
    pub(crate) unsafe fn bitmap(&self, slot: usize) -> &[u8] {
        std::slice::from_raw_parts(self.addrs[slot], bitmap_len(self.record_count))
    }

    /// Mutable view of the output bitmap at `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must be an output validity slot with no other live view.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bitmap_mut(&self, slot: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.addrs[slot], bitmap_len(self.record_count))
    }
}

/// Caller-owned storage for one output column: a zeroed data buffer and a
/// zeroed validity bitmap sized for `capacity` rows.
#[derive(Debug)]
pub struct OutputColumn {
    ty: ScalarType,
    capacity: usize,
    data: MutableBuffer,
    validity: MutableBuffer,
}

impl OutputColumn {
    pub fn new(ty: ScalarType, capacity: usize) -> Self {
        Self {
            ty,
            capacity,
            data: MutableBuffer::from_len_zeroed(ty.buffer_len(capacity)),
            validity: MutableBuffer::from_len_zeroed(bitmap_len(capacity)),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.ty
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn validity_bitmap(&self) -> &[u8] {
        self.validity.as_slice()
    }

    pub fn is_valid(&self, row: usize) -> bool {
        get_bit(self.validity.as_slice(), row)
    }

    /// Fixed-width values. Booleans are bit-packed; read them through
    /// [`OutputColumn::data_bytes`] or convert with [`OutputColumn::into_array`].
    pub fn values<T: ArrowNativeType>(&self) -> &[T] {
        self.data.typed_data::<T>()
    }

    pub fn data_bytes(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Freeze the first `len` rows into an Arrow array.
    pub fn into_array(self, len: usize) -> Result<ArrayRef, ExecError> {
        let data = ArrayData::builder(self.ty.to_arrow())
            .len(len)
            .add_buffer(self.data.into())
            .null_bit_buffer(Some(self.validity.into()))
            .build()?;
        Ok(make_array(data))
    }
}
