//! Per-row code generation over one Dex tree.
//!
//! The visitor is created once per generated function, inside the loop body,
//! and walks the tree once. Each node yields an [`LValue`]; null propagation
//! is decided here:
//!
//! - `NonNullableFunc` ANDs the argument validities. Infallible primitives
//!   are called unconditionally and the result is ignored on invalid rows;
//!   fallible ones are branched around when the combined validity is false.
//! - `NullableNeverFunc` passes `(value, validity)` pairs and is always valid.
//! - With `hoist` set, validity of field reads reachable from the root through
//!   infallible `NonNullableFunc` nodes is left to the batch-level bitmap
//!   merge instead of being loaded per row.

use std::collections::HashMap;
use std::ffi::CString;

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, AbiParam, Block, FuncRef, InstBuilder, MemFlags, Value};
use cranelift_frontend::FunctionBuilder;

use crate::bitmap::get_packed_bit_value;
use crate::context::ExecutionContext;
use crate::dex::{full_name, Dex, FieldDescriptor, FuncDescriptor};
use crate::engine::Linker;
use crate::error::BuildError;
use crate::lvalue::LValue;
use crate::registry::{FunctionRegistry, NullHandling, PrimitiveDescriptor};
use crate::trace::{escape_trace_text, replace_format_in_trace, TracePrintFn, TraceSink};
use crate::types::{Literal, ScalarType};

/// Trace state shared by every function of one build.
pub struct TraceContext {
    pub sink: *const TraceSink,
    /// Owns the NUL-terminated messages baked into generated code.
    pub messages: Vec<CString>,
}

// Safety: the sink is only read through its mutex, and the messages are
// immutable once code referencing them has been generated.
unsafe impl Send for TraceContext {}
unsafe impl Sync for TraceContext {}

pub struct Visitor<'a, 'b, 'l> {
    builder: &'a mut FunctionBuilder<'b>,
    linker: &'a mut Linker<'l>,
    registry: &'a FunctionRegistry,
    /// Buffer base addresses loaded in the entry block, by slot.
    buffers: &'a HashMap<usize, Value>,
    row: Value,
    exec_ctx: Value,
    trace: Option<&'a mut TraceContext>,
    func_refs: HashMap<String, FuncRef>,
    error_block: Option<Block>,
    hoisted: Vec<usize>,
}

impl<'a, 'b, 'l> Visitor<'a, 'b, 'l> {
    pub fn new(
        builder: &'a mut FunctionBuilder<'b>,
        linker: &'a mut Linker<'l>,
        registry: &'a FunctionRegistry,
        buffers: &'a HashMap<usize, Value>,
        row: Value,
        exec_ctx: Value,
        trace: Option<&'a mut TraceContext>,
    ) -> Self {
        Self {
            builder,
            linker,
            registry,
            buffers,
            row,
            exec_ctx,
            trace,
            func_refs: HashMap::new(),
            error_block: None,
            hoisted: Vec::new(),
        }
    }

    /// Validity slots moved to the batch-level merge, in first-seen order.
    pub fn hoisted_validity(&self) -> &[usize] {
        &self.hoisted
    }

    /// Block taking an I32 status that fallible calls branch to on failure,
    /// if any fallible call was emitted.
    pub fn error_block(&self) -> Option<Block> {
        self.error_block
    }

    /// The builder, positioned wherever the last node left it.
    pub fn builder(&mut self) -> &mut FunctionBuilder<'b> {
        &mut *self.builder
    }

    pub fn visit(&mut self, dex: &Dex, hoist: bool) -> Result<LValue, BuildError> {
        match dex {
            Dex::VectorReadValidity { field } => self.visit_read_validity(field),
            Dex::VectorReadValue { field } => self.visit_read_value(field, hoist),
            Dex::Literal { value } => self.visit_literal(value),
            Dex::NonNullableFunc { func, args } => self.visit_non_nullable(func, args, hoist),
            Dex::NullableNeverFunc { func, args } => self.visit_nullable_never(func, args),
        }
    }

    fn visit_read_validity(&mut self, field: &FieldDescriptor) -> Result<LValue, BuildError> {
        let bit = if field.nullable {
            let bitmap = self.buffer(field, field.validity_idx)?;
            get_packed_bit_value(self.builder, bitmap, self.row)
        } else {
            self.builder.ins().iconst(types::I8, 1)
        };
        let result = LValue::always_valid(bit, ScalarType::Boolean);
        let msg = format!("{} validity %T", escape_trace_text(&field.name));
        self.add_trace(&msg, &result)?;
        Ok(result)
    }

    fn visit_read_value(
        &mut self,
        field: &FieldDescriptor,
        hoist: bool,
    ) -> Result<LValue, BuildError> {
        let data = self.buffer(field, field.data_idx)?;
        let value = match field.ty.byte_width() {
            None => get_packed_bit_value(self.builder, data, self.row),
            Some(width) => {
                let offset = self.builder.ins().imul_imm(self.row, width as i64);
                let addr = self.builder.ins().iadd(data, offset);
                self.builder
                    .ins()
                    .load(field.ty.clif_type(), MemFlags::trusted(), addr, 0)
            }
        };

        let validity = if !field.nullable {
            None
        } else if hoist {
            if !self.hoisted.contains(&field.validity_idx) {
                self.hoisted.push(field.validity_idx);
            }
            None
        } else {
            let bitmap = self.buffer(field, field.validity_idx)?;
            Some(get_packed_bit_value(self.builder, bitmap, self.row))
        };

        let result = LValue::new(value, validity, field.ty);
        let msg = format!("{} value %T", escape_trace_text(&field.name));
        self.add_trace(&msg, &result)?;
        Ok(result)
    }

    fn visit_literal(&mut self, literal: &Literal) -> Result<LValue, BuildError> {
        let ty = literal.scalar_type();
        let value = match *literal {
            Literal::Float32(v) => self.builder.ins().f32const(v),
            Literal::Float64(v) => self.builder.ins().f64const(v),
            _ => {
                let imm = literal.int_imm().unwrap_or_default();
                self.builder.ins().iconst(ty.clif_type(), imm)
            }
        };
        let result = LValue::always_valid(value, ty);
        self.add_trace("literal %T", &result)?;
        Ok(result)
    }

    fn visit_non_nullable(
        &mut self,
        func: &FuncDescriptor,
        args: &[Dex],
        hoist: bool,
    ) -> Result<LValue, BuildError> {
        let primitive = self.resolve(func, args, NullHandling::ResultNullIfNull)?;
        let hoist_args = hoist && !primitive.fallible;

        let mut lvalues = Vec::with_capacity(args.len());
        for arg in args {
            lvalues.push(self.visit(arg, hoist_args)?);
        }
        let validity = self.build_combined_validity(&lvalues);
        let values: Vec<Value> = lvalues.iter().map(|lv| lv.value).collect();

        let value = match (primitive.fallible, validity) {
            (true, Some(valid)) => self.guarded_call(primitive, func.return_type, &values, valid)?,
            _ => self.add_function_call(primitive, func.return_type, &values)?,
        };

        let result = LValue::new(value, validity, func.return_type);
        let msg = format!("{} result %T", escape_trace_text(primitive.full_name()));
        self.add_trace(&msg, &result)?;
        Ok(result)
    }

    fn visit_nullable_never(
        &mut self,
        func: &FuncDescriptor,
        args: &[Dex],
    ) -> Result<LValue, BuildError> {
        let primitive = self.resolve(func, args, NullHandling::ResultNullNever)?;

        let mut values = Vec::with_capacity(args.len() * 2);
        for arg in args {
            let lv = self.visit(arg, false)?;
            let valid = match lv.validity {
                Some(v) => v,
                None => self.builder.ins().iconst(types::I8, 1),
            };
            values.push(lv.value);
            values.push(valid);
        }

        let value = self.add_function_call(primitive, func.return_type, &values)?;
        let result = LValue::always_valid(value, func.return_type);
        let msg = format!("{} result %T", escape_trace_text(primitive.full_name()));
        self.add_trace(&msg, &result)?;
        Ok(result)
    }

    /// Bitwise AND of the per-row validities. `None` if every input is
    /// statically valid.
    fn build_combined_validity(&mut self, lvalues: &[LValue]) -> Option<Value> {
        lvalues
            .iter()
            .filter_map(|lv| lv.validity)
            .reduce(|acc, v| self.builder.ins().band(acc, v))
    }

    fn resolve(
        &self,
        func: &FuncDescriptor,
        args: &[Dex],
        expected: NullHandling,
    ) -> Result<&'a PrimitiveDescriptor, BuildError> {
        let registry: &'a FunctionRegistry = self.registry;
        let arg_types: Vec<ScalarType> = args.iter().map(Dex::result_type).collect();
        let name = full_name(&func.name, &arg_types);
        let primitive = registry
            .lookup(&name)
            .ok_or_else(|| BuildError::UnknownFunction(name.clone()))?;
        if primitive.null_handling != expected {
            return Err(BuildError::SignatureMismatch {
                name,
                detail: format!(
                    "registered as {:?}, called as {expected:?}",
                    primitive.null_handling
                ),
            });
        }
        Ok(primitive)
    }

    /// Emit a call to `primitive` with `args` (the execution context is
    /// prepended for fallible primitives). Arity and types are checked
    /// against the registered signature.
    pub fn add_function_call(
        &mut self,
        primitive: &PrimitiveDescriptor,
        ret_type: ScalarType,
        args: &[Value],
    ) -> Result<Value, BuildError> {
        let name = primitive.full_name();
        if primitive.return_type != ret_type {
            return Err(BuildError::SignatureMismatch {
                name: name.to_string(),
                detail: format!("returns {}, expected {ret_type}", primitive.return_type),
            });
        }

        let ptr_type = self.linker.pointer_type();
        let sig = primitive.signature(self.linker.make_signature(), ptr_type);
        let mut call_args = Vec::with_capacity(args.len() + 1);
        if primitive.fallible {
            call_args.push(self.exec_ctx);
        }
        call_args.extend_from_slice(args);

        if sig.params.len() != call_args.len() {
            return Err(BuildError::SignatureMismatch {
                name: name.to_string(),
                detail: format!(
                    "expects {} arguments, got {}",
                    sig.params.len(),
                    call_args.len()
                ),
            });
        }
        for (i, (param, &arg)) in sig.params.iter().zip(&call_args).enumerate() {
            let actual = self.builder.func.dfg.value_type(arg);
            if param.value_type != actual {
                return Err(BuildError::SignatureMismatch {
                    name: name.to_string(),
                    detail: format!("argument {i} is {actual}, expected {}", param.value_type),
                });
            }
        }

        let func_ref = self.func_ref(name, &sig)?;
        let call = self.builder.ins().call(func_ref, &call_args);
        let result = self.builder.inst_results(call)[0];

        if primitive.fallible {
            self.check_error()?;
        }
        Ok(result)
    }

    /// Call a fallible primitive only on rows where `valid` is set; other
    /// rows see a zero result.
    fn guarded_call(
        &mut self,
        primitive: &PrimitiveDescriptor,
        ret_type: ScalarType,
        args: &[Value],
        valid: Value,
    ) -> Result<Value, BuildError> {
        let call_block = self.builder.create_block();
        let merge_block = self.builder.create_block();
        let result = self
            .builder
            .append_block_param(merge_block, ret_type.clif_type());

        let zero = self.zero(ret_type);
        self.builder
            .ins()
            .brif(valid, call_block, &[], merge_block, &[zero]);

        self.builder.switch_to_block(call_block);
        self.builder.seal_block(call_block);
        let value = self.add_function_call(primitive, ret_type, args)?;
        self.builder.ins().jump(merge_block, &[value]);

        self.builder.switch_to_block(merge_block);
        self.builder.seal_block(merge_block);
        Ok(result)
    }

    /// After a fallible call: leave through the error block if the context
    /// reports a failure.
    fn check_error(&mut self) -> Result<(), BuildError> {
        let error_block = match self.error_block {
            Some(b) => b,
            None => {
                let b = self.builder.create_block();
                self.builder.append_block_param(b, types::I32);
                self.error_block = Some(b);
                b
            }
        };
        let status = self.builder.ins().load(
            types::I32,
            MemFlags::trusted(),
            self.exec_ctx,
            ExecutionContext::ERROR_CODE_OFFSET,
        );
        let failed = self.builder.ins().icmp_imm(IntCC::NotEqual, status, 0);
        let cont = self.builder.create_block();
        self.builder
            .ins()
            .brif(failed, error_block, &[status], cont, &[]);
        self.builder.switch_to_block(cont);
        self.builder.seal_block(cont);
        Ok(())
    }

    fn zero(&mut self, ty: ScalarType) -> Value {
        match ty {
            ScalarType::Float32 => self.builder.ins().f32const(0.0),
            ScalarType::Float64 => self.builder.ins().f64const(0.0),
            _ => self.builder.ins().iconst(ty.clif_type(), 0),
        }
    }

    fn func_ref(
        &mut self,
        symbol: &str,
        sig: &cranelift_codegen::ir::Signature,
    ) -> Result<FuncRef, BuildError> {
        if let Some(&f) = self.func_refs.get(symbol) {
            return Ok(f);
        }
        let f = self.linker.import(symbol, sig, self.builder.func)?;
        self.func_refs.insert(symbol.to_string(), f);
        Ok(f)
    }

    fn buffer(&self, field: &FieldDescriptor, slot: usize) -> Result<Value, BuildError> {
        self.buffers
            .get(&slot)
            .copied()
            .ok_or_else(|| BuildError::InvalidField {
                name: field.name.clone(),
                detail: format!("buffer slot {slot} was not loaded"),
            })
    }

    /// Emit a call to the print primitive for `msg`, with `%T` replaced by the
    /// specifier of the traced value's type. No-op when tracing is off.
    fn add_trace(&mut self, msg: &str, lv: &LValue) -> Result<(), BuildError> {
        let Some(trace) = self.trace.as_deref_mut() else {
            return Ok(());
        };
        let (text, print_fn) = replace_format_in_trace(msg, lv.ty);
        let text = CString::new(text).map_err(BuildError::codegen)?;
        let msg_addr = text.as_ptr() as i64;
        trace.messages.push(text);
        let sink_addr = trace.sink as i64;

        let ptr_type = self.linker.pointer_type();
        let mut sig = self.linker.make_signature();
        sig.params.push(AbiParam::new(ptr_type));
        sig.params.push(AbiParam::new(ptr_type));

        let (param_ty, arg) = match print_fn {
            TracePrintFn::Float => {
                let v = if lv.ty == ScalarType::Float32 {
                    self.builder.ins().fpromote(types::F64, lv.value)
                } else {
                    lv.value
                };
                (types::F64, v)
            }
            TracePrintFn::Signed if lv.ty != ScalarType::Boolean => {
                (types::I64, self.widen(lv.value, true))
            }
            _ => (types::I64, self.widen(lv.value, false)),
        };
        sig.params.push(AbiParam::new(param_ty));

        let args = [
            self.builder.ins().iconst(ptr_type, sink_addr),
            self.builder.ins().iconst(ptr_type, msg_addr),
            arg,
        ];

        let func_ref = self.func_ref(print_fn.symbol(), &sig)?;
        self.builder.ins().call(func_ref, &args);
        Ok(())
    }

    fn widen(&mut self, value: Value, signed: bool) -> Value {
        if self.builder.func.dfg.value_type(value) == types::I64 {
            value
        } else if signed {
            self.builder.ins().sextend(types::I64, value)
        } else {
            self.builder.ins().uextend(types::I64, value)
        }
    }
}
