//! Row-loop generation for one expression.
//!
//! Every expression becomes one native function:
//!
//! ```text
//! fn expr_N(addrs: *const *mut u8, record_count: i64, ctx: *mut ExecutionContext) -> i32:
//!     <load every referenced buffer base from addrs>   // entry block, once
//!     for i in 0..record_count:
//!         lv = <visitor output for the Dex tree at row i>
//!         out_data[i] = lv.value                        // bit-packed for booleans
//!         set_bit(out_validity, i, lv.validity)         // only if not statically valid
//!     return 0
//! error(status):
//!     return status                                     // a fallible primitive failed
//! ```
//!
//! Validity that the visitor hoisted out of the loop is returned as a list of
//! bitmap slots; the generator ANDs them into the output validity after the
//! function has run.

use std::collections::{BTreeSet, HashMap};

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, AbiParam, InstBuilder, MemFlags, Signature};
use cranelift_frontend::{FunctionBuilder, Variable};
use cranelift_module::FuncId;

use crate::bitmap::set_packed_bit_value;
use crate::context::STATUS_OK;
use crate::dex::Expression;
use crate::engine::Engine;
use crate::error::BuildError;
use crate::registry::FunctionRegistry;
use crate::visitor::{TraceContext, Visitor};

/// Output of [`code_gen_expr_value`]: a defined (not yet finalized) function
/// and the bitmaps to AND into the output validity.
#[derive(Debug)]
pub struct ExprFunction {
    pub func_id: FuncId,
    /// Validity slots to intersect, output validity first when the loop
    /// writes per-row bits.
    pub bitmap_sources: Vec<usize>,
    /// CLIF text, when IR dumping is enabled.
    pub ir: Option<String>,
}

/// Signature shared by all generated expression functions.
pub fn expr_signature(engine: &Engine) -> Signature {
    let ptr_type = engine.pointer_type();
    let mut sig = engine.make_signature();
    sig.params.push(AbiParam::new(ptr_type)); // addrs
    sig.params.push(AbiParam::new(types::I64)); // record_count
    sig.params.push(AbiParam::new(ptr_type)); // ctx
    sig.returns.push(AbiParam::new(types::I32)); // status
    sig
}

/// Generate and define the value function for `expr`, named with
/// `suffix_idx` so several expressions can share one module.
pub fn code_gen_expr_value(
    engine: &mut Engine,
    registry: &FunctionRegistry,
    trace: Option<&mut TraceContext>,
    expr: &Expression,
    suffix_idx: usize,
    dump_ir: bool,
) -> Result<ExprFunction, BuildError> {
    let output = &expr.output;
    let found = expr.root.result_type();
    if found != output.ty {
        return Err(BuildError::TypeMismatch {
            name: output.name.clone(),
            expected: output.ty,
            found,
        });
    }

    let func_name = format!("expr_{suffix_idx}");
    let sig = expr_signature(engine);
    let func_id = engine.declare_function(&func_name, &sig)?;
    let mut ctx = engine.make_context(func_id, sig);
    let ptr_type = engine.pointer_type();

    let mut slots = BTreeSet::new();
    expr.root.buffer_slots(&mut slots);
    slots.insert(output.data_idx);
    slots.insert(output.validity_idx);

    let (mut linker, fbc) = engine.begin_function();
    let mut builder = FunctionBuilder::new(&mut ctx.func, fbc);

    let v_i = Variable::from_u32(0); // row index
    builder.declare_var(v_i, types::I64);

    // Entry block: parameters and buffer bases
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    builder.seal_block(entry);

    let addrs = builder.block_params(entry)[0];
    let record_count = builder.block_params(entry)[1];
    let exec_ctx = builder.block_params(entry)[2];

    let ptr_bytes = ptr_type.bytes() as i32;
    let mut buffers = HashMap::with_capacity(slots.len());
    for slot in slots {
        let offset = i32::try_from(slot)
            .ok()
            .and_then(|s| s.checked_mul(ptr_bytes))
            .ok_or_else(|| BuildError::InvalidField {
                name: output.name.clone(),
                detail: format!("buffer slot {slot} out of range"),
            })?;
        let base = builder
            .ins()
            .load(ptr_type, MemFlags::trusted().with_readonly(), addrs, offset);
        buffers.insert(slot, base);
    }

    let zero = builder.ins().iconst(types::I64, 0);
    builder.def_var(v_i, zero);

    let loop_header = builder.create_block();
    let loop_body = builder.create_block();
    let loop_exit = builder.create_block();

    builder.ins().jump(loop_header, &[]);

    // ── Loop header: i < record_count ──
    builder.switch_to_block(loop_header);
    let i = builder.use_var(v_i);
    let more = builder.ins().icmp(IntCC::SignedLessThan, i, record_count);
    builder.ins().brif(more, loop_body, &[], loop_exit, &[]);

    // ── Loop body ──
    builder.switch_to_block(loop_body);
    builder.seal_block(loop_body);
    let row = builder.use_var(v_i);

    let (lvalue, hoisted, error_block) = {
        let mut visitor = Visitor::new(
            &mut builder,
            &mut linker,
            registry,
            &buffers,
            row,
            exec_ctx,
            trace,
        );
        let lvalue = visitor.visit(&expr.root, true)?;
        (
            lvalue,
            visitor.hoisted_validity().to_vec(),
            visitor.error_block(),
        )
    };

    // Write the value
    let out_data = buffers[&output.data_idx];
    match output.ty.byte_width() {
        None => set_packed_bit_value(&mut builder, out_data, row, lvalue.value),
        Some(width) => {
            let offset = builder.ins().imul_imm(row, width as i64);
            let addr = builder.ins().iadd(out_data, offset);
            builder
                .ins()
                .store(MemFlags::trusted(), lvalue.value, addr, 0);
        }
    }

    // Write the per-row validity, if any survives hoisting
    let mut bitmap_sources = Vec::with_capacity(hoisted.len() + 1);
    if let Some(valid) = lvalue.validity {
        let out_validity = buffers[&output.validity_idx];
        set_packed_bit_value(&mut builder, out_validity, row, valid);
        bitmap_sources.push(output.validity_idx);
    }
    bitmap_sources.extend(hoisted);

    let next = builder.ins().iadd_imm(row, 1);
    builder.def_var(v_i, next);
    builder.ins().jump(loop_header, &[]);
    builder.seal_block(loop_header);

    // ── Loop exit ──
    builder.switch_to_block(loop_exit);
    builder.seal_block(loop_exit);
    let ok = builder.ins().iconst(types::I32, STATUS_OK as i64);
    builder.ins().return_(&[ok]);

    // ── Error exit: propagate the primitive's status ──
    if let Some(error_block) = error_block {
        builder.switch_to_block(error_block);
        builder.seal_block(error_block);
        let status = builder.block_params(error_block)[0];
        builder.ins().return_(&[status]);
    }

    builder.finalize();

    let ir = dump_ir.then(|| ctx.func.display().to_string());
    if let Some(text) = &ir {
        tracing::debug!(function = %func_name, "generated IR:\n{text}");
    }

    engine.define_function(func_id, &mut ctx)?;
    tracing::debug!(
        function = %func_name,
        output = %output.name,
        bitmap_sources = ?bitmap_sources,
        "expression compiled"
    );

    Ok(ExprFunction {
        func_id,
        bitmap_sources,
        ir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::dex::{Dex, FieldDescriptor, FuncDescriptor};
    use crate::types::{Literal, ScalarType};

    fn field(name: &str, ty: ScalarType, pair: usize, nullable: bool) -> FieldDescriptor {
        FieldDescriptor {
            name: name.into(),
            ty,
            nullable,
            validity_idx: 2 * pair,
            data_idx: 2 * pair + 1,
        }
    }

    fn engine_for(registry: &FunctionRegistry) -> Engine {
        crate::generator::build_engine(registry, true).unwrap()
    }

    type ExprFn = unsafe extern "C" fn(*const *mut u8, i64, *mut ExecutionContext) -> i32;

    #[test]
    fn test_add_hoists_field_validity() {
        let registry = FunctionRegistry::with_defaults();
        let mut engine = engine_for(&registry);

        let a = field("a", ScalarType::Int32, 0, true);
        let b = field("b", ScalarType::Int32, 1, true);
        let out = field("out", ScalarType::Int32, 2, true);
        let expr = Expression::new(
            Dex::non_nullable(
                FuncDescriptor::new("add", ScalarType::Int32),
                vec![Dex::value(a), Dex::value(b)],
            ),
            out,
        );

        let f = code_gen_expr_value(&mut engine, &registry, None, &expr, 0, true).unwrap();
        assert_eq!(f.bitmap_sources, vec![0, 2]);
        assert!(f.ir.as_deref().unwrap().contains("call"));

        engine.finalize().unwrap();
        let ptr = engine.finalized_function(f.func_id).unwrap();
        let func: ExprFn = unsafe { std::mem::transmute(ptr) };

        let mut a_valid = [0b111u8];
        let mut a_data = [1i32, 2, 3];
        let mut b_valid = [0b101u8];
        let mut b_data = [10i32, 20, 30];
        let mut o_valid = [0u8];
        let mut o_data = [0i32; 3];
        let addrs = [
            a_valid.as_mut_ptr(),
            a_data.as_mut_ptr() as *mut u8,
            b_valid.as_mut_ptr(),
            b_data.as_mut_ptr() as *mut u8,
            o_valid.as_mut_ptr(),
            o_data.as_mut_ptr() as *mut u8,
        ];
        let mut ctx = ExecutionContext::new();
        let status = unsafe { func(addrs.as_ptr(), 3, &mut ctx) };
        assert_eq!(status, 0);
        assert_eq!(o_data, [11, 22, 33]);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let registry = FunctionRegistry::with_defaults();
        let mut engine = engine_for(&registry);
        let expr = Expression::new(
            Dex::literal(Literal::Int64(1)),
            field("out", ScalarType::Int32, 0, true),
        );
        let err = code_gen_expr_value(&mut engine, &registry, None, &expr, 0, false).unwrap_err();
        assert!(matches!(err, BuildError::TypeMismatch { .. }));
    }

    #[test]
    fn test_unknown_function_rejected() {
        let registry = FunctionRegistry::with_defaults();
        let mut engine = engine_for(&registry);
        let expr = Expression::new(
            Dex::non_nullable(
                FuncDescriptor::new("power", ScalarType::Int32),
                vec![Dex::literal(Literal::Int32(2))],
            ),
            field("out", ScalarType::Int32, 0, true),
        );
        let err = code_gen_expr_value(&mut engine, &registry, None, &expr, 0, false).unwrap_err();
        assert!(matches!(err, BuildError::UnknownFunction(name) if name == "power_int32"));
    }
}
