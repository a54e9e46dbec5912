//! Narrow hooks for tests: bitmap intersection, generated bit access, and
//! compiling one expression without a schema or a full generator.

use std::sync::Arc;

use cranelift_codegen::ir::{types, AbiParam, InstBuilder};
use cranelift_frontend::FunctionBuilder;

use crate::bitmap::{get_packed_bit_value, set_packed_bit_value};
use crate::compiler::code_gen_expr_value;
use crate::config::GeneratorConfig;
use crate::context::ExecutionContext;
use crate::dex::Expression;
use crate::engine::{Engine, EngineBuilder};
use crate::error::BuildError;
use crate::generator::{build_engine, ValueFn};
use crate::registry::FunctionRegistry;
use crate::trace::TraceSink;
use crate::visitor::TraceContext;

pub use crate::bitmap::{and_bitmaps_in_place, intersect_bitmaps};

/// One compiled expression with its own module.
pub struct SingleExpr {
    _engine: Engine,
    _trace: Option<TraceContext>,
    func: ValueFn,
    pub bitmap_sources: Vec<usize>,
    pub ir: Option<String>,
    pub sink: Arc<TraceSink>,
}

impl SingleExpr {
    /// Run the function over raw slot addresses. Returns the status and the
    /// context the primitives wrote into.
    ///
    /// # Safety
    ///
    /// `addrs` must cover every slot the expression reads or writes, each
    /// buffer sized for `record_count` rows.
    pub unsafe fn call(&self, addrs: &[*mut u8], record_count: usize) -> (i32, ExecutionContext) {
        let mut ctx = ExecutionContext::new();
        let status = (self.func)(addrs.as_ptr(), record_count as i64, &mut ctx);
        (status, ctx)
    }
}

/// Compile `expr` into a fresh module.
pub fn compile_expression(
    registry: &FunctionRegistry,
    expr: &Expression,
    config: GeneratorConfig,
) -> Result<SingleExpr, BuildError> {
    let mut engine = build_engine(registry, config.optimize)?;

    let sink = Arc::new(TraceSink::new());
    let mut trace = config.trace.then(|| TraceContext {
        sink: Arc::as_ptr(&sink),
        messages: Vec::new(),
    });
    let function =
        code_gen_expr_value(&mut engine, registry, trace.as_mut(), expr, 0, config.dump_ir)?;
    engine.finalize()?;
    let ptr = engine
        .finalized_function(function.func_id)
        .ok_or_else(|| BuildError::Module("function pointer unavailable".into()))?;

    Ok(SingleExpr {
        func: unsafe { std::mem::transmute::<*const u8, ValueFn>(ptr) },
        _engine: engine,
        _trace: trace,
        bitmap_sources: function.bitmap_sources,
        ir: function.ir,
        sink,
    })
}

type BitAccessFn = unsafe extern "C" fn(*mut u8, i64, u8) -> u8;

/// The generated bit accessors wrapped in one function that reads the bit at
/// a position and then overwrites it.
pub struct BitAccess {
    _engine: Engine,
    func: BitAccessFn,
}

impl BitAccess {
    pub fn compile() -> Result<Self, BuildError> {
        let mut engine = EngineBuilder::new().build()?;
        let ptr = engine.pointer_type();
        let mut sig = engine.make_signature();
        sig.params.push(AbiParam::new(ptr));
        sig.params.push(AbiParam::new(types::I64));
        sig.params.push(AbiParam::new(types::I8));
        sig.returns.push(AbiParam::new(types::I8));

        let id = engine.declare_function("bit_access", &sig)?;
        let mut ctx = engine.make_context(id, sig);
        {
            let (_, fbc) = engine.begin_function();
            let mut builder = FunctionBuilder::new(&mut ctx.func, fbc);
            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            builder.seal_block(entry);
            let params = builder.block_params(entry).to_vec();
            let old = get_packed_bit_value(&mut builder, params[0], params[1]);
            set_packed_bit_value(&mut builder, params[0], params[1], params[2]);
            builder.ins().return_(&[old]);
            builder.finalize();
        }
        engine.define_function(id, &mut ctx)?;
        engine.finalize()?;
        let ptr = engine
            .finalized_function(id)
            .ok_or_else(|| BuildError::Module("function pointer unavailable".into()))?;

        Ok(Self {
            func: unsafe { std::mem::transmute::<*const u8, BitAccessFn>(ptr) },
            _engine: engine,
        })
    }

    /// Set bit `pos` of `bitmap` to `value` and return its previous state.
    ///
    /// # Panics
    ///
    /// If `pos` is outside `bitmap`.
    pub fn set(&self, bitmap: &mut [u8], pos: usize, value: bool) -> bool {
        assert!(pos < bitmap.len() * 8, "bit {pos} outside a {}-byte bitmap", bitmap.len());
        // Safety: `pos` addresses a byte inside `bitmap`.
        unsafe { (self.func)(bitmap.as_mut_ptr(), pos as i64, value as u8) != 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::get_bit;
    use crate::dex::{Dex, FieldDescriptor};
    use crate::types::{Literal, ScalarType};
    use proptest::prelude::*;

    #[test]
    fn test_single_literal_with_trace() {
        let registry = FunctionRegistry::with_defaults();
        let output = FieldDescriptor {
            name: "out".into(),
            ty: ScalarType::Int32,
            nullable: true,
            validity_idx: 0,
            data_idx: 1,
        };
        let expr = Expression::new(Dex::literal(Literal::Int32(42)), output);
        let single = compile_expression(
            &registry,
            &expr,
            GeneratorConfig::default().with_trace(true),
        )
        .unwrap();
        assert!(single.bitmap_sources.is_empty());

        let mut validity = [0u8];
        let mut data = [0i32; 2];
        let addrs = [validity.as_mut_ptr(), data.as_mut_ptr() as *mut u8];
        let (status, _) = unsafe { single.call(&addrs, 2) };
        assert_eq!(status, 0);
        assert_eq!(data, [42, 42]);

        let events = single.sink.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "literal 42");
    }

    proptest! {
        #[test]
        fn generated_set_touches_one_bit(
            bitmap in prop::collection::vec(any::<u8>(), 1..40),
            pos_seed in any::<usize>(),
            value in any::<bool>(),
        ) {
            let access = BitAccess::compile().unwrap();
            let pos = pos_seed % (bitmap.len() * 8);
            let mut written = bitmap.clone();

            let old = access.set(&mut written, pos, value);
            prop_assert_eq!(old, get_bit(&bitmap, pos));
            for i in 0..bitmap.len() * 8 {
                let expected = if i == pos { value } else { get_bit(&bitmap, i) };
                prop_assert_eq!(get_bit(&written, i), expected, "bit {}", i);
            }
        }
    }
}
