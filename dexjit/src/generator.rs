//! Top-level generator: compiles every expression of a projection into one
//! JIT module and runs the compiled functions against record batches.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::{Field, SchemaRef};
use cranelift_module::FuncId;

use crate::annotator::{Annotator, EvalBuffers, OutputColumn};
use crate::bitmap::{and_bitmaps_in_place, intersect_bitmaps};
use crate::compiler::{code_gen_expr_value, ExprFunction};
use crate::config::GeneratorConfig;
use crate::context::{ExecutionContext, STATUS_OK};
use crate::dex::{Expression, FieldDescriptor};
use crate::engine::{Engine, EngineBuilder};
use crate::error::{BuildError, ExecError};
use crate::registry::FunctionRegistry;
use crate::trace::{TracePrintFn, TraceSink};
use crate::visitor::TraceContext;

/// Native signature of a generated expression function.
pub type ValueFn = unsafe extern "C" fn(
    addrs: *const *mut u8,
    record_count: i64,
    ctx: *mut ExecutionContext,
) -> i32;

/// Build artifact for one expression.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    output: FieldDescriptor,
    func: ValueFn,
    bitmap_sources: Vec<usize>,
}

impl CompiledExpr {
    pub fn output(&self) -> &FieldDescriptor {
        &self.output
    }

    /// Validity slots ANDed into the output validity after the function ran.
    pub fn bitmap_sources(&self) -> &[usize] {
        &self.bitmap_sources
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Built,
    /// A build error left the module unusable.
    Failed,
}

/// Owns the JIT module and every compiled expression.
///
/// `build` runs once; afterwards the generator is immutable and `execute`
/// may be called concurrently from several threads, each with its own
/// outputs.
pub struct Generator {
    engine: Engine,
    registry: FunctionRegistry,
    annotator: Annotator,
    config: GeneratorConfig,
    compiled_exprs: Vec<CompiledExpr>,
    trace_sink: Arc<TraceSink>,
    /// Messages baked into generated code; lives as long as the code.
    trace: Option<TraceContext>,
    ir: Vec<String>,
    state: State,
}

impl Generator {
    pub fn new(
        schema: SchemaRef,
        registry: FunctionRegistry,
        config: GeneratorConfig,
    ) -> Result<Self, BuildError> {
        let engine = build_engine(&registry, config.optimize)?;
        tracing::debug!(
            primitives = registry.len(),
            optimize = config.optimize,
            trace = config.trace,
            caps = ?engine.caps,
            "generator created"
        );

        Ok(Self {
            engine,
            registry,
            annotator: Annotator::new(schema),
            config,
            compiled_exprs: Vec::new(),
            trace_sink: Arc::new(TraceSink::new()),
            trace: None,
            ir: Vec::new(),
            state: State::Fresh,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn annotator(&self) -> &Annotator {
        &self.annotator
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Descriptor of an input column.
    pub fn input(&self, name: &str) -> Result<FieldDescriptor, BuildError> {
        self.annotator.input(name)
    }

    /// Declare the next output column. Outputs must be declared in the order
    /// their expressions are passed to [`Generator::build`].
    pub fn add_output(&mut self, field: &Field) -> Result<FieldDescriptor, BuildError> {
        if self.state != State::Fresh {
            return Err(BuildError::AlreadyBuilt);
        }
        self.annotator.add_output(field)
    }

    pub fn is_built(&self) -> bool {
        self.state == State::Built
    }

    pub fn compiled_exprs(&self) -> &[CompiledExpr] {
        &self.compiled_exprs
    }

    /// Events recorded by generated trace calls.
    pub fn trace_sink(&self) -> &Arc<TraceSink> {
        &self.trace_sink
    }

    /// CLIF text of every generated function, when `dump_ir` is set.
    pub fn ir(&self) -> &[String] {
        &self.ir
    }

    /// Compile `exprs` (one per declared output, in output order) and
    /// finalize the module. A failure leaves the generator unusable.
    pub fn build(&mut self, exprs: Vec<Expression>) -> Result<(), BuildError> {
        if self.state != State::Fresh {
            return Err(BuildError::AlreadyBuilt);
        }
        self.state = State::Failed;

        let expected = self.annotator.outputs().len();
        if exprs.len() != expected {
            return Err(BuildError::OutputCountMismatch {
                expected,
                actual: exprs.len(),
            });
        }

        let mut trace = self.config.trace.then(|| TraceContext {
            sink: Arc::as_ptr(&self.trace_sink),
            messages: Vec::new(),
        });

        let mut functions = Vec::with_capacity(exprs.len());
        for (idx, expr) in exprs.iter().enumerate() {
            let function = self.add(expr, idx, trace.as_mut())?;
            functions.push(function);
        }

        self.engine.finalize()?;

        let mut compiled = Vec::with_capacity(exprs.len());
        for (expr, function) in exprs.into_iter().zip(functions) {
            let func = self.value_fn(function.func_id)?;
            if let Some(ir) = function.ir {
                self.ir.push(ir);
            }
            compiled.push(CompiledExpr {
                output: expr.output,
                func,
                bitmap_sources: function.bitmap_sources,
            });
        }

        tracing::debug!(
            expressions = compiled.len(),
            trace_messages = trace.as_ref().map_or(0, |t| t.messages.len()),
            "module finalized"
        );
        self.compiled_exprs = compiled;
        self.trace = trace;
        self.state = State::Built;
        Ok(())
    }

    /// Generate the value function for one expression.
    fn add(
        &mut self,
        expr: &Expression,
        idx: usize,
        trace: Option<&mut TraceContext>,
    ) -> Result<ExprFunction, BuildError> {
        self.annotator.check_output(&expr.output)?;
        let declared = &self.annotator.outputs()[idx];
        if *declared != expr.output {
            return Err(BuildError::InvalidField {
                name: expr.output.name.clone(),
                detail: format!(
                    "expression {idx} does not match declared output `{}` ({})",
                    declared.name, declared.ty
                ),
            });
        }
        self.annotator.check_inputs(&expr.root)?;
        code_gen_expr_value(
            &mut self.engine,
            &self.registry,
            trace,
            expr,
            idx,
            self.config.dump_ir,
        )
    }

    fn value_fn(&self, id: FuncId) -> Result<ValueFn, BuildError> {
        let ptr = self
            .engine
            .finalized_function(id)
            .ok_or_else(|| BuildError::Module("function pointer unavailable".into()))?;
        // Safety: every expression function is generated with `expr_signature`.
        Ok(unsafe { std::mem::transmute::<*const u8, ValueFn>(ptr) })
    }

    /// Run every compiled expression over `batch`, writing into `outputs`
    /// (one per expression, in build order), then merge the output
    /// validity bitmaps.
    ///
    /// On a function failure the remaining expressions are skipped; outputs
    /// already written stay as they are and no bitmap merge runs.
    pub fn execute(
        &self,
        batch: &RecordBatch,
        outputs: &mut [OutputColumn],
    ) -> Result<(), ExecError> {
        if self.state != State::Built {
            return Err(ExecError::NotBuilt);
        }
        if outputs.len() != self.compiled_exprs.len() {
            return Err(ExecError::OutputCountMismatch {
                expected: self.compiled_exprs.len(),
                actual: outputs.len(),
            });
        }

        let buffers = self.annotator.prepare_buffers(batch, outputs)?;
        let record_count = buffers.record_count() as i64;

        for (expr_index, compiled) in self.compiled_exprs.iter().enumerate() {
            let mut ctx = ExecutionContext::new();
            tracing::trace!(
                expr_index,
                record_count,
                output = %compiled.output.name,
                "running expression"
            );
            // Safety: `buffers` holds an address for every slot the function
            // loads, each sized for `record_count` rows.
            let status = unsafe { (compiled.func)(buffers.addrs(), record_count, &mut ctx) };
            if status != STATUS_OK {
                let message = ctx.take_message().unwrap_or_default();
                tracing::warn!(expr_index, status, %message, "expression failed");
                return Err(ExecError::Function {
                    expr_index,
                    status,
                    message,
                });
            }
        }

        for compiled in &self.compiled_exprs {
            // Safety: sources are validity slots distinct from the output
            // slot, except the output slot itself which is handled in place.
            unsafe { compute_bitmaps_for_expr(compiled, &buffers) };
        }
        Ok(())
    }
}

/// Engine with every registry primitive and trace printer linkable.
pub(crate) fn build_engine(
    registry: &FunctionRegistry,
    optimize: bool,
) -> Result<Engine, BuildError> {
    let mut builder = EngineBuilder::new().optimize(optimize);
    // Safety: registry addresses are `extern "C"` functions with the
    // signatures their descriptors declare; the trace printers are statics.
    unsafe {
        for (name, addr) in registry.symbols() {
            builder = builder.register_fn(name, addr as *const u8);
        }
        for print_fn in TracePrintFn::ALL {
            builder = builder.register_fn(print_fn.symbol(), print_fn.addr());
        }
    }
    builder.build()
}

/// Derive the final validity of one output from its bitmap sources.
unsafe fn compute_bitmaps_for_expr(compiled: &CompiledExpr, buffers: &EvalBuffers<'_>) {
    let dst_slot = compiled.output.validity_idx;
    let record_count = buffers.record_count();
    let in_place = compiled.bitmap_sources.contains(&dst_slot);
    let sources: Vec<&[u8]> = compiled
        .bitmap_sources
        .iter()
        .filter(|&&slot| slot != dst_slot)
        .map(|&slot| buffers.bitmap(slot))
        .collect();
    let dst = buffers.bitmap_mut(dst_slot);
    if in_place {
        and_bitmaps_in_place(dst, &sources, record_count);
    } else {
        intersect_bitmaps(dst, &sources, record_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::{Dex, FuncDescriptor};
    use crate::types::{Literal, ScalarType};
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Schema};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Int32, true),
        ]))
    }

    fn make(config: GeneratorConfig) -> Generator {
        Generator::new(schema(), FunctionRegistry::with_defaults(), config).unwrap()
    }

    fn batch() -> RecordBatch {
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(Int32Array::from(vec![1, 2, 3])),
                Arc::new(Int32Array::from(vec![Some(10), None, Some(30)])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_execute_before_build() {
        let g = make(GeneratorConfig::default());
        let err = g.execute(&batch(), &mut []).unwrap_err();
        assert!(matches!(err, ExecError::NotBuilt));
    }

    #[test]
    fn test_second_build_rejected() {
        let mut g = make(GeneratorConfig::default());
        g.build(Vec::new()).unwrap();
        assert!(matches!(g.build(Vec::new()), Err(BuildError::AlreadyBuilt)));
        assert!(matches!(
            g.add_output(&Field::new("x", DataType::Int32, true)),
            Err(BuildError::AlreadyBuilt)
        ));
    }

    #[test]
    fn test_failed_build_is_not_executable() {
        let mut g = make(GeneratorConfig::default());
        let out = g.add_output(&Field::new("x", DataType::Int32, true)).unwrap();
        let expr = Expression::new(
            Dex::non_nullable(
                FuncDescriptor::new("nope", ScalarType::Int32),
                vec![Dex::literal(Literal::Int32(1))],
            ),
            out,
        );
        assert!(g.build(vec![expr]).is_err());
        assert!(!g.is_built());
        let mut outputs = vec![OutputColumn::new(ScalarType::Int32, 3)];
        assert!(matches!(
            g.execute(&batch(), &mut outputs),
            Err(ExecError::NotBuilt)
        ));
    }

    #[test]
    fn test_expression_count_must_match_outputs() {
        let mut g = make(GeneratorConfig::default());
        g.add_output(&Field::new("x", DataType::Int32, true)).unwrap();
        assert!(matches!(
            g.build(Vec::new()),
            Err(BuildError::OutputCountMismatch { expected: 1, actual: 0 })
        ));
    }

    #[test]
    fn test_hoisted_validity_is_intersected() {
        let mut g = make(GeneratorConfig::default().with_dump_ir(true));
        let a = g.input("a").unwrap();
        let b = g.input("b").unwrap();
        let out = g
            .add_output(&Field::new("lt", DataType::Boolean, true))
            .unwrap();
        let lt = Dex::non_nullable(
            FuncDescriptor::new("less_than", ScalarType::Boolean),
            vec![Dex::value(a), Dex::value(b)],
        );
        g.build(vec![Expression::new(lt, out)]).unwrap();
        assert_eq!(g.compiled_exprs()[0].bitmap_sources(), &[0, 2]);
        assert_eq!(g.ir().len(), 1);

        let mut outputs = vec![OutputColumn::new(ScalarType::Boolean, 3)];
        g.execute(&batch(), &mut outputs).unwrap();
        let out = &outputs[0];
        assert_eq!(out.data_bytes()[0] & 0b101, 0b101);
        assert!(out.is_valid(0));
        assert!(!out.is_valid(1));
        assert!(out.is_valid(2));
    }
}
