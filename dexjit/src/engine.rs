//! JIT compilation engine: Cranelift module, symbols and function lifetimes.
//!
//! The `Engine` owns the Cranelift JIT module every generated function of a
//! generator is compiled into, plus the builder context reused across
//! functions. Primitive functions are registered as symbols at builder time
//! via `EngineBuilder::register_fn()`; generated code calls them through
//! Cranelift's normal call mechanism, bound at link time.

use std::collections::HashMap;

use cranelift_codegen::ir::{types, Function, FuncRef, Signature, UserFuncName};
use cranelift_codegen::Context;
use cranelift_frontend::FunctionBuilderContext;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};

use crate::detect::{build_isa, CpuCaps};
use crate::error::BuildError;

/// Builder for creating an engine with registered external functions.
///
/// External functions must be registered before engine creation because
/// Cranelift's JIT module resolves symbols at link time.
pub struct EngineBuilder {
    symbols: HashMap<String, usize>,
    optimize: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            symbols: HashMap::new(),
            optimize: true,
        }
    }

    /// Run Cranelift's optimizer (`opt_level=speed`) on generated functions.
    pub fn optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    /// Register an external function that generated code can call by name.
    ///
    /// # Safety
    ///
    /// The function pointer must remain valid for the lifetime of the engine.
    pub unsafe fn register_fn(mut self, name: &str, ptr: *const u8) -> Self {
        self.symbols.insert(name.to_string(), ptr as usize);
        self
    }

    /// Build the engine with all registered symbols.
    pub fn build(self) -> Result<Engine, BuildError> {
        let caps = CpuCaps::detect();
        let isa = build_isa(&caps, self.optimize)?;

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());

        // Addresses are kept as usize so the closure is Send.
        let symbols = self.symbols;
        builder.symbol_lookup_fn(Box::new(move |name| {
            symbols.get(name).map(|&addr| addr as *const u8)
        }));

        Ok(Engine {
            module: JITModule::new(builder),
            builder_ctx: FunctionBuilderContext::new(),
            imports: HashMap::new(),
            caps,
            finalized: false,
        })
    }
}

/// The compilation unit for one generator.
///
/// Holds a Cranelift `JITModule` (which owns the code pages) and the
/// imported-symbol table. Finalized code is immutable and callable from any
/// thread.
pub struct Engine {
    module: JITModule,
    builder_ctx: FunctionBuilderContext,
    imports: HashMap<String, FuncId>,

    /// CPU capabilities detected at engine creation.
    pub caps: CpuCaps,

    finalized: bool,
}

// Safety: after finalization the module's code pages are read-only and the
// engine is only mutated through `&mut self`.
unsafe impl Send for Engine {}
unsafe impl Sync for Engine {}

/// Resolves imported symbols into `FuncRef`s while a function is being built.
pub struct Linker<'a> {
    module: &'a mut JITModule,
    imports: &'a mut HashMap<String, FuncId>,
}

impl Linker<'_> {
    /// Declare `name` as an import (once per module) and reference it from
    /// `func`.
    pub fn import(
        &mut self,
        name: &str,
        sig: &Signature,
        func: &mut Function,
    ) -> Result<FuncRef, BuildError> {
        let id = match self.imports.get(name) {
            Some(&id) => id,
            None => {
                let id = self
                    .module
                    .declare_function(name, Linkage::Import, sig)
                    .map_err(BuildError::module)?;
                self.imports.insert(name.to_string(), id);
                id
            }
        };
        Ok(self.module.declare_func_in_func(id, func))
    }

    pub fn make_signature(&self) -> Signature {
        self.module.make_signature()
    }

    pub fn pointer_type(&self) -> types::Type {
        self.module.target_config().pointer_type()
    }
}

impl Engine {
    pub fn pointer_type(&self) -> types::Type {
        self.module.target_config().pointer_type()
    }

    pub fn make_signature(&self) -> Signature {
        self.module.make_signature()
    }

    /// Declare a function to be defined in this module.
    pub fn declare_function(&mut self, name: &str, sig: &Signature) -> Result<FuncId, BuildError> {
        self.module
            .declare_function(name, Linkage::Local, sig)
            .map_err(BuildError::module)
    }

    /// A fresh context whose function carries `id`'s name and `sig`.
    pub fn make_context(&mut self, id: FuncId, sig: Signature) -> Context {
        let mut ctx = self.module.make_context();
        ctx.func.signature = sig;
        ctx.func.name = UserFuncName::user(0, id.as_u32());
        ctx
    }

    /// Borrow the linker and the builder context together while emitting a
    /// function body.
    pub fn begin_function(&mut self) -> (Linker<'_>, &mut FunctionBuilderContext) {
        (
            Linker {
                module: &mut self.module,
                imports: &mut self.imports,
            },
            &mut self.builder_ctx,
        )
    }

    /// Compile a function body to machine code.
    pub fn define_function(&mut self, id: FuncId, ctx: &mut Context) -> Result<(), BuildError> {
        self.module
            .define_function(id, ctx)
            .map_err(|e| BuildError::Codegen(format!("{e:?}")))?;
        self.module.clear_context(ctx);
        Ok(())
    }

    /// Link everything defined so far; code pointers become available.
    pub fn finalize(&mut self) -> Result<(), BuildError> {
        self.module
            .finalize_definitions()
            .map_err(|e| BuildError::Module(format!("{e:?}")))?;
        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Code pointer of a finalized function.
    pub fn finalized_function(&self, id: FuncId) -> Option<*const u8> {
        self.finalized
            .then(|| self.module.get_finalized_function(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_codegen::ir::{AbiParam, InstBuilder};
    use cranelift_frontend::FunctionBuilder;

    extern "C" fn plus_one(x: i64) -> i64 {
        x + 1
    }

    #[test]
    fn test_define_call_import_and_finalize() {
        let mut engine = unsafe {
            EngineBuilder::new()
                .register_fn("plus_one", plus_one as *const u8)
                .build()
                .unwrap()
        };

        let mut sig = engine.make_signature();
        sig.params.push(AbiParam::new(types::I64));
        sig.returns.push(AbiParam::new(types::I64));

        let id = engine.declare_function("call_plus_one", &sig).unwrap();
        let mut ctx = engine.make_context(id, sig.clone());
        {
            let (mut linker, fbc) = engine.begin_function();
            let callee = linker.import("plus_one", &sig, &mut ctx.func).unwrap();
            let mut builder = FunctionBuilder::new(&mut ctx.func, fbc);
            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            builder.seal_block(entry);
            let x = builder.block_params(entry)[0];
            let call = builder.ins().call(callee, &[x]);
            let result = builder.inst_results(call)[0];
            builder.ins().return_(&[result]);
            builder.finalize();
        }
        engine.define_function(id, &mut ctx).unwrap();
        assert!(engine.finalized_function(id).is_none());
        engine.finalize().unwrap();

        let ptr = engine.finalized_function(id).unwrap();
        let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(ptr) };
        assert_eq!(f(41), 42);
    }
}
