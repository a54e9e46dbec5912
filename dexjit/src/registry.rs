//! Catalog of precompiled primitives callable from generated code.
//!
//! Code generation only consumes lookups from here. Each primitive is an
//! `extern "C"` function whose address is handed to the JIT module as a
//! symbol before any code is generated.

use std::collections::HashMap;

use cranelift_codegen::ir::{types, AbiParam, Signature};

use crate::dex::full_name;
use crate::types::ScalarType;

/// How a primitive's result validity relates to its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullHandling {
    /// Result is null if any argument is null. Arguments are passed as values.
    ResultNullIfNull,
    /// Result is never null. Each argument is passed as `(value, validity: u8)`.
    ResultNullNever,
}

/// Signature and address of one primitive.
#[derive(Debug, Clone)]
pub struct PrimitiveDescriptor {
    pub base_name: String,
    pub param_types: Vec<ScalarType>,
    pub return_type: ScalarType,
    pub null_handling: NullHandling,
    /// Takes `*mut ExecutionContext` first and may report a failure on it.
    pub fallible: bool,
    /// Linker symbol, equal to the fully qualified name.
    pub symbol: String,
    addr: usize,
}

impl PrimitiveDescriptor {
    pub fn full_name(&self) -> &str {
        &self.symbol
    }

    pub fn addr(&self) -> *const u8 {
        self.addr as *const u8
    }

    /// Native call signature as seen from generated code.
    pub fn signature(&self, mut sig: Signature, ptr_type: types::Type) -> Signature {
        if self.fallible {
            sig.params.push(AbiParam::new(ptr_type));
        }
        for ty in &self.param_types {
            sig.params.push(ty.abi_param());
            if self.null_handling == NullHandling::ResultNullNever {
                sig.params.push(ScalarType::Boolean.abi_param());
            }
        }
        sig.returns.push(self.return_type.abi_param());
        sig
    }
}

/// Registry of primitives, keyed by fully qualified name.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    primitives: HashMap<String, PrimitiveDescriptor>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the stock arithmetic, comparison, cast and
    /// null-test primitives.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        crate::primitives::register_defaults(&mut registry);
        registry
    }

    /// Register a primitive. Replaces any previous entry with the same
    /// fully qualified name.
    ///
    /// # Safety
    ///
    /// `addr` must point to an `extern "C"` function whose signature matches
    /// the one described here (see [`PrimitiveDescriptor::signature`]), and
    /// must stay valid for as long as any generator built from this registry.
    pub unsafe fn register(
        &mut self,
        base_name: &str,
        param_types: &[ScalarType],
        return_type: ScalarType,
        null_handling: NullHandling,
        fallible: bool,
        addr: *const u8,
    ) -> &mut Self {
        let symbol = full_name(base_name, param_types);
        self.primitives.insert(
            symbol.clone(),
            PrimitiveDescriptor {
                base_name: base_name.to_string(),
                param_types: param_types.to_vec(),
                return_type,
                null_handling,
                fallible,
                symbol,
                addr: addr as usize,
            },
        );
        self
    }

    pub fn lookup(&self, full_name: &str) -> Option<&PrimitiveDescriptor> {
        self.primitives.get(full_name)
    }

    pub fn lookup_signature(
        &self,
        base_name: &str,
        params: &[ScalarType],
    ) -> Option<&PrimitiveDescriptor> {
        self.lookup(&full_name(base_name, params))
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    /// `(symbol, address)` pairs for the JIT symbol table.
    pub(crate) fn symbols(&self) -> impl Iterator<Item = (&str, usize)> {
        self.primitives
            .values()
            .map(|p| (p.symbol.as_str(), p.addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn twice(x: i32) -> i32 {
        x.wrapping_mul(2)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = FunctionRegistry::new();
        unsafe {
            registry.register(
                "twice",
                &[ScalarType::Int32],
                ScalarType::Int32,
                NullHandling::ResultNullIfNull,
                false,
                twice as *const u8,
            );
        }
        let p = registry.lookup("twice_int32").unwrap();
        assert_eq!(p.return_type, ScalarType::Int32);
        assert!(registry
            .lookup_signature("twice", &[ScalarType::Int64])
            .is_none());
    }

    #[test]
    fn test_defaults_cover_arithmetic() {
        let registry = FunctionRegistry::with_defaults();
        for name in [
            "add_int32_int32",
            "divide_int64_int64",
            "less_than_float64_float64",
            "isnull_int32",
            "castBIGINT_int32",
        ] {
            assert!(registry.lookup(name).is_some(), "missing {name}");
        }
        assert!(registry.lookup("divide_int32_int32").unwrap().fallible);
        assert!(!registry.lookup("divide_float64_float64").unwrap().fallible);
    }

    #[test]
    fn test_null_never_signature_doubles_params() {
        let registry = FunctionRegistry::with_defaults();
        let p = registry.lookup("isnotnull_float64").unwrap();
        let sig = p.signature(
            Signature::new(cranelift_codegen::isa::CallConv::SystemV),
            types::I64,
        );
        assert_eq!(sig.params.len(), 2);
        assert_eq!(sig.returns.len(), 1);
    }
}
