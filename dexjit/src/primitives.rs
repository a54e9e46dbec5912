//! Stock primitives: arithmetic, comparisons, casts and null tests.
//!
//! Infallible null-if-null primitives are called on every row, including
//! rows whose inputs are null, so they must accept arbitrary bits (integer
//! arithmetic wraps). Fallible ones are only reached for valid rows.

use crate::context::{context_set_error, ExecutionContext};
use crate::registry::{FunctionRegistry, NullHandling};
use crate::types::ScalarType;

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

macro_rules! int_arith {
    ($($name:ident, $ty:ty, $op:ident;)*) => {
        $(
            pub extern "C" fn $name(a: $ty, b: $ty) -> $ty {
                a.$op(b)
            }
        )*
    };
}

macro_rules! float_arith {
    ($($name:ident, $ty:ty, $op:tt;)*) => {
        $(
            pub extern "C" fn $name(a: $ty, b: $ty) -> $ty {
                a $op b
            }
        )*
    };
}

macro_rules! int_divide {
    ($($name:ident, $ty:ty;)*) => {
        $(
            /// # Safety
            ///
            /// `ctx` must be the context pointer passed by generated code.
            pub unsafe extern "C" fn $name(ctx: *mut ExecutionContext, a: $ty, b: $ty) -> $ty {
                if b == 0 {
                    context_set_error(ctx, "divide by zero");
                    return 0;
                }
                a.wrapping_div(b)
            }
        )*
    };
}

int_arith! {
    add_int32_int32, i32, wrapping_add;
    add_int64_int64, i64, wrapping_add;
    subtract_int32_int32, i32, wrapping_sub;
    subtract_int64_int64, i64, wrapping_sub;
    multiply_int32_int32, i32, wrapping_mul;
    multiply_int64_int64, i64, wrapping_mul;
}

float_arith! {
    add_float32_float32, f32, +;
    add_float64_float64, f64, +;
    subtract_float32_float32, f32, -;
    subtract_float64_float64, f64, -;
    multiply_float32_float32, f32, *;
    multiply_float64_float64, f64, *;
    divide_float32_float32, f32, /;
    divide_float64_float64, f64, /;
}

int_divide! {
    divide_int32_int32, i32;
    divide_int64_int64, i64;
}

// ---------------------------------------------------------------------------
// Comparisons (boolean results are 0/1 bytes)
// ---------------------------------------------------------------------------

macro_rules! compare {
    ($($name:ident, $ty:ty, $op:tt;)*) => {
        $(
            pub extern "C" fn $name(a: $ty, b: $ty) -> u8 {
                (a $op b) as u8
            }
        )*
    };
}

// One comparison per numeric type, named `<op>_<ty>_<ty>`.
macro_rules! compare_numeric {
    (equal, $op:tt) => {
        compare! {
            equal_int32_int32, i32, $op; equal_int64_int64, i64, $op;
            equal_float32_float32, f32, $op; equal_float64_float64, f64, $op;
        }
    };
    (not_equal, $op:tt) => {
        compare! {
            not_equal_int32_int32, i32, $op; not_equal_int64_int64, i64, $op;
            not_equal_float32_float32, f32, $op; not_equal_float64_float64, f64, $op;
        }
    };
    (less_than, $op:tt) => {
        compare! {
            less_than_int32_int32, i32, $op; less_than_int64_int64, i64, $op;
            less_than_float32_float32, f32, $op; less_than_float64_float64, f64, $op;
        }
    };
    (less_than_or_equal_to, $op:tt) => {
        compare! {
            less_than_or_equal_to_int32_int32, i32, $op;
            less_than_or_equal_to_int64_int64, i64, $op;
            less_than_or_equal_to_float32_float32, f32, $op;
            less_than_or_equal_to_float64_float64, f64, $op;
        }
    };
    (greater_than, $op:tt) => {
        compare! {
            greater_than_int32_int32, i32, $op; greater_than_int64_int64, i64, $op;
            greater_than_float32_float32, f32, $op; greater_than_float64_float64, f64, $op;
        }
    };
    (greater_than_or_equal_to, $op:tt) => {
        compare! {
            greater_than_or_equal_to_int32_int32, i32, $op;
            greater_than_or_equal_to_int64_int64, i64, $op;
            greater_than_or_equal_to_float32_float32, f32, $op;
            greater_than_or_equal_to_float64_float64, f64, $op;
        }
    };
}

compare_numeric!(equal, ==);
compare_numeric!(not_equal, !=);
compare_numeric!(less_than, <);
compare_numeric!(less_than_or_equal_to, <=);
compare_numeric!(greater_than, >);
compare_numeric!(greater_than_or_equal_to, >=);

pub extern "C" fn not_boolean(a: u8) -> u8 {
    (a == 0) as u8
}

// ---------------------------------------------------------------------------
// Casts
// ---------------------------------------------------------------------------

pub extern "C" fn cast_bigint_int32(a: i32) -> i64 {
    a as i64
}

pub extern "C" fn cast_float8_int32(a: i32) -> f64 {
    a as f64
}

pub extern "C" fn cast_float8_int64(a: i64) -> f64 {
    a as f64
}

pub extern "C" fn cast_float8_float32(a: f32) -> f64 {
    a as f64
}

// ---------------------------------------------------------------------------
// Null tests: (value, validity) -> boolean, never null
// ---------------------------------------------------------------------------

macro_rules! null_tests {
    ($($isnull:ident, $isnotnull:ident, $ty:ty;)*) => {
        $(
            pub extern "C" fn $isnull(_value: $ty, valid: u8) -> u8 {
                (valid == 0) as u8
            }

            pub extern "C" fn $isnotnull(_value: $ty, valid: u8) -> u8 {
                (valid != 0) as u8
            }
        )*
    };
}

null_tests! {
    isnull_boolean, isnotnull_boolean, u8;
    isnull_int8, isnotnull_int8, i8;
    isnull_int16, isnotnull_int16, i16;
    isnull_int32, isnotnull_int32, i32;
    isnull_int64, isnotnull_int64, i64;
    isnull_uint8, isnotnull_uint8, u8;
    isnull_uint16, isnotnull_uint16, u16;
    isnull_uint32, isnotnull_uint32, u32;
    isnull_uint64, isnotnull_uint64, u64;
    isnull_float32, isnotnull_float32, f32;
    isnull_float64, isnotnull_float64, f64;
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

pub(crate) fn register_defaults(registry: &mut FunctionRegistry) {
    use NullHandling::{ResultNullIfNull as IfNull, ResultNullNever as Never};
    use ScalarType::*;

    let binary: &[(&str, ScalarType, ScalarType, bool, *const u8)] = &[
        ("add", Int32, Int32, false, add_int32_int32 as *const u8),
        ("add", Int64, Int64, false, add_int64_int64 as *const u8),
        ("add", Float32, Float32, false, add_float32_float32 as *const u8),
        ("add", Float64, Float64, false, add_float64_float64 as *const u8),
        ("subtract", Int32, Int32, false, subtract_int32_int32 as *const u8),
        ("subtract", Int64, Int64, false, subtract_int64_int64 as *const u8),
        ("subtract", Float32, Float32, false, subtract_float32_float32 as *const u8),
        ("subtract", Float64, Float64, false, subtract_float64_float64 as *const u8),
        ("multiply", Int32, Int32, false, multiply_int32_int32 as *const u8),
        ("multiply", Int64, Int64, false, multiply_int64_int64 as *const u8),
        ("multiply", Float32, Float32, false, multiply_float32_float32 as *const u8),
        ("multiply", Float64, Float64, false, multiply_float64_float64 as *const u8),
        ("divide", Int32, Int32, true, divide_int32_int32 as *const u8),
        ("divide", Int64, Int64, true, divide_int64_int64 as *const u8),
        ("divide", Float32, Float32, false, divide_float32_float32 as *const u8),
        ("divide", Float64, Float64, false, divide_float64_float64 as *const u8),
        ("equal", Int32, Boolean, false, equal_int32_int32 as *const u8),
        ("equal", Int64, Boolean, false, equal_int64_int64 as *const u8),
        ("equal", Float32, Boolean, false, equal_float32_float32 as *const u8),
        ("equal", Float64, Boolean, false, equal_float64_float64 as *const u8),
        ("not_equal", Int32, Boolean, false, not_equal_int32_int32 as *const u8),
        ("not_equal", Int64, Boolean, false, not_equal_int64_int64 as *const u8),
        ("not_equal", Float32, Boolean, false, not_equal_float32_float32 as *const u8),
        ("not_equal", Float64, Boolean, false, not_equal_float64_float64 as *const u8),
        ("less_than", Int32, Boolean, false, less_than_int32_int32 as *const u8),
        ("less_than", Int64, Boolean, false, less_than_int64_int64 as *const u8),
        ("less_than", Float32, Boolean, false, less_than_float32_float32 as *const u8),
        ("less_than", Float64, Boolean, false, less_than_float64_float64 as *const u8),
        (
            "less_than_or_equal_to",
            Int32,
            Boolean,
            false,
            less_than_or_equal_to_int32_int32 as *const u8,
        ),
        (
            "less_than_or_equal_to",
            Int64,
            Boolean,
            false,
            less_than_or_equal_to_int64_int64 as *const u8,
        ),
        (
            "less_than_or_equal_to",
            Float32,
            Boolean,
            false,
            less_than_or_equal_to_float32_float32 as *const u8,
        ),
        (
            "less_than_or_equal_to",
            Float64,
            Boolean,
            false,
            less_than_or_equal_to_float64_float64 as *const u8,
        ),
        ("greater_than", Int32, Boolean, false, greater_than_int32_int32 as *const u8),
        ("greater_than", Int64, Boolean, false, greater_than_int64_int64 as *const u8),
        ("greater_than", Float32, Boolean, false, greater_than_float32_float32 as *const u8),
        ("greater_than", Float64, Boolean, false, greater_than_float64_float64 as *const u8),
        (
            "greater_than_or_equal_to",
            Int32,
            Boolean,
            false,
            greater_than_or_equal_to_int32_int32 as *const u8,
        ),
        (
            "greater_than_or_equal_to",
            Int64,
            Boolean,
            false,
            greater_than_or_equal_to_int64_int64 as *const u8,
        ),
        (
            "greater_than_or_equal_to",
            Float32,
            Boolean,
            false,
            greater_than_or_equal_to_float32_float32 as *const u8,
        ),
        (
            "greater_than_or_equal_to",
            Float64,
            Boolean,
            false,
            greater_than_or_equal_to_float64_float64 as *const u8,
        ),
    ];

    // Safety: every address below is an `extern "C"` fn in this module whose
    // parameter and return types match the registered signature.
    unsafe {
        for &(name, arg, ret, fallible, addr) in binary {
            registry.register(name, &[arg, arg], ret, IfNull, fallible, addr);
        }

        let unary: &[(&str, ScalarType, ScalarType, *const u8)] = &[
            ("not", Boolean, Boolean, not_boolean as *const u8),
            ("castBIGINT", Int32, Int64, cast_bigint_int32 as *const u8),
            ("castFLOAT8", Int32, Float64, cast_float8_int32 as *const u8),
            ("castFLOAT8", Int64, Float64, cast_float8_int64 as *const u8),
            ("castFLOAT8", Float32, Float64, cast_float8_float32 as *const u8),
        ];
        for &(name, arg, ret, addr) in unary {
            registry.register(name, &[arg], ret, IfNull, false, addr);
        }

        let null_tests: &[(ScalarType, *const u8, *const u8)] = &[
            (Boolean, isnull_boolean as *const u8, isnotnull_boolean as *const u8),
            (Int8, isnull_int8 as *const u8, isnotnull_int8 as *const u8),
            (Int16, isnull_int16 as *const u8, isnotnull_int16 as *const u8),
            (Int32, isnull_int32 as *const u8, isnotnull_int32 as *const u8),
            (Int64, isnull_int64 as *const u8, isnotnull_int64 as *const u8),
            (UInt8, isnull_uint8 as *const u8, isnotnull_uint8 as *const u8),
            (UInt16, isnull_uint16 as *const u8, isnotnull_uint16 as *const u8),
            (UInt32, isnull_uint32 as *const u8, isnotnull_uint32 as *const u8),
            (UInt64, isnull_uint64 as *const u8, isnotnull_uint64 as *const u8),
            (Float32, isnull_float32 as *const u8, isnotnull_float32 as *const u8),
            (Float64, isnull_float64 as *const u8, isnotnull_float64 as *const u8),
        ];
        for &(ty, isnull, isnotnull) in null_tests {
            registry.register("isnull", &[ty], Boolean, Never, false, isnull);
            registry.register("isnotnull", &[ty], Boolean, Never, false, isnotnull);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_arithmetic_wraps() {
        assert_eq!(add_int32_int32(i32::MAX, 1), i32::MIN);
        assert_eq!(multiply_int64_int64(i64::MAX, 2), -2);
    }

    #[test]
    fn test_divide_by_zero_sets_context_error() {
        let mut ctx = ExecutionContext::new();
        let out = unsafe { divide_int32_int32(&mut ctx, 7, 0) };
        assert_eq!(out, 0);
        assert!(ctx.has_error());
        assert_eq!(unsafe { divide_int64_int64(&mut ctx, 9, 3) }, 3);
    }

    #[test]
    fn test_comparisons_return_bytes() {
        assert_eq!(less_than_int32_int32(1, 2), 1);
        assert_eq!(greater_than_or_equal_to_float64_float64(1.0, 2.0), 0);
        assert_eq!(not_boolean(1), 0);
    }

    #[test]
    fn test_null_tests_ignore_value() {
        assert_eq!(isnull_int32(123, 0), 1);
        assert_eq!(isnotnull_float64(f64::NAN, 1), 1);
    }
}
