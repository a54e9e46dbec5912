//! Per-invocation execution context shared with fallible primitives.

/// Status returned by a generated function that completed every row.
pub const STATUS_OK: i32 = 0;

/// Status set by a primitive that rejected its input.
pub const STATUS_FUNCTION_ERROR: i32 = 1;

/// Context passed to every generated function call.
///
/// Generated code reads `error_code` at offset 0 after each fallible call,
/// so the field order is part of the generated-code ABI.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ExecutionContext {
    error_code: i32,
    message: Option<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure. The first error wins; later ones are dropped.
    pub fn set_error(&mut self, code: i32, message: impl Into<String>) {
        if self.error_code == STATUS_OK {
            self.error_code = code;
            self.message = Some(message.into());
        }
    }

    pub fn has_error(&self) -> bool {
        self.error_code != STATUS_OK
    }

    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    pub fn take_message(&mut self) -> Option<String> {
        self.message.take()
    }

    /// Offset of `error_code` as seen by generated loads.
    pub(crate) const ERROR_CODE_OFFSET: i32 = 0;
}

/// Helper for primitives: set an error through the raw context pointer.
///
/// # Safety
///
/// `ctx` must be the pointer generated code received for this call.
pub unsafe fn context_set_error(ctx: *mut ExecutionContext, message: &str) {
    if let Some(ctx) = ctx.as_mut() {
        ctx.set_error(STATUS_FUNCTION_ERROR, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_wins() {
        let mut ctx = ExecutionContext::new();
        assert!(!ctx.has_error());
        ctx.set_error(STATUS_FUNCTION_ERROR, "divide by zero");
        ctx.set_error(7, "later");
        assert_eq!(ctx.error_code(), STATUS_FUNCTION_ERROR);
        assert_eq!(ctx.take_message().as_deref(), Some("divide by zero"));
    }

    #[test]
    fn test_error_code_is_first_field() {
        let ctx = ExecutionContext::new();
        let base = &ctx as *const _ as usize;
        let field = &ctx.error_code as *const _ as usize;
        assert_eq!(field - base, ExecutionContext::ERROR_CODE_OFFSET as usize);
    }
}
