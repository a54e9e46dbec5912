//! Optional instrumentation of generated code.
//!
//! When tracing is enabled, the visitor emits a call to one of the print
//! primitives below after every leaf and every function result. Messages
//! carry one `%T` placeholder that is replaced at build time with a
//! printf-style specifier matching the traced value's type (`%d` for int32,
//! `%ld` for int64, ...). The rendered events land in a [`TraceSink`] owned
//! by the generator that emitted them.

use std::ffi::{c_char, CStr};

use parking_lot::Mutex;

use crate::types::ScalarType;

/// Placeholder replaced by a type-specific format specifier.
pub const TYPE_PLACEHOLDER: &str = "%T";

/// One rendered trace message.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub message: String,
}

/// Collects trace events from generated code. Calls from concurrent
/// executions are serialized by the mutex; their relative order is
/// unspecified.
#[derive(Debug, Default)]
pub struct TraceSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl TraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: String) {
        tracing::trace!(target: "dexjit::trace", "{message}");
        self.events.lock().push(TraceEvent { message });
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every event recorded so far.
    pub fn drain(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

/// Print primitive selected for a traced value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePrintFn {
    /// Value sign-extended to i64.
    Signed,
    /// Value zero-extended to u64.
    Unsigned,
    /// Value promoted to f64.
    Float,
}

impl TracePrintFn {
    pub fn symbol(self) -> &'static str {
        match self {
            TracePrintFn::Signed => "dexjit_trace_i64",
            TracePrintFn::Unsigned => "dexjit_trace_u64",
            TracePrintFn::Float => "dexjit_trace_f64",
        }
    }

    pub(crate) fn addr(self) -> *const u8 {
        match self {
            TracePrintFn::Signed => dexjit_trace_i64 as *const u8,
            TracePrintFn::Unsigned => dexjit_trace_u64 as *const u8,
            TracePrintFn::Float => dexjit_trace_f64 as *const u8,
        }
    }

    pub(crate) const ALL: [TracePrintFn; 3] = [
        TracePrintFn::Signed,
        TracePrintFn::Unsigned,
        TracePrintFn::Float,
    ];
}

fn format_specifier(ty: ScalarType) -> &'static str {
    match ty {
        ScalarType::Boolean | ScalarType::Int8 | ScalarType::Int16 | ScalarType::Int32 => "%d",
        ScalarType::Int64 => "%ld",
        ScalarType::UInt8 | ScalarType::UInt16 | ScalarType::UInt32 => "%u",
        ScalarType::UInt64 => "%lu",
        ScalarType::Float32 => "%f",
        ScalarType::Float64 => "%lf",
    }
}

/// Escape `%` so `text` (a column name, say) passes through trace
/// formatting verbatim.
pub fn escape_trace_text(text: &str) -> String {
    text.replace('%', "%%")
}

/// Replace the first unescaped `%T` in `msg` with the specifier for `ty`
/// and pick the print primitive that matches it. `%%` is left as is.
pub fn replace_format_in_trace(msg: &str, ty: ScalarType) -> (String, TracePrintFn) {
    let print_fn = if ty.is_float() {
        TracePrintFn::Float
    } else if ty.is_signed() || ty == ScalarType::Boolean {
        TracePrintFn::Signed
    } else {
        TracePrintFn::Unsigned
    };

    let mut out = String::with_capacity(msg.len() + 2);
    let mut rest = msg;
    let mut replaced = false;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("%%") {
            out.push_str("%%");
            rest = &tail[2..];
        } else if !replaced && tail.starts_with(TYPE_PLACEHOLDER) {
            out.push_str(format_specifier(ty));
            replaced = true;
            rest = &tail[TYPE_PLACEHOLDER.len()..];
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    (out, print_fn)
}

const SPECIFIERS: [&str; 6] = ["%lu", "%ld", "%lf", "%u", "%d", "%f"];

/// Substitute the first unescaped format specifier in `fmt` with `value`
/// and collapse `%%` to `%`.
fn render(fmt: &str, value: &dyn std::fmt::Display) -> String {
    let mut out = String::with_capacity(fmt.len() + 8);
    let mut rest = fmt;
    let mut rendered = false;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("%%") {
            out.push('%');
            rest = &tail[2..];
            continue;
        }
        match SPECIFIERS.iter().find(|spec| tail.starts_with(**spec)) {
            Some(spec) if !rendered => {
                out.push_str(&value.to_string());
                rendered = true;
                rest = &tail[spec.len()..];
            }
            _ => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

unsafe fn sink_and_message<'a>(
    sink: *const TraceSink,
    msg: *const c_char,
) -> Option<(&'a TraceSink, &'a str)> {
    let sink = sink.as_ref()?;
    if msg.is_null() {
        return None;
    }
    let msg = CStr::from_ptr(msg).to_str().ok()?;
    Some((sink, msg))
}

/// # Safety
///
/// Called from generated code with a live sink and a NUL-terminated message
/// owned by the same generator.
pub unsafe extern "C" fn dexjit_trace_i64(sink: *const TraceSink, msg: *const c_char, value: i64) {
    if let Some((sink, msg)) = sink_and_message(sink, msg) {
        sink.record(render(msg, &value));
    }
}

/// # Safety
///
/// See [`dexjit_trace_i64`].
pub unsafe extern "C" fn dexjit_trace_u64(sink: *const TraceSink, msg: *const c_char, value: u64) {
    if let Some((sink, msg)) = sink_and_message(sink, msg) {
        sink.record(render(msg, &value));
    }
}

/// # Safety
///
/// See [`dexjit_trace_i64`].
pub unsafe extern "C" fn dexjit_trace_f64(sink: *const TraceSink, msg: *const c_char, value: f64) {
    if let Some((sink, msg)) = sink_and_message(sink, msg) {
        sink.record(render(msg, &value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_replace_format_per_type() {
        let (msg, f) = replace_format_in_trace("value %T", ScalarType::Int32);
        assert_eq!(msg, "value %d");
        assert_eq!(f, TracePrintFn::Signed);

        let (msg, f) = replace_format_in_trace("value %T", ScalarType::Int64);
        assert_eq!(msg, "value %ld");
        assert_eq!(f, TracePrintFn::Signed);

        let (msg, f) = replace_format_in_trace("value %T", ScalarType::UInt64);
        assert_eq!(msg, "value %lu");
        assert_eq!(f, TracePrintFn::Unsigned);

        let (msg, f) = replace_format_in_trace("value %T", ScalarType::Float32);
        assert_eq!(msg, "value %f");
        assert_eq!(f, TracePrintFn::Float);

        let (msg, f) = replace_format_in_trace("flag %T", ScalarType::Boolean);
        assert_eq!(msg, "flag %d");
        assert_eq!(f, TracePrintFn::Signed);
    }

    #[test]
    fn test_render_picks_first_specifier() {
        assert_eq!(render("a %ld b", &7i64), "a 7 b");
        assert_eq!(render("x=%d", &-3i64), "x=-3");
        assert_eq!(render("no placeholder", &1), "no placeholder");
        assert_eq!(render("%lf then %d", &1.5f64), "1.5 then %d");
    }

    #[test]
    fn test_escaped_percent_survives_formatting() {
        let msg = format!("{} value %T", escape_trace_text("x%d"));
        assert_eq!(msg, "x%%d value %T");
        let (fmt, f) = replace_format_in_trace(&msg, ScalarType::Int64);
        assert_eq!(fmt, "x%%d value %ld");
        assert_eq!(f, TracePrintFn::Signed);
        assert_eq!(render(&fmt, &5i64), "x%d value 5");
    }

    #[test]
    fn test_escaped_placeholder_is_not_replaced() {
        let (fmt, _) = replace_format_in_trace("100%%T %T", ScalarType::UInt32);
        assert_eq!(fmt, "100%%T %u");
        assert_eq!(render(&fmt, &9u64), "100%T 9");
    }

    #[test]
    fn test_render_keeps_stray_percent() {
        assert_eq!(render("50% done %d", &3i64), "50% done 3");
        assert_eq!(render("trailing %", &3i64), "trailing %");
    }

    #[test]
    fn test_print_primitives_record_into_sink() {
        let sink = TraceSink::new();
        let msg = CString::new("literal %d").unwrap();
        unsafe {
            dexjit_trace_i64(&sink, msg.as_ptr(), 42);
            dexjit_trace_u64(&sink, msg.as_ptr(), 7);
        }
        let events = sink.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "literal 42");
        assert!(sink.is_empty());
    }
}
