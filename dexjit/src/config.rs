//! Generator configuration, fixed at construction.

use serde::{Deserialize, Serialize};

use crate::error::BuildError;

/// Knobs that shape the generated code.
///
/// ```json
/// { "optimize": true, "trace": false, "dump_ir": false }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Cranelift `opt_level=speed` instead of `none`.
    pub optimize: bool,
    /// Emit a trace call after every leaf and function result.
    pub trace: bool,
    /// Keep the CLIF text of every generated function and log it at debug.
    pub dump_ir: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            optimize: true,
            trace: false,
            dump_ir: false,
        }
    }
}

impl GeneratorConfig {
    /// Parse from JSON; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, BuildError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_dump_ir(mut self, dump_ir: bool) -> Self {
        self.dump_ir = dump_ir;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_partial() {
        let config = GeneratorConfig::from_json(r#"{ "trace": true }"#).unwrap();
        assert_eq!(
            config,
            GeneratorConfig {
                optimize: true,
                trace: true,
                dump_ir: false
            }
        );
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            GeneratorConfig::from_json("{ trace: yes }"),
            Err(BuildError::Config(_))
        ));
    }
}
