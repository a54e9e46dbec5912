//! CPU feature detection → Cranelift ISA flags.
//!
//! `isa::lookup` alone targets the baseline of the host architecture; the
//! features detected here are switched on explicitly so generated loops can
//! use them.

use cranelift_codegen::isa::{self, OwnedTargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use target_lexicon::Triple;

use crate::error::BuildError;

/// Detected CPU capabilities relevant for generated code.
#[derive(Debug, Clone, Default)]
pub struct CpuCaps {
    pub has_sse41: bool,
    pub has_sse42: bool,
    pub has_popcnt: bool,
    pub has_avx: bool,
    pub has_avx2: bool,
    pub has_bmi1: bool,
    pub has_bmi2: bool,
    pub has_fma: bool,
    pub has_lzcnt: bool,
}

impl CpuCaps {
    /// Detect CPU capabilities at runtime.
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        Self {
            has_sse41: std::arch::is_x86_feature_detected!("sse4.1"),
            has_sse42: std::arch::is_x86_feature_detected!("sse4.2"),
            has_popcnt: std::arch::is_x86_feature_detected!("popcnt"),
            has_avx: std::arch::is_x86_feature_detected!("avx"),
            has_avx2: std::arch::is_x86_feature_detected!("avx2"),
            has_bmi1: std::arch::is_x86_feature_detected!("bmi1"),
            has_bmi2: std::arch::is_x86_feature_detected!("bmi2"),
            has_fma: std::arch::is_x86_feature_detected!("fma"),
            has_lzcnt: std::arch::is_x86_feature_detected!("lzcnt"),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn detect() -> Self {
        Self::default()
    }

    /// Cranelift x86 setting names for the detected features.
    fn isa_flags(&self) -> Vec<&'static str> {
        [
            (self.has_sse41, "has_sse41"),
            (self.has_sse42, "has_sse42"),
            (self.has_popcnt, "has_popcnt"),
            (self.has_avx, "has_avx"),
            (self.has_avx2, "has_avx2"),
            (self.has_bmi1, "has_bmi1"),
            (self.has_bmi2, "has_bmi2"),
            (self.has_fma, "has_fma"),
            (self.has_lzcnt, "has_lzcnt"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}

/// Build a Cranelift target ISA for the host.
///
/// `optimize` selects `opt_level=speed`, otherwise `none`. The IR verifier
/// stays on either way.
pub fn build_isa(caps: &CpuCaps, optimize: bool) -> Result<OwnedTargetIsa, BuildError> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", if optimize { "speed" } else { "none" })
        .map_err(BuildError::codegen)?;
    flag_builder
        .enable("enable_verifier")
        .map_err(BuildError::codegen)?;
    // JIT code lives at fixed addresses; primitives are called through absolute
    // relocations.
    flag_builder
        .set("use_colocated_libcalls", "false")
        .map_err(BuildError::codegen)?;
    flag_builder.set("is_pic", "false").map_err(BuildError::codegen)?;

    let mut isa_builder = isa::lookup(Triple::host()).map_err(BuildError::codegen)?;
    if cfg!(target_arch = "x86_64") {
        for flag in caps.isa_flags() {
            isa_builder.enable(flag).map_err(BuildError::codegen)?;
        }
    }

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuildError::codegen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_isa_for_host() {
        let caps = CpuCaps::detect();
        let isa = build_isa(&caps, true).unwrap();
        assert_eq!(isa.triple(), &Triple::host());
        assert!(build_isa(&caps, false).is_ok());
    }

    #[test]
    fn test_no_flags_without_features() {
        assert!(CpuCaps::default().isa_flags().is_empty());
    }
}
