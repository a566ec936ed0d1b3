//! Compile-time build metadata generated by `built`

include!(concat!(env!("OUT_DIR"), "/built.rs"));

/// Version string recorded in checkpoints and run records
pub fn crate_version() -> &'static str {
    PKG_VERSION
}
