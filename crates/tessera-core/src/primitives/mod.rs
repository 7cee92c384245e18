//! Per-tile compute primitives with compile-time dispatch
//!
//! # Architecture
//!
//! - Single `TileKernels<T>` trait for all per-tile operations
//! - Concrete backend types implement it; today only `ScalarBackend`
//! - Execution engines own a backend and decide how many tiles run at once

pub mod backends;
pub mod traits;

pub use backends::ScalarBackend;
pub use traits::{nrm2, Breakdown, PivotPolicy, TileKernels};

/// Create a scalar backend (always available)
pub fn scalar_backend() -> ScalarBackend {
    ScalarBackend::new()
}
