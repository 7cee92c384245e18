//! Scalar backend implementation
//!
//! Generic implementations that work for every scalar type.

use crate::primitives::TileKernels;
use crate::Scalar;

/// Scalar backend - works for all scalar types
#[derive(Clone, Copy, Debug, Default)]
pub struct ScalarBackend;

impl ScalarBackend {
    pub fn new() -> Self {
        Self
    }
}

// Generic implementation for all types
impl<T: Scalar> TileKernels<T> for ScalarBackend {
    fn backend_name(&self) -> &'static str {
        "scalar"
    }

    // All operations use the default implementations from the trait
}
