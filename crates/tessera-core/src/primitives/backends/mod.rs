//! Kernel backends
//!
//! Only the portable scalar backend ships today. The device layer runs the
//! same kernels on its own execution units, so host and device results agree
//! bit for bit.

mod scalar;

pub use scalar::ScalarBackend;
