//! Core types for distributed tiled dense linear algebra
//!
//! This crate provides the foundation shared by the communication, device
//! and factorization crates.
//!
//! # Architecture Overview
//!
//! 1. **Storage** - [`Tile`] and the block-cyclically distributed [`TiledMatrix`]
//! 2. **Primitives** - per-tile kernels behind the [`TileKernels`] trait
//! 3. **Execution Engines** - sequential or rayon-backed batches of tile work
//! 4. **Workspace** - the bounded lookahead panel pool
//!
//! # Example
//!
//! ```rust
//! use tessera_core::{ProcessGrid, RankContext, TiledMatrix};
//!
//! let grid = ProcessGrid::new(1, 1).unwrap();
//! let mut a = TiledMatrix::<f64>::new(6, 6, 4, 4, grid, RankContext::single()).unwrap();
//! a.fill_with(|i, j| if i == j { 2.0 } else { 0.0 }).unwrap();
//!
//! assert_eq!((a.mt(), a.nt()), (2, 2));
//! assert_eq!(a.tile_at(1, 1).unwrap().rows(), 2);
//! assert_eq!(a.local_get(5, 5).unwrap(), 2.0);
//! ```

pub mod error;
pub mod execution;
pub mod numeric;
pub mod options;
pub mod primitives;
pub mod tile;
pub mod tiled;
pub mod types;
pub mod workspace;

// Re-export core types
pub use error::{Error, ErrorKind, MemoryLocation, Result};

pub use execution::{auto_engine, scalar_sequential, ExecutionEngine, ExecutionStrategy, HostEngine, SequentialEngine};
#[cfg(feature = "parallel")]
pub use execution::{scalar_parallel, ParallelEngine};

pub use numeric::{max_nan, RealScalar, Scalar};
pub use options::{OptionKey, OptionValue, Options, OptionsBuilder, PanelVariant};
pub use primitives::{Breakdown, PivotPolicy, ScalarBackend, TileKernels};
pub use tile::{Tile, TileState};
pub use tiled::{
    GridOrder, MatrixLayout, MatrixStatus, MemoryPolicy, ProcessGrid, Rank, RankContext,
    TiledMatrix, TiledMatrixBuilder,
};
pub use types::{Diag, FactorKind, Norm, Op, Side, Uplo};
pub use workspace::{PanelPool, PanelSlot, PoolStats};

pub use num_complex::Complex;

/// Single-precision complex scalar
pub type C32 = Complex<f32>;
/// Double-precision complex scalar
pub type C64 = Complex<f64>;
