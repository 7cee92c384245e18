//! Distributed tiled dense linear algebra
//!
//! `tessera` re-exports the workspace crates:
//!
//! - [`base`]: tiles, the block-cyclic [`TiledMatrix`], options and errors
//! - [`comm`]: rank-to-rank messaging and tree collectives
//! - [`device`]: simulated accelerators and their batched kernels
//! - [`linalg`]: LU, Cholesky, QR and Aasen factorizations, solves and norms
//!
//! # Example
//!
//! ```rust
//! use tessera::prelude::*;
//!
//! let norms = LocalFabric::run(4, |comm| {
//!     let grid = ProcessGrid::new(2, 2)?;
//!     let mut a = TiledMatrix::<f64>::new(6, 6, 2, 2, grid, comm.context())?;
//!     a.fill_with(|i, j| if i == j { 3.0 } else { 0.0 })?;
//!     tessera::linalg::norm(&comm, Norm::Fro, &a, &Options::new())
//! })
//! .unwrap();
//!
//! for n in norms {
//!     assert!((n.unwrap() - 54f64.sqrt()).abs() < 1e-12);
//! }
//! ```

pub use tessera_comm as comm;
pub use tessera_core as base;
pub use tessera_device as device;
pub use tessera_linalg as linalg;

pub use tessera_core::{Error, ErrorKind, Options, ProcessGrid, Result, Scalar, TiledMatrix};

pub mod prelude {
    pub use tessera_comm::{Collectives, Communicator, LocalCommunicator, LocalFabric, RankGroup};
    pub use tessera_core::{
        Diag, Error, ErrorKind, FactorKind, MatrixStatus, Norm, Op, Options, PanelVariant, ProcessGrid,
        Result, Scalar, Side, Tile, TiledMatrix, Uplo, C64,
    };
    pub use tessera_linalg::{
        cholesky_factor, cholesky_solve, indefinite_solve, least_squares_solve, lu_factor, lu_solve, qr_factor,
        PivotTable,
    };
}
