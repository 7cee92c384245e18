//! Factorizations, solves and norms over distributed tiled matrices
//!
//! Every routine is collective: each rank of the process grid calls it with
//! its own [`Communicator`](tessera_comm::Communicator) and its share of the
//! matrix, and all ranks issue the same sequence of messages.
//!
//! - [`lu_factor`], [`cholesky_factor`], [`qr_factor`] run on a shared
//!   lookahead panel pipeline, optionally offloading trailing updates to
//!   each rank's devices
//! - [`indefinite_factor`] is Aasen's `L T L^H` for Hermitian indefinite
//!   matrices, finished with a replicated [`BandMatrix`] LU
//! - [`solve`] holds the matching solves and inverses; [`qr`] the `Q`
//!   application and least squares
//! - [`norm()`] and [`hermitian_norm`] reduce to one value on every rank
//!
//! # Example
//!
//! ```rust
//! use tessera_comm::{Communicator, LocalFabric};
//! use tessera_core::{Options, ProcessGrid, TiledMatrix};
//! use tessera_linalg::{lu_solve, transfer::all_gather};
//!
//! let solutions = LocalFabric::run(2, |comm| {
//!     let grid = ProcessGrid::new(1, 2).unwrap();
//!     let ctx = comm.context();
//!     let mut a = TiledMatrix::<f64>::new(4, 4, 2, 2, grid, ctx).unwrap();
//!     a.fill_with(|i, j| if i == j { 4.0 } else { 1.0 }).unwrap();
//!     let mut b = TiledMatrix::<f64>::new(4, 1, 2, 2, grid, ctx).unwrap();
//!     b.fill_with(|_, _| 7.0).unwrap();
//!
//!     lu_solve(&comm, &mut a, &mut b, &Options::new()).unwrap();
//!     all_gather(&comm, &b).unwrap()
//! })
//! .unwrap();
//!
//! for x in &solutions[0] {
//!     assert!((x - 1.0).abs() < 1e-12);
//! }
//! ```

pub mod band;
pub mod cholesky;
mod engine;
pub mod indefinite;
pub mod lu;
pub mod norm;
pub mod pivots;
pub mod qr;
pub mod solve;
mod swap;
pub mod transfer;
pub mod triangular;

pub use band::BandMatrix;
pub use cholesky::cholesky_factor;
pub use engine::PanelState;
pub use indefinite::{indefinite_factor, IndefiniteFactor};
pub use lu::lu_factor;
pub use norm::{hermitian_norm, norm};
pub use pivots::{Pivot, PivotTable, RowSwap};
pub use qr::{least_squares_solve, qr_factor, qr_multiply_by_q, QrFactors};
pub use solve::{
    cholesky_inverse_using_factor, cholesky_solve, cholesky_solve_using_factor, indefinite_solve,
    indefinite_solve_using_factor, lu_inverse_using_factor, lu_solve, lu_solve_using_factor,
};
pub use transfer::{all_gather, gather};
pub use triangular::triangular_solve;
