//! Solves and inverses built on the factorizations
//!
//! Every `*_using_factor` routine expects the matrix as left behind by the
//! matching factorization and overwrites the right-hand sides with the
//! solution. The plain variants factor first.

use crate::cholesky::cholesky_factor;
use crate::engine::check_comm;
use crate::indefinite::{indefinite_factor, IndefiniteFactor};
use crate::lu::lu_factor;
use crate::pivots::PivotTable;
use crate::swap::{swap_lines, Axis};
use crate::transfer::all_gather;
use crate::triangular::{solve_triangular, TriangularView};
use tessera_comm::{Channel, Communicator, Tag};
use tessera_core::{
    Diag, Error, FactorKind, HostEngine, MemoryPolicy, Op, Options, Result, Scalar, TiledMatrix, Uplo,
};
use tracing::{debug, instrument};

const LOWER_UNIT: TriangularView = TriangularView {
    uplo: Uplo::Lower,
    op: Op::NoTrans,
    diag: Diag::Unit,
    offset: 0,
};

/// `b` is a right-hand side for square `a`
fn check_rhs<T: Scalar, C: Communicator>(comm: &C, a: &TiledMatrix<T>, b: &TiledMatrix<T>) -> Result<()> {
    check_comm(comm, a)?;
    check_comm(comm, b)?;
    if a.m() != a.n() {
        return Err(Error::InvalidConfiguration(format!(
            "Solve needs a square matrix, got {}x{}",
            a.m(),
            a.n()
        )));
    }
    if !b.layout().rows_match_cols_of(a.layout()) {
        return Err(Error::layout_mismatch(
            (a.n(), a.nb(), a.layout().grid()),
            (b.m(), b.mb(), b.layout().grid()),
            "rows of B vs columns of A",
        ));
    }
    Ok(())
}

fn check_pivots<T: Scalar>(a: &TiledMatrix<T>, pivots: &PivotTable) -> Result<()> {
    if pivots.rows() != a.m() || pivots.tile_rows() != a.mb() {
        return Err(Error::layout_mismatch(
            (a.m(), a.mb()),
            (pivots.rows(), pivots.tile_rows()),
            "pivot table vs factored matrix",
        ));
    }
    Ok(())
}

fn host_for<T: Scalar>(options: &Options) -> Result<HostEngine<T>> {
    options.validate()?;
    HostEngine::from_threads(options.host_threads())
}

fn all_tiles(n: usize) -> Vec<usize> {
    (0..n).collect()
}

/// Solve `A X = B` with `P A = L U` from [`lu_factor`]
#[instrument(skip_all, fields(n = a.n(), nrhs = b.n(), rank = comm.rank()))]
pub fn lu_solve_using_factor<T: Scalar, C: Communicator>(
    comm: &C,
    a: &TiledMatrix<T>,
    pivots: &PivotTable,
    b: &mut TiledMatrix<T>,
    options: &Options,
) -> Result<()> {
    check_rhs(comm, a, b)?;
    a.expect_factored(FactorKind::Lu)?;
    check_pivots(a, pivots)?;
    let host = host_for(options)?;
    b.allocate()?;

    let cols = all_tiles(b.nt());
    swap_lines(comm, b, Axis::Rows, &pivots.swaps(), &cols, Tag::new(Channel::Swap, 0).with(0, 7))?;
    solve_triangular(comm, &host, LOWER_UNIT, a, b, 0)?;
    let upper = TriangularView {
        uplo: Uplo::Upper,
        diag: Diag::NonUnit,
        ..LOWER_UNIT
    };
    solve_triangular(comm, &host, upper, a, b, 1)
}

/// Factor `a` with [`lu_factor`] and solve `A X = B`; returns the interchanges
pub fn lu_solve<T: Scalar, C: Communicator>(
    comm: &C,
    a: &mut TiledMatrix<T>,
    b: &mut TiledMatrix<T>,
    options: &Options,
) -> Result<PivotTable> {
    check_rhs(comm, a, b)?;
    let pivots = lu_factor(comm, a, options)?;
    lu_solve_using_factor(comm, a, &pivots, b, options)?;
    Ok(pivots)
}

/// Solve `A X = B` with `A = L L^H` from [`cholesky_factor`]
#[instrument(skip_all, fields(n = a.n(), nrhs = b.n(), rank = comm.rank()))]
pub fn cholesky_solve_using_factor<T: Scalar, C: Communicator>(
    comm: &C,
    a: &TiledMatrix<T>,
    b: &mut TiledMatrix<T>,
    options: &Options,
) -> Result<()> {
    check_rhs(comm, a, b)?;
    a.expect_factored(FactorKind::Cholesky)?;
    let host = host_for(options)?;
    b.allocate()?;
    cholesky_sweeps(comm, &host, a, b)
}

fn cholesky_sweeps<T: Scalar, C: Communicator>(
    comm: &C,
    host: &HostEngine<T>,
    a: &TiledMatrix<T>,
    b: &mut TiledMatrix<T>,
) -> Result<()> {
    let lower = TriangularView {
        diag: Diag::NonUnit,
        ..LOWER_UNIT
    };
    solve_triangular(comm, host, lower, a, b, 0)?;
    let adjoint = TriangularView {
        op: Op::ConjTrans,
        ..lower
    };
    solve_triangular(comm, host, adjoint, a, b, 1)
}

/// Factor `a` with [`cholesky_factor`] and solve `A X = B`
pub fn cholesky_solve<T: Scalar, C: Communicator>(
    comm: &C,
    a: &mut TiledMatrix<T>,
    b: &mut TiledMatrix<T>,
    options: &Options,
) -> Result<()> {
    check_rhs(comm, a, b)?;
    cholesky_factor(comm, a, options)?;
    cholesky_solve_using_factor(comm, a, b, options)
}

/// Solve `A X = B` with `P A P^H = L T L^H` from [`indefinite_factor`]
#[instrument(skip_all, fields(n = a.n(), nrhs = b.n(), rank = comm.rank()))]
pub fn indefinite_solve_using_factor<T: Scalar, C: Communicator>(
    comm: &C,
    a: &TiledMatrix<T>,
    factor: &IndefiniteFactor<T>,
    b: &mut TiledMatrix<T>,
    options: &Options,
) -> Result<()> {
    check_rhs(comm, a, b)?;
    a.expect_factored(FactorKind::Indefinite)?;
    check_pivots(a, factor.pivots())?;
    let host = host_for(options)?;
    b.allocate()?;

    let cols = all_tiles(b.nt());
    let swaps = factor.pivots().swaps();
    swap_lines(comm, b, Axis::Rows, &swaps, &cols, Tag::new(Channel::Swap, 0).with(0, 7))?;

    // L's first block column is the identity; the rest sits one tile column left
    let lower = TriangularView {
        offset: 1,
        ..LOWER_UNIT
    };
    solve_triangular(comm, &host, lower, a, b, 0)?;

    let mut dense = all_gather(comm, b)?;
    factor.band().solve(&mut dense, b.n())?;
    b.fill_from_col_major(&dense)?;

    let adjoint = TriangularView {
        op: Op::ConjTrans,
        ..lower
    };
    solve_triangular(comm, &host, adjoint, a, b, 1)?;

    let reversed: Vec<_> = swaps.into_iter().rev().collect();
    swap_lines(comm, b, Axis::Rows, &reversed, &cols, Tag::new(Channel::Swap, 1).with(0, 7))
}

/// Factor `a` with [`indefinite_factor`] and solve `A X = B`
pub fn indefinite_solve<T: Scalar, C: Communicator>(
    comm: &C,
    a: &mut TiledMatrix<T>,
    b: &mut TiledMatrix<T>,
    options: &Options,
) -> Result<IndefiniteFactor<T>> {
    check_rhs(comm, a, b)?;
    let factor = indefinite_factor(comm, a, options)?;
    indefinite_solve_using_factor(comm, a, &factor, b, options)?;
    Ok(factor)
}

/// Identity with `a`'s layout, stored in full
fn identity_like<T: Scalar>(a: &TiledMatrix<T>) -> Result<TiledMatrix<T>> {
    let mut x = TiledMatrix::with_layout(*a.layout(), Uplo::General, a.context(), MemoryPolicy::Eager)?;
    x.fill_with(|i, j| if i == j { T::one() } else { T::zero() })?;
    Ok(x)
}

/// Copy `x` over the stored tiles of `a` and mark it an ordinary matrix
fn overwrite<T: Scalar>(a: &mut TiledMatrix<T>, x: &TiledMatrix<T>) -> Result<()> {
    for (i, j) in a.local_coords() {
        a.store_tile(i, j, x.tile_at(i, j)?)?;
    }
    a.mark_ready();
    Ok(())
}

/// Replace `a`, holding `P A = L U`, with `A^-1`
#[instrument(skip_all, fields(n = a.n(), rank = comm.rank()))]
pub fn lu_inverse_using_factor<T: Scalar, C: Communicator>(
    comm: &C,
    a: &mut TiledMatrix<T>,
    pivots: &PivotTable,
    options: &Options,
) -> Result<()> {
    check_comm(comm, a)?;
    a.expect_factored(FactorKind::Lu)?;
    if a.m() != a.n() {
        return Err(Error::InvalidConfiguration(format!(
            "Inverse needs a square matrix, got {}x{}",
            a.m(),
            a.n()
        )));
    }
    check_pivots(a, pivots)?;
    let host = host_for(options)?;

    // A^-1 = U^-1 L^-1 P
    let mut x = identity_like(a)?;
    solve_triangular(comm, &host, LOWER_UNIT, a, &mut x, 0)?;
    let upper = TriangularView {
        uplo: Uplo::Upper,
        diag: Diag::NonUnit,
        ..LOWER_UNIT
    };
    solve_triangular(comm, &host, upper, a, &mut x, 1)?;
    let reversed: Vec<_> = pivots.swaps().into_iter().rev().collect();
    let rows = all_tiles(x.mt());
    swap_lines(comm, &mut x, Axis::Cols, &reversed, &rows, Tag::new(Channel::Swap, 0).with(0, 8))?;

    overwrite(a, &x)?;
    debug!("LU inverse done");
    Ok(())
}

/// Replace `a`, holding `A = L L^H`, with `A^-1` in the same storage
#[instrument(skip_all, fields(n = a.n(), rank = comm.rank()))]
pub fn cholesky_inverse_using_factor<T: Scalar, C: Communicator>(
    comm: &C,
    a: &mut TiledMatrix<T>,
    options: &Options,
) -> Result<()> {
    check_comm(comm, a)?;
    a.expect_factored(FactorKind::Cholesky)?;
    let host = host_for(options)?;

    let mut x = identity_like(a)?;
    cholesky_sweeps(comm, &host, a, &mut x)?;
    overwrite(a, &x)?;
    debug!("Cholesky inverse done");
    Ok(())
}
