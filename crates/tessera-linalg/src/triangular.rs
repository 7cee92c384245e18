//! Distributed triangular solves with many right-hand sides
//!
//! `op(A) X = B` from the left, `X` overwriting `B`. Block row `p` of `X`
//! is solved on the owners of `B`'s block row, then broadcast down each
//! column of `B` and folded into the block rows still to be solved.

use crate::engine::{check_comm, execute_on_host};
use crate::transfer::broadcast_tile;
use std::sync::Arc;
use tessera_comm::{Channel, Communicator, RankGroup, Tag};
use tessera_core::{
    Diag, Error, HostEngine, Op, Options, Result, Scalar, ScalarBackend, Side, Tile, TileKernels, TiledMatrix, Uplo,
};
use tessera_device::UpdateTask;
use tracing::{instrument, trace};

/// Triangular operand of a solve.
///
/// With `offset` `d` the triangle starts at tile row `d` of `A` and block
/// row `d` of `B`: operand tile `(p, q)` is `A(p + d, q)`. Rows of `B`
/// above `d` are left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TriangularView {
    pub uplo: Uplo,
    pub op: Op,
    pub diag: Diag,
    pub offset: usize,
}

impl TriangularView {
    /// Stored tile of `A` backing operand tile `(p, q)` of `op(A)`
    fn stored(&self, p: usize, q: usize) -> (usize, usize) {
        match self.op {
            Op::NoTrans => (p + self.offset, q),
            Op::Trans | Op::ConjTrans => (q + self.offset, p),
        }
    }

    /// Whether `op(A)` is lower triangular
    fn forward(&self) -> bool {
        (self.uplo == Uplo::Lower) == (self.op == Op::NoTrans)
    }
}

/// Solve `op(A) X = B` in place over block rows `offset..` of `b`.
///
/// `phase` keeps the traffic of consecutive solves in one routine apart.
pub(crate) fn solve_triangular<T: Scalar, C: Communicator>(
    comm: &C,
    host: &HostEngine<T>,
    view: TriangularView,
    a: &TiledMatrix<T>,
    b: &mut TiledMatrix<T>,
    phase: usize,
) -> Result<()> {
    let me = comm.rank();
    let d = view.offset;
    let blocks = b.mt().saturating_sub(d);
    let order: Vec<usize> = if view.forward() {
        (0..blocks).collect()
    } else {
        (0..blocks).rev().collect()
    };
    let lane = |purpose: usize| purpose + 3 * phase;

    for p in order {
        let row = p + d;
        let row_owners: Vec<_> = (0..b.nt()).map(|j| b.owner(row, j)).collect();

        // diagonal block
        let (di, dj) = view.stored(p, p);
        let owner = a.owner(di, dj);
        let group = RankGroup::new(row_owners.iter().copied().chain([owner]));
        if group.contains(me) {
            let mine = if owner == me { Some(a.tile_at(di, dj)?) } else { None };
            let diag = broadcast_tile(
                comm,
                mine,
                (a.tile_mb(di), a.tile_nb(dj)),
                owner,
                &group,
                Tag::new(Channel::Solve, p).with(0, lane(0)),
            )?;
            for j in 0..b.nt() {
                if b.is_local(row, j) {
                    ScalarBackend.trsm(Side::Left, view.uplo, view.op, view.diag, T::one(), &diag, b.tile_at_mut(row, j)?);
                }
            }
        }

        let rest: Vec<usize> = if view.forward() {
            (p + 1..blocks).collect()
        } else {
            (0..p).collect()
        };
        if rest.is_empty() {
            continue;
        }

        // solved block row travels down its columns
        let mut solved: Vec<Option<Arc<Tile<T>>>> = vec![None; b.nt()];
        for (j, slot) in solved.iter_mut().enumerate() {
            let source = b.owner(row, j);
            let group = RankGroup::new(rest.iter().map(|&r| b.owner(r + d, j)).chain([source]));
            if !group.contains(me) {
                continue;
            }
            let mine = if source == me { Some(b.tile_at(row, j)?) } else { None };
            let x = broadcast_tile(
                comm,
                mine,
                (b.tile_mb(row), b.tile_nb(j)),
                source,
                &group,
                Tag::new(Channel::Solve, p).with(j, lane(1)),
            )?;
            *slot = Some(Arc::new(x));
        }

        // B(r) -= op(A)(r, p) X(p)
        let mut tasks = Vec::new();
        for &r in &rest {
            let (ai, aj) = view.stored(r, p);
            let owner = a.owner(ai, aj);
            let group = RankGroup::new((0..b.nt()).map(|j| b.owner(r + d, j)).chain([owner]));
            if !group.contains(me) {
                continue;
            }
            let mine = if owner == me { Some(a.tile_at(ai, aj)?) } else { None };
            let factor = Arc::new(broadcast_tile(
                comm,
                mine,
                (a.tile_mb(ai), a.tile_nb(aj)),
                owner,
                &group,
                Tag::new(Channel::Solve, p).with(r, lane(2)),
            )?);
            for (j, x) in solved.iter().enumerate() {
                if !b.is_local(r + d, j) {
                    continue;
                }
                let x = x
                    .as_ref()
                    .ok_or_else(|| Error::InvalidState(format!("Solved block ({row}, {j}) missing on rank {me}")))?;
                tasks.push(UpdateTask {
                    target: (r + d, j),
                    alpha: -T::one(),
                    a: Arc::clone(&factor),
                    op_a: view.op,
                    b: Arc::clone(x),
                    op_b: Op::NoTrans,
                    beta: T::one(),
                });
            }
        }
        trace!(block = p, updates = tasks.len(), "triangular step");
        execute_on_host(host, b, tasks)?;
    }
    Ok(())
}

/// Solve `op(A) X = B` for triangular `a`, overwriting `b` with `X`.
///
/// Only the `uplo` triangle of `a` is read. `b` must have as many rows as
/// `a` has columns, with matching tiling and grid.
#[instrument(skip_all, fields(uplo = ?uplo, op = ?op, nrhs = b.n(), rank = comm.rank()))]
pub fn triangular_solve<T: Scalar, C: Communicator>(
    comm: &C,
    uplo: Uplo,
    op: Op,
    diag: Diag,
    a: &TiledMatrix<T>,
    b: &mut TiledMatrix<T>,
    options: &Options,
) -> Result<()> {
    check_comm(comm, a)?;
    check_comm(comm, b)?;
    if uplo == Uplo::General {
        return Err(Error::InvalidParameter("triangular solve needs Lower or Upper".to_string()));
    }
    if a.m() != a.n() || a.mb() != a.nb() {
        return Err(Error::InvalidConfiguration(format!(
            "triangular solve needs a square matrix with square tiles, got {}x{} in {}x{} tiles",
            a.m(),
            a.n(),
            a.mb(),
            a.nb()
        )));
    }
    if !b.layout().rows_match_cols_of(a.layout()) {
        return Err(Error::layout_mismatch(
            (a.n(), a.nb()),
            (b.m(), b.mb()),
            "rows of B vs columns of A",
        ));
    }
    options.validate()?;
    let host = HostEngine::from_threads(options.host_threads())?;
    b.allocate()?;
    let view = TriangularView { uplo, op, diag, offset: 0 };
    solve_triangular(comm, &host, view, a, b, 0)
}
