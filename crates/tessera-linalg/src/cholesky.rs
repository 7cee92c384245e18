//! Cholesky factorization
//!
//! `A = L L^H` for Hermitian positive definite `A`, computed in place in
//! the lower triangle. The diagonal tile of panel `k` is factored by its
//! owner; the tiles below it are solved against it by their own owners.

use crate::engine::{check_comm, check_square_tiles, PanelAlgorithm, PanelEngine};
use crate::transfer::broadcast_tile;
use std::sync::Arc;
use tessera_comm::{Channel, Communicator, RankGroup, Tag};
use tessera_core::{
    Diag, Error, FactorKind, Op, Options, PanelSlot, Rank, Result, Scalar, ScalarBackend, Side, TileKernels,
    TiledMatrix, Uplo,
};
use tessera_device::UpdateTask;
use tracing::instrument;

pub(crate) struct CholeskyPanels;

impl<T: Scalar> PanelAlgorithm<T> for CholeskyPanels {
    fn kind(&self) -> FactorKind {
        FactorKind::Cholesky
    }

    fn steps(&self, a: &TiledMatrix<T>) -> usize {
        a.nt()
    }

    fn status_root(&self, a: &TiledMatrix<T>, k: usize) -> Rank {
        a.owner(k, k)
    }

    fn factor_local<C: Communicator>(
        &mut self,
        comm: &C,
        a: &mut TiledMatrix<T>,
        k: usize,
        _slot: &mut PanelSlot<T>,
    ) -> Result<Option<usize>> {
        if a.owner(k, k) != comm.rank() {
            return Ok(None);
        }
        let diag = a.tile_at_mut(k, k)?;
        Ok(ScalarBackend
            .potrf(diag)
            .err()
            .map(|breakdown| k * a.nb() + breakdown.column + 1))
    }

    fn share_pivots<C: Communicator>(
        &mut self,
        _comm: &C,
        _a: &mut TiledMatrix<T>,
        _k: usize,
        _slot: &mut PanelSlot<T>,
    ) -> Result<()> {
        Ok(())
    }

    fn share_panel<C: Communicator>(
        &mut self,
        comm: &C,
        a: &mut TiledMatrix<T>,
        k: usize,
        slot: &mut PanelSlot<T>,
    ) -> Result<()> {
        let me = comm.rank();
        let mt = a.mt();
        if k + 1 >= mt {
            return Ok(());
        }

        // L(i, k) = A(i, k) L(k, k)^-H below the diagonal
        let column = RankGroup::new((k..mt).map(|i| a.owner(i, k)));
        if column.contains(me) {
            let root = a.owner(k, k);
            let mine = if root == me { Some(a.tile_at(k, k)?) } else { None };
            let diag = broadcast_tile(
                comm,
                mine,
                (a.tile_mb(k), a.tile_nb(k)),
                root,
                &column,
                Tag::new(Channel::Panel, k).with(k, 0),
            )?;
            for i in k + 1..mt {
                if a.is_local(i, k) {
                    let tile = a.tile_at_mut(i, k)?;
                    ScalarBackend.trsm(Side::Right, Uplo::Lower, Op::ConjTrans, Diag::NonUnit, T::one(), &diag, tile);
                }
            }
        }

        // L(i, k) is needed along tile row i (left operand) and tile column i (right operand)
        for i in k + 1..mt {
            let owner = a.owner(i, k);
            let group = RankGroup::new(
                (k + 1..=i)
                    .map(|j| a.owner(i, j))
                    .chain((i..mt).map(|r| a.owner(r, i)))
                    .chain([owner]),
            );
            if !group.contains(me) {
                continue;
            }
            let mine = if owner == me { Some(a.tile_at(i, k)?) } else { None };
            let tile = broadcast_tile(
                comm,
                mine,
                (a.tile_mb(i), a.tile_nb(k)),
                owner,
                &group,
                Tag::new(Channel::Panel, k).with(i, 1),
            )?;
            slot.set_tile(i, tile);
        }
        Ok(())
    }

    fn prepare_column<C: Communicator>(
        &mut self,
        comm: &C,
        a: &mut TiledMatrix<T>,
        slot: &PanelSlot<T>,
        j: usize,
    ) -> Result<Vec<UpdateTask<T>>> {
        let s = slot.step();
        let missing = |i: usize| {
            Error::InvalidState(format!("Panel {s} tile {i} missing on rank {}", comm.rank()))
        };
        let mut tasks = Vec::new();
        for i in j..a.mt() {
            if !a.is_local(i, j) {
                continue;
            }
            let left = slot.tile(i).ok_or_else(|| missing(i))?;
            let right = slot.tile(j).ok_or_else(|| missing(j))?;
            tasks.push(UpdateTask {
                target: (i, j),
                alpha: -T::one(),
                a: Arc::clone(left),
                op_a: Op::NoTrans,
                b: Arc::clone(right),
                op_b: Op::ConjTrans,
                beta: T::one(),
            });
        }
        Ok(tasks)
    }

    fn failure(&self, k: usize, index: usize) -> Error {
        Error::NotPositiveDefinite { panel: k, index }
    }
}

/// Factor Hermitian positive definite `a` in place as `L L^H`.
///
/// `a` must use `Lower` or `General` storage; only the lower triangle is
/// read or written. A non-positive pivot fails with
/// [`Error::NotPositiveDefinite`] carrying the order of the failing minor.
#[instrument(skip_all, fields(n = a.n(), nb = a.nb(), rank = comm.rank()))]
pub fn cholesky_factor<T: Scalar, C: Communicator>(comm: &C, a: &mut TiledMatrix<T>, options: &Options) -> Result<()> {
    check_comm(comm, a)?;
    check_square_tiles(a, "Cholesky")?;
    if a.m() != a.n() {
        return Err(Error::InvalidConfiguration(format!(
            "Cholesky needs a square matrix, got {}x{}",
            a.m(),
            a.n()
        )));
    }
    if a.storage() == Uplo::Upper {
        return Err(Error::InvalidConfiguration(
            "Cholesky factors the lower triangle; Upper storage is not supported".to_string(),
        ));
    }
    let mut engine = PanelEngine::new(comm, options)?;
    engine.run(&mut CholeskyPanels, a)
}
