//! LU factorization with partial pivoting
//!
//! `P A = L U` with unit lower `L`, computed in place. Panel `k` is
//! gathered onto the owner of its diagonal tile and factored there; the
//! chosen interchanges are broadcast to every rank, applied at once to the
//! finished columns on the left, and to each trailing column just before
//! that column is updated.

use crate::engine::{check_comm, check_square_tiles, PanelAlgorithm, PanelEngine};
use crate::pivots::PivotTable;
use crate::swap::{swap_lines, Axis};
use crate::transfer::{broadcast_tile, gather_column};
use std::sync::Arc;
use tessera_comm::{Channel, Collectives, Communicator, RankGroup, Tag};
use tessera_core::{
    numeric, Diag, Error, FactorKind, Op, Options, PanelSlot, PanelVariant, PivotPolicy, Rank, Result, Scalar,
    ScalarBackend, Side, Tile, TileKernels, TiledMatrix, Uplo,
};
use tessera_device::UpdateTask;
use tracing::{debug, instrument};

pub(crate) struct LuPanels<T: Scalar> {
    variant: PanelVariant,
    tolerance: T::Real,
    pivots: PivotTable,
    /// Factored panel held by the root between factoring and sharing
    factored: Option<Tile<T>>,
    chosen: Vec<usize>,
}

impl<T: Scalar> LuPanels<T> {
    fn new(a: &TiledMatrix<T>, options: &Options) -> Self {
        Self {
            variant: options.panel_variant(),
            tolerance: <T::Real as Scalar>::from_f64(options.tolerance()),
            pivots: PivotTable::new(a.m(), a.mb()),
            factored: None,
            chosen: Vec::new(),
        }
    }

    fn policy(&self, panel: &Tile<T>) -> PivotPolicy<T::Real> {
        let threshold = panel.max_abs() * self.tolerance * numeric::epsilon::<T>();
        match self.variant {
            PanelVariant::PartialPivot => PivotPolicy::partial(threshold),
            PanelVariant::NoPivot => PivotPolicy::no_pivot(threshold),
        }
    }
}

/// Ranks that receive panel tile `(i, k)`: its owner and every rank updating tile row `i`
pub(crate) fn row_group<T: Scalar>(a: &TiledMatrix<T>, i: usize, k: usize, root: Rank) -> RankGroup {
    RankGroup::new(
        (k..a.nt())
            .map(|j| a.owner(i, j))
            .chain([root]),
    )
}

impl<T: Scalar> PanelAlgorithm<T> for LuPanels<T> {
    fn kind(&self) -> FactorKind {
        FactorKind::Lu
    }

    fn steps(&self, a: &TiledMatrix<T>) -> usize {
        a.mt().min(a.nt())
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
        let root = a.owner(k, k);
        let Some(mut panel) = gather_column(comm, a, k, k, root, Tag::new(Channel::Tile, k))? else {
            return Ok(None);
        };
        let policy = self.policy(&panel);
        match ScalarBackend.getrf(&mut panel, policy) {
            Ok(local) => {
                let offset = k * a.mb();
                self.chosen = local.into_iter().map(|p| offset + p).collect();
                self.factored = Some(panel);
                Ok(None)
            }
            Err(breakdown) => Ok(Some(k * a.nb() + breakdown.column + 1)),
        }
    }

    fn share_pivots<C: Communicator>(
        &mut self,
        comm: &C,
        a: &mut TiledMatrix<T>,
        k: usize,
        slot: &mut PanelSlot<T>,
    ) -> Result<()> {
        let root = a.owner(k, k);
        let mut wire: Vec<u64> = if comm.rank() == root {
            self.chosen.iter().map(|&p| p as u64).collect()
        } else {
            Vec::new()
        };
        comm.broadcast(&mut wire, root, &RankGroup::all(comm.size()), Tag::new(Channel::Pivots, k))?;
        let targets: Vec<usize> = wire.into_iter().map(|p| p as usize).collect();
        self.pivots.push_panel(k, k * a.mb(), &targets)?;
        slot.set_pivots(&targets);

        let left: Vec<usize> = (0..k).collect();
        swap_lines(comm, a, Axis::Rows, &self.pivots.panel_swaps(k), &left, Tag::new(Channel::Swap, k))
    }

    fn share_panel<C: Communicator>(
        &mut self,
        comm: &C,
        a: &mut TiledMatrix<T>,
        k: usize,
        slot: &mut PanelSlot<T>,
    ) -> Result<()> {
        let me = comm.rank();
        let root = a.owner(k, k);
        let factored = self.factored.take();
        let mut offset = 0;
        for i in k..a.mt() {
            let shape = (a.tile_mb(i), a.tile_nb(k));
            let group = row_group(a, i, k, root);
            if group.contains(me) {
                let part = factored.as_ref().map(|p| p.sub_tile(offset, 0, shape.0, shape.1));
                let tile = broadcast_tile(comm, part.as_ref(), shape, root, &group, Tag::new(Channel::Panel, k).with(i, 0))?;
                if a.is_local(i, k) {
                    a.store_tile(i, k, &tile)?;
                }
                slot.set_tile(i, tile);
            }
            offset += shape.0;
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
        let me = comm.rank();
        swap_lines(
            comm,
            a,
            Axis::Rows,
            &self.pivots.panel_swaps(s),
            &[j],
            Tag::new(Channel::Swap, s).with(0, 1),
        )?;

        // U(s, j) = L(s, s)^-1 A(s, j) on its owner
        let owner = a.owner(s, j);
        if owner == me {
            let diag = slot
                .tile(s)
                .ok_or_else(|| Error::InvalidState(format!("Diagonal tile of panel {s} missing on rank {me}")))?;
            let target = a.tile_at_mut(s, j)?;
            ScalarBackend.trsm(Side::Left, Uplo::Lower, Op::NoTrans, Diag::Unit, T::one(), diag, target);
        }
        if s + 1 >= a.mt() {
            return Ok(Vec::new());
        }

        let group = RankGroup::new((s..a.mt()).map(|i| a.owner(i, j)));
        if !group.contains(me) {
            return Ok(Vec::new());
        }
        let mine = if owner == me { Some(a.tile_at(s, j)?) } else { None };
        let u = Arc::new(broadcast_tile(
            comm,
            mine,
            (a.tile_mb(s), a.tile_nb(j)),
            owner,
            &group,
            Tag::new(Channel::RowFactor, s).with(j, 0),
        )?);

        let mut tasks = Vec::new();
        for i in s + 1..a.mt() {
            if !a.is_local(i, j) {
                continue;
            }
            let l = slot
                .tile(i)
                .ok_or_else(|| Error::InvalidState(format!("Panel {s} tile {i} missing on rank {me}")))?;
            tasks.push(UpdateTask {
                target: (i, j),
                alpha: -T::one(),
                a: Arc::clone(l),
                op_a: Op::NoTrans,
                b: Arc::clone(&u),
                op_b: Op::NoTrans,
                beta: T::one(),
            });
        }
        Ok(tasks)
    }

    fn failure(&self, k: usize, index: usize) -> Error {
        Error::Singular { panel: k, index }
    }
}

/// Factor `a` in place as `P A = L U`.
///
/// Collective over every rank of the grid. Returns the interchanges; a
/// zero pivot (relative to the panel's largest entry) fails with
/// [`Error::Singular`] and marks the matrix failed.
#[instrument(skip_all, fields(m = a.m(), n = a.n(), nb = a.nb(), rank = comm.rank()))]
pub fn lu_factor<T: Scalar, C: Communicator>(comm: &C, a: &mut TiledMatrix<T>, options: &Options) -> Result<PivotTable> {
    check_comm(comm, a)?;
    check_square_tiles(a, "LU")?;
    if a.storage() != Uplo::General {
        return Err(Error::InvalidConfiguration(format!(
            "LU needs General storage, matrix stores {:?}",
            a.storage()
        )));
    }
    let mut alg = LuPanels::new(a, options);
    let mut engine = PanelEngine::new(comm, options)?;
    engine.run(&mut alg, a)?;
    debug!(interchanges = alg.pivots.len(), "LU done");
    Ok(alg.pivots)
}
