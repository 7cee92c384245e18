//! Lookahead panel pipeline
//!
//! Every right-looking factorization here has the same shape: factor panel
//! `k`, share it, then fold it into every trailing tile column. The
//! [`PanelEngine`] owns that schedule; a [`PanelAlgorithm`] supplies the
//! per-step work.
//!
//! # Schedule
//!
//! `applied[j]` counts the steps already folded into tile column `j`. With
//! lookahead depth `L`:
//!
//! 1. while `L + 1` panels are outstanding, retire the oldest one by
//!    applying it to every column still waiting for it;
//! 2. factor panel `k` (its column is current by then);
//! 3. bring columns `k + 1 ..= k + L` up to date, so the next panels can
//!    be factored while the bulk of the update is still running.
//!
//! Each column receives the steps strictly in order and with the same
//! operands whatever `L` is, so results do not depend on the depth. The
//! schedule is a function of the step count and `L` only, which keeps every
//! rank issuing the same collectives in the same order.
//!
//! Retiring updates may run on the rank's devices; columns they touch are
//! synchronized before anything else reads or writes them.

use std::collections::{BTreeMap, VecDeque};
use tessera_comm::{Channel, Collectives, Communicator, RankGroup, Tag};
use tessera_core::{
    Error, ExecutionEngine, FactorKind, HostEngine, Options, PanelPool, PanelSlot, Rank, Result, Scalar,
    TiledMatrix,
};
use tessera_device::{PendingUpdate, TileOffload, UpdateTask};
use tracing::{debug, instrument, trace};

/// Progress of the panel currently being produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PanelState {
    Idle,
    PanelLocalFactor,
    PivotBroadcast,
    PanelBroadcast,
    TrailingUpdateScheduled,
    Done,
    Failed,
}

impl PanelState {
    /// Whether `next` may follow `self`
    pub fn can_advance_to(self, next: PanelState) -> bool {
        use PanelState::*;
        matches!(
            (self, next),
            (Idle, PanelLocalFactor)
                | (Idle, Done)
                | (PanelLocalFactor, PivotBroadcast)
                | (PanelLocalFactor, Failed)
                | (PivotBroadcast, PanelBroadcast)
                | (PanelBroadcast, TrailingUpdateScheduled)
                | (TrailingUpdateScheduled, PanelLocalFactor)
                | (TrailingUpdateScheduled, Done)
        )
    }
}

/// Per-step work of a right-looking factorization
pub(crate) trait PanelAlgorithm<T: Scalar> {
    fn kind(&self) -> FactorKind;

    /// Number of panels
    fn steps(&self, a: &TiledMatrix<T>) -> usize;

    /// Rank whose panel outcome every rank adopts
    fn status_root(&self, a: &TiledMatrix<T>, k: usize) -> Rank;

    /// Factor panel `k`. The status root returns the 1-based failing index,
    /// if any; other ranks' answers are ignored.
    fn factor_local<C: Communicator>(
        &mut self,
        comm: &C,
        a: &mut TiledMatrix<T>,
        k: usize,
        slot: &mut PanelSlot<T>,
    ) -> Result<Option<usize>>;

    /// Make the interchanges of panel `k` known and apply them left of it
    fn share_pivots<C: Communicator>(
        &mut self,
        comm: &C,
        a: &mut TiledMatrix<T>,
        k: usize,
        slot: &mut PanelSlot<T>,
    ) -> Result<()>;

    /// Deliver the factored panel to its owners and to every rank that updates with it
    fn share_panel<C: Communicator>(
        &mut self,
        comm: &C,
        a: &mut TiledMatrix<T>,
        k: usize,
        slot: &mut PanelSlot<T>,
    ) -> Result<()>;

    /// Host-side preparation of column `j` for step `slot.step()`; returns
    /// the tile products that complete the update
    fn prepare_column<C: Communicator>(
        &mut self,
        comm: &C,
        a: &mut TiledMatrix<T>,
        slot: &PanelSlot<T>,
        j: usize,
    ) -> Result<Vec<UpdateTask<T>>>;

    /// Error for a failure at 1-based `index` in panel `k`
    fn failure(&self, k: usize, index: usize) -> Error;
}

/// Reject a matrix not distributed over `comm`'s ranks
pub(crate) fn check_comm<T: Scalar, C: Communicator>(comm: &C, a: &TiledMatrix<T>) -> Result<()> {
    let ctx = a.context();
    if ctx.rank != comm.rank() || ctx.size != comm.size() || a.layout().grid().size() != comm.size() {
        return Err(Error::layout_mismatch(
            (comm.rank(), comm.size()),
            (ctx.rank, ctx.size),
            "matrix rank context vs communicator",
        ));
    }
    Ok(())
}

/// Panel algorithms keep tile rows and columns aligned
pub(crate) fn check_square_tiles<T: Scalar>(a: &TiledMatrix<T>, what: &str) -> Result<()> {
    if a.mb() != a.nb() {
        return Err(Error::InvalidConfiguration(format!(
            "{what} needs square tiles, got {}x{}",
            a.mb(),
            a.nb()
        )));
    }
    Ok(())
}

/// Run `tasks` on the host against the local tiles of `a`.
///
/// Tasks sharing a target run in the order given; distinct targets run in parallel.
pub(crate) fn execute_on_host<T: Scalar>(
    host: &HostEngine<T>,
    a: &mut TiledMatrix<T>,
    tasks: Vec<UpdateTask<T>>,
) -> Result<()> {
    if tasks.is_empty() {
        return Ok(());
    }
    let mut by_target: BTreeMap<(usize, usize), Vec<UpdateTask<T>>> = BTreeMap::new();
    for task in tasks {
        by_target.entry(task.target).or_default().push(task);
    }
    for &(i, j) in by_target.keys() {
        // materializes lazily allocated targets and rejects remote ones
        a.tile_at_mut(i, j)?;
    }
    let kernels = *host.kernels();
    let mut work: Vec<_> = a
        .tiles_mut()
        .filter_map(|(ij, tile)| by_target.remove(&ij).map(|tasks| (tile, tasks)))
        .collect();
    host.for_each_mut(&mut work, |(tile, tasks)| {
        for task in tasks.iter() {
            task.apply(&kernels, tile);
        }
    });
    Ok(())
}

/// Drives a [`PanelAlgorithm`] over a matrix with bounded lookahead
pub(crate) struct PanelEngine<'c, T: Scalar, C: Communicator> {
    comm: &'c C,
    lookahead: usize,
    host: HostEngine<T>,
    offload: Option<TileOffload<T>>,
    pool: PanelPool<T>,
    window: VecDeque<PanelSlot<T>>,
    applied: Vec<usize>,
    pending: PendingUpdate<T>,
    state: PanelState,
}

impl<'c, T: Scalar, C: Communicator> PanelEngine<'c, T, C> {
    /// Engine configured from `options`
    pub fn new(comm: &'c C, options: &Options) -> Result<Self> {
        options.validate()?;
        let lookahead = options.lookahead();
        let offload = match options.devices() {
            0 => None,
            n => Some(TileOffload::new(n, options.device_memory())?),
        };
        Ok(Self {
            comm,
            lookahead,
            host: HostEngine::from_threads(options.host_threads())?,
            offload,
            pool: PanelPool::for_lookahead(lookahead),
            window: VecDeque::new(),
            applied: Vec::new(),
            pending: PendingUpdate::none(),
            state: PanelState::Idle,
        })
    }

    /// Peak number of panels that were alive at once
    pub fn peak_panels(&self) -> usize {
        self.pool.stats().peak_outstanding
    }

    fn advance(&mut self, next: PanelState, step: usize) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::InvalidState(format!(
                "Panel {step}: cannot go from {:?} to {next:?}",
                self.state
            )));
        }
        trace!(step, from = ?self.state, to = ?next, "panel state");
        self.state = next;
        Ok(())
    }

    /// Factor `a` in place
    #[instrument(skip_all, fields(kind = ?alg.kind(), rank = self.comm.rank(), lookahead = self.lookahead))]
    pub fn run<A: PanelAlgorithm<T>>(&mut self, alg: &mut A, a: &mut TiledMatrix<T>) -> Result<()> {
        a.allocate()?;
        let steps = alg.steps(a);
        let nt = a.nt();
        self.applied = vec![0; nt];

        for k in 0..steps {
            while self.pool.is_full() {
                self.retire_oldest(alg, a)?;
            }
            self.bring_current(alg, a, &[k], k)?;
            self.factor(alg, a, k)?;

            let last = (k + self.lookahead).min(nt.saturating_sub(1));
            let ahead: Vec<usize> = (k + 1..=last).collect();
            self.bring_current(alg, a, &ahead, k + 1)?;
        }
        while !self.window.is_empty() {
            self.retire_oldest(alg, a)?;
        }
        self.settle(a)?;
        self.advance(PanelState::Done, steps)?;
        a.mark_factored(alg.kind());
        debug!(steps, peak_panels = self.peak_panels(), "factorization complete");
        Ok(())
    }

    fn factor<A: PanelAlgorithm<T>>(&mut self, alg: &mut A, a: &mut TiledMatrix<T>, k: usize) -> Result<()> {
        self.advance(PanelState::PanelLocalFactor, k)?;
        // a retired step may still be writing the panel column on a device
        if self.pending.touches(k) {
            self.settle(a)?;
        }
        let mut slot = self.pool.checkout(k)?;
        let local = alg.factor_local(self.comm, a, k, &mut slot)?;

        let root = alg.status_root(a, k);
        let mut status = vec![local.unwrap_or(0) as u64];
        self.comm
            .broadcast(&mut status, root, &RankGroup::all(self.comm.size()), Tag::new(Channel::Status, k))?;
        let failed = status.first().copied().unwrap_or(0) as usize;
        if failed != 0 {
            self.pool.checkin(slot);
            self.advance(PanelState::Failed, k)?;
            a.mark_failed(k);
            self.settle(a)?;
            debug!(step = k, index = failed, "panel factorization failed");
            return Err(alg.failure(k, failed));
        }

        self.advance(PanelState::PivotBroadcast, k)?;
        alg.share_pivots(self.comm, a, k, &mut slot)?;
        self.advance(PanelState::PanelBroadcast, k)?;
        alg.share_panel(self.comm, a, k, &mut slot)?;
        self.advance(PanelState::TrailingUpdateScheduled, k)?;

        if let Some(done) = self.applied.get_mut(k) {
            *done = k + 1;
        }
        self.window.push_back(slot);
        Ok(())
    }

    /// Apply every outstanding step below `target` to `cols`
    fn bring_current<A: PanelAlgorithm<T>>(
        &mut self,
        alg: &mut A,
        a: &mut TiledMatrix<T>,
        cols: &[usize],
        target: usize,
    ) -> Result<()> {
        let Some(from) = cols.iter().map(|&j| self.applied[j]).min() else {
            return Ok(());
        };
        for s in from..target {
            let due: Vec<usize> = cols.iter().copied().filter(|&j| self.applied[j] == s).collect();
            if !due.is_empty() {
                self.apply_step(alg, a, s, &due, false)?;
            }
        }
        Ok(())
    }

    fn retire_oldest<A: PanelAlgorithm<T>>(&mut self, alg: &mut A, a: &mut TiledMatrix<T>) -> Result<()> {
        let Some(s) = self.window.front().map(|slot| slot.step()) else {
            return Ok(());
        };
        let due: Vec<usize> = (s + 1..self.applied.len()).filter(|&j| self.applied[j] == s).collect();
        self.apply_step(alg, a, s, &due, true)?;
        if let Some(slot) = self.window.pop_front() {
            self.pool.checkin(slot);
        }
        trace!(step = s, columns = due.len(), "panel retired");
        Ok(())
    }

    fn apply_step<A: PanelAlgorithm<T>>(
        &mut self,
        alg: &mut A,
        a: &mut TiledMatrix<T>,
        s: usize,
        cols: &[usize],
        defer: bool,
    ) -> Result<()> {
        if cols.iter().any(|&j| self.pending.touches(j)) {
            self.settle(a)?;
        }
        let slot = self
            .window
            .iter()
            .find(|slot| slot.step() == s)
            .ok_or_else(|| Error::InvalidState(format!("Panel {s} was retired before its last use")))?;
        let mut tasks = Vec::new();
        for &j in cols {
            tasks.extend(alg.prepare_column(self.comm, a, slot, j)?);
        }
        self.execute(a, tasks, defer)?;
        for &j in cols {
            self.applied[j] = s + 1;
        }
        Ok(())
    }

    fn execute(&mut self, a: &mut TiledMatrix<T>, tasks: Vec<UpdateTask<T>>, defer: bool) -> Result<()> {
        match self.offload.as_mut() {
            None => execute_on_host(&self.host, a, tasks),
            Some(offload) => {
                if !self.pending.is_empty() {
                    let previous = std::mem::replace(&mut self.pending, PendingUpdate::none());
                    offload.complete(a, previous)?;
                }
                let pending = offload.submit(a, tasks)?;
                if defer {
                    self.pending = pending;
                    Ok(())
                } else {
                    offload.complete(a, pending)?;
                    offload.prune();
                    Ok(())
                }
            }
        }
    }

    /// Wait for outstanding device work and copy it back
    fn settle(&mut self, a: &mut TiledMatrix<T>) -> Result<()> {
        let pending = std::mem::replace(&mut self.pending, PendingUpdate::none());
        if let Some(offload) = self.offload.as_mut() {
            offload.complete(a, pending)?;
            offload.prune();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_core::{Op, ProcessGrid, RankContext, Tile};

    #[test]
    fn test_state_transitions() {
        use PanelState::*;
        let happy = [Idle, PanelLocalFactor, PivotBroadcast, PanelBroadcast, TrailingUpdateScheduled, PanelLocalFactor];
        for pair in happy.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
        assert!(TrailingUpdateScheduled.can_advance_to(Done));
        assert!(PanelLocalFactor.can_advance_to(Failed));
        assert!(!PanelBroadcast.can_advance_to(Failed));
        assert!(!Idle.can_advance_to(PanelBroadcast));
        assert!(!Done.can_advance_to(PanelLocalFactor));
        assert!(!Failed.can_advance_to(PanelLocalFactor));
    }

    #[test]
    fn test_host_execution_orders_tasks_per_target() {
        let grid = ProcessGrid::new(1, 1).unwrap();
        let mut a = TiledMatrix::<f64>::new(4, 4, 2, 2, grid, RankContext::single()).unwrap();
        a.fill_with(|_, _| 1.0).unwrap();
        let id = Arc::new(Tile::identity(2));
        let task = |target, beta| UpdateTask {
            target,
            alpha: 1.0,
            a: Arc::clone(&id),
            op_a: Op::NoTrans,
            b: Arc::clone(&id),
            op_b: Op::NoTrans,
            beta,
        };
        // (0, 0): scale by 2 then add I; (1, 1): add I then scale
        let tasks = vec![task((0, 0), 2.0), task((1, 1), 1.0), task((0, 0), 1.0), task((1, 1), 0.0)];
        let host = HostEngine::from_threads(1).unwrap();
        execute_on_host(&host, &mut a, tasks).unwrap();
        assert_eq!(a.local_get(0, 0).unwrap(), 4.0);
        assert_eq!(a.local_get(1, 0).unwrap(), 2.0);
        assert_eq!(a.local_get(2, 2).unwrap(), 1.0);
        assert_eq!(a.local_get(3, 2).unwrap(), 0.0);
        assert_eq!(a.local_get(0, 2).unwrap(), 1.0);
    }
}
