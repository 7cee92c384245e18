//! Lookahead workspace: bounded pool of panel buffers
//!
//! Each factorization step produces a panel (the factored block column, its
//! pivots, and per-column row results) that stays alive until every
//! trailing column has consumed it. The pool caps how many such panels can
//! be outstanding at once, which is what bounds lookahead memory: with depth
//! `L` at most `L + 1` panels exist on a rank.
//!
//! The pool belongs to one engine instance; nothing here is process-wide.

use crate::tile::Tile;
use crate::{Error, Result, Scalar};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Panel produced by one factorization step
#[derive(Debug)]
pub struct PanelSlot<T> {
    step: usize,
    tiles: BTreeMap<usize, Arc<Tile<T>>>,
    pivots: Vec<usize>,
    row_factors: BTreeMap<usize, Arc<Tile<T>>>,
    aux: Option<Arc<Tile<T>>>,
}

impl<T: Scalar> PanelSlot<T> {
    fn new() -> Self {
        Self {
            step: 0,
            tiles: BTreeMap::new(),
            pivots: Vec::new(),
            row_factors: BTreeMap::new(),
            aux: None,
        }
    }

    fn reset(&mut self, step: usize) {
        self.step = step;
        self.tiles.clear();
        self.pivots.clear();
        self.row_factors.clear();
        self.aux = None;
    }

    #[inline]
    pub fn step(&self) -> usize {
        self.step
    }

    /// Panel tile in tile row `i`
    pub fn tile(&self, i: usize) -> Option<&Arc<Tile<T>>> {
        self.tiles.get(&i)
    }

    pub fn set_tile(&mut self, i: usize, tile: Tile<T>) {
        self.tiles.insert(i, Arc::new(tile));
    }

    pub fn tiles(&self) -> impl Iterator<Item = (usize, &Arc<Tile<T>>)> {
        self.tiles.iter().map(|(&i, t)| (i, t))
    }

    /// Global row interchanges of this step, in order
    #[inline]
    pub fn pivots(&self) -> &[usize] {
        &self.pivots
    }

    pub fn set_pivots(&mut self, pivots: &[usize]) {
        self.pivots.clear();
        self.pivots.extend_from_slice(pivots);
    }

    /// Row result for trailing column `j` (`U(k, j)` for LU)
    pub fn row_factor(&self, j: usize) -> Option<&Arc<Tile<T>>> {
        self.row_factors.get(&j)
    }

    pub fn set_row_factor(&mut self, j: usize, tile: Tile<T>) {
        self.row_factors.insert(j, Arc::new(tile));
    }

    /// Step-wide auxiliary tile (the `T` factor for QR)
    pub fn aux(&self) -> Option<&Arc<Tile<T>>> {
        self.aux.as_ref()
    }

    pub fn set_aux(&mut self, tile: Tile<T>) {
        self.aux = Some(Arc::new(tile));
    }
}

/// Counters for tests and logs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub checkouts: usize,
    pub reused: usize,
    pub peak_outstanding: usize,
}

/// Bounded pool of [`PanelSlot`]s
#[derive(Debug)]
pub struct PanelPool<T> {
    free: Vec<PanelSlot<T>>,
    capacity: usize,
    outstanding: usize,
    stats: PoolStats,
}

impl<T: Scalar> PanelPool<T> {
    /// Pool allowing `lookahead + 1` outstanding panels
    pub fn for_lookahead(lookahead: usize) -> Self {
        Self::new(lookahead + 1)
    }

    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            outstanding: 0,
            stats: PoolStats::default(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Whether another checkout would exceed the bound
    #[inline]
    pub fn is_full(&self) -> bool {
        self.outstanding >= self.capacity
    }

    #[inline]
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Take a cleared slot for `step`; fails when the bound is reached
    pub fn checkout(&mut self, step: usize) -> Result<PanelSlot<T>> {
        if self.is_full() {
            return Err(Error::InvalidState(format!(
                "Panel pool exhausted: {} of {} panels outstanding",
                self.outstanding, self.capacity
            )));
        }
        let mut slot = match self.free.pop() {
            Some(slot) => {
                self.stats.reused += 1;
                slot
            }
            None => PanelSlot::new(),
        };
        slot.reset(step);
        self.outstanding += 1;
        self.stats.checkouts += 1;
        self.stats.peak_outstanding = self.stats.peak_outstanding.max(self.outstanding);
        Ok(slot)
    }

    /// Return a slot once every column has consumed it
    pub fn checkin(&mut self, mut slot: PanelSlot<T>) {
        slot.reset(0);
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.free.len() < self.capacity {
            self.free.push(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_is_enforced() {
        let mut pool = PanelPool::<f64>::for_lookahead(1);
        assert_eq!(pool.capacity(), 2);
        let a = pool.checkout(0).unwrap();
        let b = pool.checkout(1).unwrap();
        assert!(pool.is_full());
        assert!(pool.checkout(2).is_err());

        pool.checkin(a);
        let c = pool.checkout(2).unwrap();
        assert_eq!(c.step(), 2);
        assert_eq!(pool.stats().reused, 1);
        assert_eq!(pool.stats().peak_outstanding, 2);
        pool.checkin(b);
        pool.checkin(c);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_slot_is_cleared_on_reuse() {
        let mut pool = PanelPool::<f64>::new(1);
        let mut slot = pool.checkout(0).unwrap();
        slot.set_tile(0, Tile::identity(2));
        slot.set_pivots(&[1, 1]);
        slot.set_row_factor(3, Tile::zeros(2, 2));
        slot.set_aux(Tile::zeros(1, 1));
        pool.checkin(slot);

        let slot = pool.checkout(5).unwrap();
        assert!(slot.tile(0).is_none());
        assert!(slot.pivots().is_empty());
        assert!(slot.row_factor(3).is_none());
        assert!(slot.aux().is_none());
    }

    #[test]
    fn test_zero_lookahead_allows_one_panel() {
        let mut pool = PanelPool::<f32>::for_lookahead(0);
        let slot = pool.checkout(0).unwrap();
        assert!(pool.checkout(1).is_err());
        pool.checkin(slot);
        assert!(pool.checkout(1).is_ok());
    }
}
