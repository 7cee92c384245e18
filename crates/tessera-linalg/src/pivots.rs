//! Row interchange records
//!
//! A [`PivotTable`] lists, panel by panel, the row interchanges a
//! factorization performed, in the order it performed them. Applying the
//! entries in order to the original row ordering reproduces the permuted
//! ordering the factors refer to; [`PivotTable::apply_inverse`] undoes them.
//!
//! Tables are built by the factorizations only and are read-only afterwards.

use tessera_core::{Error, Result};

/// One interchange: global row `offset + local_row` swapped with `swap_with`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pivot {
    pub panel: usize,
    pub local_row: usize,
    pub swap_with: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PanelRecord {
    panel: usize,
    offset: usize,
    start: usize,
    end: usize,
}

/// Anything whose lines can be interchanged
pub trait RowSwap {
    fn swap_rows(&mut self, a: usize, b: usize);
}

impl<T> RowSwap for [T] {
    fn swap_rows(&mut self, a: usize, b: usize) {
        self.swap(a, b);
    }
}

impl<T> RowSwap for Vec<T> {
    fn swap_rows(&mut self, a: usize, b: usize) {
        self.as_mut_slice().swap(a, b);
    }
}

/// Ordered per-panel row interchanges of one factorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotTable {
    rows: usize,
    mb: usize,
    entries: Vec<Pivot>,
    panels: Vec<PanelRecord>,
}

impl PivotTable {
    pub(crate) fn new(rows: usize, mb: usize) -> Self {
        Self {
            rows,
            mb,
            entries: Vec::new(),
            panels: Vec::new(),
        }
    }

    /// Record panel `panel`, whose row `offset + c` was swapped with `targets[c]`.
    ///
    /// Every target must lie in the active trailing rows `offset + c..rows`.
    pub(crate) fn push_panel(&mut self, panel: usize, offset: usize, targets: &[usize]) -> Result<()> {
        if self.panels.last().is_some_and(|p| p.panel >= panel) {
            return Err(Error::InvalidState(format!(
                "Pivots for panel {panel} recorded out of order"
            )));
        }
        for (c, &target) in targets.iter().enumerate() {
            let row = offset + c;
            if target < row || target >= self.rows {
                return Err(Error::InvalidState(format!(
                    "Panel {panel} pivot {target} for row {row} outside the trailing rows {row}..{}",
                    self.rows
                )));
            }
        }
        let start = self.entries.len();
        self.entries.extend(targets.iter().enumerate().map(|(c, &t)| Pivot {
            panel,
            local_row: c,
            swap_with: t,
        }));
        self.panels.push(PanelRecord {
            panel,
            offset,
            start,
            end: self.entries.len(),
        });
        Ok(())
    }

    /// Global row count the table was computed against
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Tile row height of the factored matrix
    #[inline]
    pub fn tile_rows(&self) -> usize {
        self.mb
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Pivot] {
        &self.entries
    }

    /// Panels with recorded pivots, in factorization order
    pub fn panels(&self) -> impl Iterator<Item = usize> + '_ {
        self.panels.iter().map(|p| p.panel)
    }

    /// `(row, swap_with)` global pairs of one panel, in order
    pub fn panel_swaps(&self, panel: usize) -> Vec<(usize, usize)> {
        self.panels
            .iter()
            .find(|p| p.panel == panel)
            .map(|p| {
                self.entries[p.start..p.end]
                    .iter()
                    .map(|e| (p.offset + e.local_row, e.swap_with))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every interchange as global `(row, swap_with)` pairs, in order
    pub fn swaps(&self) -> Vec<(usize, usize)> {
        self.panels
            .iter()
            .flat_map(|p| {
                self.entries[p.start..p.end]
                    .iter()
                    .map(move |e| (p.offset + e.local_row, e.swap_with))
            })
            .collect()
    }

    /// Apply the interchanges in issue order
    pub fn apply_forward<R: RowSwap + ?Sized>(&self, rows: &mut R) {
        for (a, b) in self.swaps() {
            if a != b {
                rows.swap_rows(a, b);
            }
        }
    }

    /// Undo [`apply_forward`](Self::apply_forward)
    pub fn apply_inverse<R: RowSwap + ?Sized>(&self, rows: &mut R) {
        for (a, b) in self.swaps().into_iter().rev() {
            if a != b {
                rows.swap_rows(a, b);
            }
        }
    }

    /// `perm[r]` is the original row that ends up at row `r`
    pub fn permutation(&self) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..self.rows).collect();
        self.apply_forward(&mut perm);
        perm
    }

    /// Whether the table permutes nothing
    pub fn is_identity(&self) -> bool {
        self.swaps().iter().all(|(a, b)| a == b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table() -> PivotTable {
        let mut t = PivotTable::new(6, 2);
        t.push_panel(0, 0, &[3, 1]).unwrap();
        t.push_panel(1, 2, &[5, 4]).unwrap();
        t
    }

    #[test]
    fn test_permutation_and_inverse() {
        let t = table();
        assert_eq!(t.len(), 4);
        assert_eq!(t.swaps(), vec![(0, 3), (1, 1), (2, 5), (3, 4)]);
        // [0..6] -> swap(0,3) [3,1,2,0,4,5] -> swap(2,5) [3,1,5,0,4,2] -> swap(3,4) [3,1,5,4,0,2]
        assert_eq!(t.permutation(), vec![3, 1, 5, 4, 0, 2]);

        let mut rows: Vec<char> = "abcdef".chars().collect();
        t.apply_forward(&mut rows);
        t.apply_inverse(&mut rows);
        assert_eq!(rows, "abcdef".chars().collect::<Vec<_>>());
        assert!(!t.is_identity());
        assert_eq!(t.panel_swaps(1), vec![(2, 5), (3, 4)]);
        assert!(t.panel_swaps(7).is_empty());
    }

    #[test]
    fn test_pivots_must_stay_in_trailing_rows() {
        let mut t = PivotTable::new(6, 2);
        assert!(t.push_panel(1, 2, &[1]).is_err());
        assert!(t.push_panel(1, 2, &[6]).is_err());
        t.push_panel(1, 2, &[2, 3]).unwrap();
        assert!(t.is_identity());
        assert!(t.push_panel(0, 0, &[0]).is_err());
    }

    proptest! {
        #[test]
        fn prop_inverse_undoes_forward(
            rows in 1usize..40,
            mb in 1usize..7,
            draws in proptest::collection::vec(any::<u64>(), 40),
            values in proptest::collection::vec(any::<i32>(), 40),
        ) {
            let mut t = PivotTable::new(rows, mb);
            for (panel, offset) in (0..rows).step_by(mb).enumerate() {
                let targets: Vec<usize> = (offset..rows.min(offset + mb))
                    .map(|row| row + (draws[row] % (rows - row) as u64) as usize)
                    .collect();
                t.push_panel(panel, offset, &targets).unwrap();
            }
            prop_assert_eq!(t.len(), rows);

            let original = values[..rows].to_vec();
            let mut x = original.clone();
            t.apply_forward(&mut x);
            let perm = t.permutation();
            for r in 0..rows {
                prop_assert_eq!(x[r], original[perm[r]]);
            }
            t.apply_inverse(&mut x);
            prop_assert_eq!(x, original);
        }
    }
}
