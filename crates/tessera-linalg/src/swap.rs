//! Distributed row and column interchanges
//!
//! A sequence of interchanges is first composed into a map "line `d`
//! receives the original contents of line `s`". For every tile column (or
//! tile row) involved, each rank snapshots the source lines it owns, ships
//! the ones destined elsewhere in one message per destination rank, and
//! writes the ones that land locally. All sends happen before any receive.

use std::collections::BTreeMap;
use tessera_comm::{Collectives, Communicator, Tag};
use tessera_core::{Rank, Result, Scalar, TiledMatrix};

/// Which lines of the matrix are interchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Axis {
    Rows,
    Cols,
}

/// `dest -> source` for every line that moves
pub(crate) fn compose(swaps: &[(usize, usize)]) -> BTreeMap<usize, usize> {
    let mut at: BTreeMap<usize, usize> = BTreeMap::new();
    for &(a, b) in swaps {
        if a == b {
            continue;
        }
        let la = at.get(&a).copied().unwrap_or(a);
        let lb = at.get(&b).copied().unwrap_or(b);
        at.insert(a, lb);
        at.insert(b, la);
    }
    at.retain(|dest, src| dest != src);
    at
}

struct Lines<'a, T> {
    a: &'a TiledMatrix<T>,
    axis: Axis,
}

impl<T: Scalar> Lines<'_, T> {
    /// Tile holding line `l` at cross index `x`, and the offset within it
    fn locate(&self, l: usize, x: usize) -> ((usize, usize), usize) {
        match self.axis {
            Axis::Rows => {
                let (i, r) = self.a.layout().tile_of_row(l);
                ((i, x), r)
            }
            Axis::Cols => {
                let (j, c) = self.a.layout().tile_of_col(l);
                ((x, j), c)
            }
        }
    }

    fn owner(&self, l: usize, x: usize) -> Rank {
        let ((i, j), _) = self.locate(l, x);
        self.a.owner(i, j)
    }

    fn read(&self, l: usize, x: usize) -> Result<Vec<T>> {
        let ((i, j), off) = self.locate(l, x);
        let tile = self.a.tile_at(i, j)?;
        Ok(match self.axis {
            Axis::Rows => tile.row(off),
            Axis::Cols => tile.column(off),
        })
    }

    /// Length of a line at cross index `x`
    fn width(&self, x: usize) -> usize {
        match self.axis {
            Axis::Rows => self.a.tile_nb(x),
            Axis::Cols => self.a.tile_mb(x),
        }
    }
}

fn write_line<T: Scalar>(a: &mut TiledMatrix<T>, axis: Axis, l: usize, x: usize, values: &[T]) -> Result<()> {
    match axis {
        Axis::Rows => {
            let (i, r) = a.layout().tile_of_row(l);
            a.tile_at_mut(i, x)?.set_row(r, values);
        }
        Axis::Cols => {
            let (j, c) = a.layout().tile_of_col(l);
            a.tile_at_mut(x, j)?.set_column(c, values);
        }
    }
    Ok(())
}

/// Apply `swaps` in order to the lines of `a` along `axis`, restricted to
/// the tile columns (rows interchanged) or tile rows (columns interchanged)
/// listed in `cross`.
///
/// Collective over every rank owning an affected tile; other ranks return
/// immediately. `tag.a` is replaced by the cross index.
pub(crate) fn swap_lines<T: Scalar, C: Communicator>(
    comm: &C,
    a: &mut TiledMatrix<T>,
    axis: Axis,
    swaps: &[(usize, usize)],
    cross: &[usize],
    tag: Tag,
) -> Result<()> {
    let moves = compose(swaps);
    if moves.is_empty() {
        return Ok(());
    }
    let me = comm.rank();

    for &x in cross {
        let lines = Lines { a: &*a, axis };
        let width = lines.width(x);
        let tag = Tag { a: x as u32, ..tag };

        // outgoing, grouped per destination rank in ascending destination order
        let mut outgoing: BTreeMap<Rank, Vec<T>> = BTreeMap::new();
        let mut local: Vec<(usize, Vec<T>)> = Vec::new();
        let mut incoming: BTreeMap<Rank, Vec<usize>> = BTreeMap::new();
        for (&dest, &src) in &moves {
            let (to, from) = (lines.owner(dest, x), lines.owner(src, x));
            if from == me {
                let values = lines.read(src, x)?;
                if to == me {
                    local.push((dest, values));
                } else {
                    outgoing.entry(to).or_default().extend(values);
                }
            } else if to == me {
                incoming.entry(from).or_default().push(dest);
            }
        }

        for (&to, values) in &outgoing {
            comm.send_slice(to, tag, values)?;
        }
        for (dest, values) in local {
            write_line(a, axis, dest, x, &values)?;
        }
        for (from, dests) in incoming {
            let values = comm.recv_exact::<T>(from, tag, dests.len() * width)?;
            for (dest, chunk) in dests.into_iter().zip(values.chunks_exact(width.max(1))) {
                write_line(a, axis, dest, x, chunk)?;
            }
        }
    }
    Ok(())
}
