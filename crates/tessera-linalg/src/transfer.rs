//! Moving tiles between ranks
//!
//! Tiles travel as packed column-major values; receivers always know the
//! extent from the layout, so only the values are sent.

use tessera_comm::{Channel, Collectives, Communicator, RankGroup, Tag};
use tessera_core::{Rank, Result, Scalar, Tile, TiledMatrix};

/// Broadcast a `rows x cols` tile held by `root` to every member of `group`.
///
/// Only the root passes `Some(tile)`; every member gets its own copy back.
pub(crate) fn broadcast_tile<T: Scalar, C: Communicator>(
    comm: &C,
    tile: Option<&Tile<T>>,
    (rows, cols): (usize, usize),
    root: Rank,
    group: &RankGroup,
    tag: Tag,
) -> Result<Tile<T>> {
    let mut data = match tile {
        Some(t) if comm.rank() == root => t.to_col_major(),
        _ => Vec::new(),
    };
    comm.broadcast(&mut data, root, group, tag)?;
    Tile::from_col_major(rows, cols, data)
}

pub(crate) fn send_tile<T: Scalar, C: Communicator>(comm: &C, tile: &Tile<T>, dest: Rank, tag: Tag) -> Result<()> {
    comm.send_slice(dest, tag, &tile.to_col_major())
}

pub(crate) fn recv_tile<T: Scalar, C: Communicator>(
    comm: &C,
    (rows, cols): (usize, usize),
    source: Rank,
    tag: Tag,
) -> Result<Tile<T>> {
    let data = comm.recv_exact::<T>(source, tag, rows * cols)?;
    Tile::from_col_major(rows, cols, data)
}

/// Tile `(i, j)` of `a` fetched onto `dest`.
///
/// The owner sends, `dest` receives; other ranks return `None`. When the
/// owner is `dest` the local tile is cloned.
pub(crate) fn fetch_tile<T: Scalar, C: Communicator>(
    comm: &C,
    a: &TiledMatrix<T>,
    (i, j): (usize, usize),
    dest: Rank,
    tag: Tag,
) -> Result<Option<Tile<T>>> {
    let me = comm.rank();
    let owner = a.owner(i, j);
    if owner == me && dest == me {
        return Ok(Some(a.tile_at(i, j)?.clone()));
    }
    if owner == me {
        send_tile(comm, a.tile_at(i, j)?, dest, tag)?;
    }
    if dest == me {
        return recv_tile(comm, (a.tile_mb(i), a.tile_nb(j)), owner, tag).map(Some);
    }
    Ok(None)
}

/// Stack the tiles `(first..mt, j)` of one tile column on `root`.
///
/// Returns the stacked panel on the root, `None` elsewhere.
pub(crate) fn gather_column<T: Scalar, C: Communicator>(
    comm: &C,
    a: &TiledMatrix<T>,
    j: usize,
    first: usize,
    root: Rank,
    tag: Tag,
) -> Result<Option<Tile<T>>> {
    let me = comm.rank();
    let rows: usize = (first..a.mt()).map(|i| a.tile_mb(i)).sum();
    let mut panel = if me == root {
        Some(Tile::try_zeros(rows, a.tile_nb(j))?)
    } else {
        None
    };
    let mut offset = 0;
    for i in first..a.mt() {
        if let Some(tile) = fetch_tile(comm, a, (i, j), root, tag.with(i, j))? {
            if let Some(p) = panel.as_mut() {
                p.set_sub_tile(offset, 0, &tile);
            }
        }
        offset += a.tile_mb(i);
    }
    Ok(panel)
}

/// Collect the stored tiles of `a` into a dense column-major `m x n` array on `root`.
///
/// Tiles outside the stored triangle are left zero.
pub fn gather<T: Scalar, C: Communicator>(comm: &C, a: &TiledMatrix<T>, root: Rank) -> Result<Option<Vec<T>>> {
    let me = comm.rank();
    let m = a.m();
    let mut dense = if me == root { Some(vec![T::zero(); m * a.n()]) } else { None };
    let tag = Tag::new(Channel::Gather, 0);
    for j in 0..a.nt() {
        for i in 0..a.mt() {
            if !a.has_tile(i, j) {
                continue;
            }
            let Some(tile) = fetch_tile(comm, a, (i, j), root, tag.with(i, j))? else {
                continue;
            };
            if let Some(out) = dense.as_mut() {
                let (r0, c0) = (i * a.mb(), j * a.nb());
                for c in 0..tile.cols() {
                    let col = (c0 + c) * m + r0;
                    out[col..col + tile.rows()].copy_from_slice(tile.col(c));
                }
            }
        }
    }
    Ok(dense)
}

/// [`gather`] to rank 0 followed by a broadcast, so every rank holds the array
pub fn all_gather<T: Scalar, C: Communicator>(comm: &C, a: &TiledMatrix<T>) -> Result<Vec<T>> {
    let mut dense = gather(comm, a, 0)?.unwrap_or_default();
    comm.broadcast(&mut dense, 0, &RankGroup::all(comm.size()), Tag::new(Channel::Gather, 1))?;
    Ok(dense)
}
