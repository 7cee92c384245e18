//! Aasen's factorization of Hermitian indefinite matrices
//!
//! `P A P^H = L T L^H` with unit lower `L` whose first block column is the
//! identity, and block tridiagonal Hermitian `T`. Column `c >= 1` of `L` is
//! stored in tile column `c - 1` of `A`, below the diagonal tile; the
//! diagonal block `L(c, c)` is the strict lower part of `A(c, c - 1)`.
//!
//! Step `k` builds block column `k` of `H = T L^H`, derives `T(k, k)`, and
//! factors the panel `A(k+1.., k) - L H(.., k)` with partial pivoting to get
//! the next block column of `L` and `T(k+1, k)`. The interchanges are
//! applied symmetrically to the trailing matrix. `T` is replicated on every
//! rank and finished with a band LU.

use crate::band::BandMatrix;
use crate::engine::{check_comm, check_square_tiles};
use crate::pivots::PivotTable;
use crate::swap::{swap_lines, Axis};
use crate::transfer::{broadcast_tile, fetch_tile, gather_column, recv_tile, send_tile};
use std::collections::BTreeMap;
use tessera_comm::{Channel, Collectives, Communicator, RankGroup, Tag};
use tessera_core::{
    Diag, Error, FactorKind, Op, Options, PivotPolicy, Result, Scalar, ScalarBackend, Side, Tile, TileKernels,
    TiledMatrix, Uplo,
};
use tracing::{debug, instrument, trace};

/// Factors of `P A P^H = L T L^H`
#[derive(Debug)]
pub struct IndefiniteFactor<T: Scalar> {
    pivots: PivotTable,
    band: BandMatrix<T>,
    h: TiledMatrix<T>,
}

impl<T: Scalar> IndefiniteFactor<T> {
    /// Symmetric interchanges `P`
    pub fn pivots(&self) -> &PivotTable {
        &self.pivots
    }

    /// Band LU of the block tridiagonal `T`
    pub fn band(&self) -> &BandMatrix<T> {
        &self.band
    }

    /// The auxiliary `H = T L^H` blocks computed on the way
    pub fn h(&self) -> &TiledMatrix<T> {
        &self.h
    }
}

fn sum_into<T: Scalar>(acc: &mut [T], part: &[T]) {
    for (x, &y) in acc.iter_mut().zip(part) {
        *x += y;
    }
}

/// Block row `k` of `L`, as received from tile row `k` of `A`
struct LRow<T: Scalar> {
    k: usize,
    rows: usize,
    tiles: BTreeMap<usize, Tile<T>>,
}

impl<T: Scalar> LRow<T> {
    /// `L(k, l)`, `None` where the block is zero or not held here
    fn get(&self, l: usize) -> Option<Tile<T>> {
        if l == 0 {
            return (self.k == 0).then(|| Tile::identity(self.rows));
        }
        let tile = self.tiles.get(&l)?;
        if l == self.k {
            Some(tile.sub_tile(0, 0, self.rows, self.rows).unit_lower())
        } else {
            Some(tile.clone())
        }
    }
}

struct Aasen<'c, T: Scalar, C: Communicator> {
    comm: &'c C,
    /// `T(k, k)`, replicated
    diag: Vec<Tile<T>>,
    /// `T(k + 1, k)`, replicated
    sub: Vec<Tile<T>>,
    h: TiledMatrix<T>,
    pivots: PivotTable,
}

impl<'c, T: Scalar, C: Communicator> Aasen<'c, T, C> {
    fn new(comm: &'c C, a: &TiledMatrix<T>) -> Result<Self> {
        Ok(Self {
            comm,
            diag: Vec::with_capacity(a.mt()),
            sub: Vec::with_capacity(a.mt()),
            h: a.zeros_like()?,
            pivots: PivotTable::new(a.m(), a.mb()),
        })
    }

    fn step(&mut self, a: &mut TiledMatrix<T>, k: usize) -> Result<()> {
        let comm = self.comm;
        let me = comm.rank();
        let mt = a.mt();
        let kernels = ScalarBackend;
        let column = RankGroup::new((0..mt).map(|i| a.owner(i, k)));
        let rows = a.tile_mb(k);

        let mut lrow = LRow { k, rows, tiles: BTreeMap::new() };
        for l in 1..=k {
            let owner = a.owner(k, l - 1);
            let group = column.with(owner);
            if !group.contains(me) {
                continue;
            }
            let mine = if owner == me { Some(a.tile_at(k, l - 1)?) } else { None };
            let tile = broadcast_tile(
                comm,
                mine,
                (rows, a.tile_nb(l - 1)),
                owner,
                &group,
                Tag::new(Channel::Broadcast, k).with(l, 0),
            )?;
            lrow.tiles.insert(l, tile);
        }

        // H(j, k) = T(j, j-1) L(k, j-1)^H + T(j, j) L(k, j)^H + T(j, j+1) L(k, j+1)^H
        if column.contains(me) {
            for j in 0..k {
                if !a.is_local(j, k) {
                    continue;
                }
                let mut hjk = Tile::try_zeros(a.tile_mb(j), rows)?;
                if j >= 1 {
                    if let Some(l) = lrow.get(j - 1) {
                        kernels.gemm(T::one(), Op::NoTrans, &self.sub[j - 1], Op::ConjTrans, &l, T::one(), &mut hjk);
                    }
                }
                if let Some(l) = lrow.get(j) {
                    kernels.gemm(T::one(), Op::NoTrans, &self.diag[j], Op::ConjTrans, &l, T::one(), &mut hjk);
                }
                if let Some(l) = lrow.get(j + 1) {
                    kernels.gemm(T::one(), Op::ConjTrans, &self.sub[j], Op::ConjTrans, &l, T::one(), &mut hjk);
                }
                self.h.store_tile(j, k, &hjk)?;
            }
        }

        // sum_{j<k} L(k, j) H(j, k), reduced on the diagonal owner
        let root = a.owner(k, k);
        let mut coupling = None;
        if k > 0 && column.contains(me) {
            let mut part = Tile::try_zeros(rows, rows)?;
            for j in 1..k {
                if !a.is_local(j, k) {
                    continue;
                }
                if let Some(l) = lrow.get(j) {
                    kernels.gemm(T::one(), Op::NoTrans, &l, Op::NoTrans, self.h.tile_at(j, k)?, T::one(), &mut part);
                }
            }
            let mut data = part.to_col_major();
            comm.reduce(&mut data, sum_into, root, &column, Tag::new(Channel::Reduce, k))?;
            if me == root {
                coupling = Some(Tile::from_col_major(rows, rows, data)?);
            }
        }

        let mut tkk = None;
        if me == root {
            let akk = a.tile_at(k, k)?;
            let z = match &coupling {
                Some(s) => Tile::from_fn(rows, rows, |r, c| akk.get(r, c) - s.get(r, c)),
                None => akk.clone(),
            };
            let (t, h) = if k == 0 {
                let mut t = z;
                t.hermitian_from_lower();
                (t.clone(), t)
            } else {
                let lkk = lrow
                    .get(k)
                    .ok_or_else(|| Error::InvalidState(format!("L({k}, {k}) missing on rank {me}")))?;
                let below = lrow.get(k - 1);
                let mut t = z;
                kernels.trsm(Side::Left, Uplo::Lower, Op::NoTrans, Diag::Unit, T::one(), &lkk, &mut t);
                if let Some(l) = &below {
                    kernels.gemm(-T::one(), Op::NoTrans, &self.sub[k - 1], Op::ConjTrans, l, T::one(), &mut t);
                }
                kernels.trsm(Side::Right, Uplo::Lower, Op::ConjTrans, Diag::Unit, T::one(), &lkk, &mut t);
                t.hermitian_from_lower();

                let mut h = Tile::try_zeros(rows, rows)?;
                if let Some(l) = &below {
                    kernels.gemm(T::one(), Op::NoTrans, &self.sub[k - 1], Op::ConjTrans, l, T::zero(), &mut h);
                }
                kernels.gemm(T::one(), Op::NoTrans, &t, Op::ConjTrans, &lkk, T::one(), &mut h);
                (t, h)
            };
            self.h.store_tile(k, k, &h)?;
            tkk = Some(t);
        }
        let everyone = RankGroup::all(comm.size());
        let t = broadcast_tile(comm, tkk.as_ref(), (rows, rows), root, &everyone, Tag::new(Channel::Broadcast, k).with(0, 1))?;
        self.diag.push(t);

        if k + 1 >= mt {
            return Ok(());
        }
        self.next_column(a, k, &column, &lrow)
    }

    /// Factor `A(k+1.., k) - L(k+1.., 1..=k) H(1..=k, k)` into the next block column of `L`
    fn next_column(&mut self, a: &mut TiledMatrix<T>, k: usize, column: &RankGroup, lrow: &LRow<T>) -> Result<()> {
        let comm = self.comm;
        let me = comm.rank();
        let (mt, nb) = (a.mt(), a.nb());
        let kernels = ScalarBackend;

        let mut hcol: BTreeMap<usize, Tile<T>> = BTreeMap::new();
        if column.contains(me) {
            for j in 1..=k {
                let owner = a.owner(j, k);
                let mine = if owner == me { Some(self.h.tile_at(j, k)?) } else { None };
                let tile = broadcast_tile(
                    comm,
                    mine,
                    (a.tile_mb(j), a.tile_mb(k)),
                    owner,
                    column,
                    Tag::new(Channel::Broadcast, k).with(j, 2),
                )?;
                hcol.insert(j, tile);
            }
        }

        for i in k + 1..mt {
            let dest = a.owner(i, k);
            for j in 1..=k {
                let Some(l) = fetch_tile(comm, a, (i, j - 1), dest, Tag::new(Channel::Tile, k).with(i, j))? else {
                    continue;
                };
                let h = hcol
                    .get(&j)
                    .ok_or_else(|| Error::InvalidState(format!("H({j}, {k}) missing on rank {me}")))?;
                kernels.gemm(-T::one(), Op::NoTrans, &l, Op::NoTrans, h, T::one(), a.tile_at_mut(i, k)?);
            }
        }

        let root = a.owner(k + 1, k);
        let offset = (k + 1) * nb;
        let mut chosen: Vec<u64> = Vec::new();
        let mut tsub = None;
        let factored = match gather_column(comm, a, k, k + 1, root, Tag::new(Channel::Panel, k))? {
            Some(mut panel) => {
                let local = kernels
                    .getrf(&mut panel, PivotPolicy::tolerant())
                    .map_err(|b| Error::Execution(format!("tolerant panel LU stopped at column {}", b.column)))?;
                chosen = local.into_iter().map(|p| (offset + p) as u64).collect();

                let top = a.tile_mb(k + 1);
                let u = panel.sub_tile(0, 0, top, nb).upper();
                let lkk = lrow
                    .get(k)
                    .ok_or_else(|| Error::InvalidState(format!("L({k}, {k}) missing on rank {me}")))?;
                let mut t = u.clone();
                kernels.trsm(Side::Right, Uplo::Lower, Op::ConjTrans, Diag::Unit, T::one(), &lkk, &mut t);
                self.h.store_tile(k + 1, k, &u)?;
                tsub = Some(t);
                Some(panel)
            }
            None => None,
        };

        let everyone = RankGroup::all(comm.size());
        comm.broadcast(&mut chosen, root, &everyone, Tag::new(Channel::Pivots, k))?;
        let targets: Vec<usize> = chosen.into_iter().map(|p| p as usize).collect();
        self.pivots.push_panel(k, offset, &targets)?;
        let t = broadcast_tile(
            comm,
            tsub.as_ref(),
            (a.tile_mb(k + 1), nb),
            root,
            &everyone,
            Tag::new(Channel::Broadcast, k).with(0, 3),
        )?;
        self.sub.push(t);

        // L(k+1.., k+1) back to the owners of tile column k
        let mut at = 0;
        for i in k + 1..mt {
            let owner = a.owner(i, k);
            let shape = (a.tile_mb(i), nb);
            let tag = Tag::new(Channel::Tile, k).with(i, 0);
            if let Some(panel) = factored.as_ref() {
                let part = panel.sub_tile(at, 0, shape.0, shape.1);
                if owner == me {
                    a.store_tile(i, k, &part)?;
                } else {
                    send_tile(comm, &part, owner, tag)?;
                }
            } else if owner == me {
                let part = recv_tile(comm, shape, root, tag)?;
                a.store_tile(i, k, &part)?;
            }
            at += shape.0;
        }

        let swaps = self.pivots.panel_swaps(k);
        let left: Vec<usize> = (0..k).collect();
        let trailing: Vec<usize> = (k + 1..a.nt()).collect();
        swap_lines(comm, a, Axis::Rows, &swaps, &left, Tag::new(Channel::Swap, k).with(0, 0))?;
        swap_lines(comm, a, Axis::Rows, &swaps, &trailing, Tag::new(Channel::Swap, k).with(0, 1))?;
        swap_lines(comm, a, Axis::Cols, &swaps, &trailing, Tag::new(Channel::Swap, k).with(0, 2))?;
        trace!(step = k, interchanges = swaps.len(), "Aasen column done");
        Ok(())
    }
}

/// Factor Hermitian `a` in place as `P A P^H = L T L^H` (Aasen).
///
/// `a` must hold both triangles (`General` storage) with square tiles.
/// Fails with [`Error::Singular`] when the band LU of `T` meets a zero
/// pivot, in which case `a` is marked failed.
#[instrument(skip_all, fields(n = a.n(), nb = a.nb(), rank = comm.rank()))]
pub fn indefinite_factor<T: Scalar, C: Communicator>(
    comm: &C,
    a: &mut TiledMatrix<T>,
    options: &Options,
) -> Result<IndefiniteFactor<T>> {
    check_comm(comm, a)?;
    check_square_tiles(a, "Aasen")?;
    if a.m() != a.n() {
        return Err(Error::InvalidConfiguration(format!(
            "Aasen needs a square matrix, got {}x{}",
            a.m(),
            a.n()
        )));
    }
    if a.storage() != Uplo::General {
        return Err(Error::InvalidConfiguration(format!(
            "Aasen needs General storage, matrix stores {:?}",
            a.storage()
        )));
    }
    options.validate()?;
    a.allocate()?;

    let mut run = Aasen::new(comm, a)?;
    for k in 0..a.mt() {
        run.step(a, k)?;
    }

    let mut band = BandMatrix::from_block_tridiagonal(a.n(), a.nb(), &run.diag, &run.sub)?;
    if let Err(breakdown) = band.factor() {
        let index = breakdown.column + 1;
        let panel = breakdown.column / a.nb();
        a.mark_failed(panel);
        debug!(panel, index, "band factor of T is singular");
        return Err(Error::Singular { panel, index });
    }
    a.mark_factored(FactorKind::Indefinite);
    debug!(interchanges = run.pivots.len(), "Aasen done");
    Ok(IndefiniteFactor {
        pivots: run.pivots,
        band,
        h: run.h,
    })
}
