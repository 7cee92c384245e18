//! Tiled matrices distributed block-cyclically over a process grid
//!
//! A [`TiledMatrix`] is a logical grid of tiles. Tile `(i, j)` lives on
//! exactly one rank, given by the pure function [`ProcessGrid::owner`], so
//! every rank can compute the full ownership map without communication.
//! Each rank stores only its own tiles.
//!
//! # Layout
//!
//! ```text
//! global m x n, tiles mb x nb, grid P x Q (column-major ranks)
//!
//!            j=0    j=1    j=2
//!   i=0    [ r0 ] [ r2 ] [ r0 ]
//!   i=1    [ r1 ] [ r3 ] [ r1 ]      owner(i, j) = (i mod P) + (j mod Q) * P
//!   i=2    [ r0 ] [ r2 ] [ r0 ]
//! ```
//!
//! Edge tiles are smaller when `m` or `n` is not a multiple of the tile size.

use crate::tile::Tile;
use crate::types::{FactorKind, Uplo};
use crate::{Error, Result, Scalar};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// Linear rank id
pub type Rank = usize;

/// How grid coordinates map to linear rank ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum GridOrder {
    /// `rank = prow + pcol * P`
    #[default]
    ColumnMajor,
    /// `rank = prow * Q + pcol`
    RowMajor,
}

/// `P x Q` process grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessGrid {
    p: usize,
    q: usize,
    order: GridOrder,
}

impl ProcessGrid {
    pub fn new(p: usize, q: usize) -> Result<Self> {
        if p == 0 || q == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "Process grid {p}x{q} must have positive dimensions"
            )));
        }
        Ok(Self {
            p,
            q,
            order: GridOrder::ColumnMajor,
        })
    }

    /// Most square grid with `P <= Q` and `P * Q == size`
    pub fn square_for(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidConfiguration(
                "Cannot build a grid for zero ranks".to_string(),
            ));
        }
        let mut p = (size as f64).sqrt() as usize;
        while p > 1 && size % p != 0 {
            p -= 1;
        }
        Self::new(p.max(1), size / p.max(1))
    }

    pub fn with_order(mut self, order: GridOrder) -> Self {
        self.order = order;
        self
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.p
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.q
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.p * self.q
    }

    #[inline]
    pub fn order(&self) -> GridOrder {
        self.order
    }

    #[inline]
    pub fn rank_of(&self, prow: usize, pcol: usize) -> Rank {
        match self.order {
            GridOrder::ColumnMajor => prow + pcol * self.p,
            GridOrder::RowMajor => prow * self.q + pcol,
        }
    }

    #[inline]
    pub fn coords_of(&self, rank: Rank) -> (usize, usize) {
        match self.order {
            GridOrder::ColumnMajor => (rank % self.p, rank / self.p),
            GridOrder::RowMajor => (rank / self.q, rank % self.q),
        }
    }

    /// Owner of tile `(i, j)`
    #[inline]
    pub fn owner(&self, i: usize, j: usize) -> Rank {
        self.rank_of(i % self.p, j % self.q)
    }
}

/// This process's place among the participating ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankContext {
    pub rank: Rank,
    pub size: usize,
}

impl RankContext {
    pub fn new(rank: Rank, size: usize) -> Result<Self> {
        if rank >= size {
            return Err(Error::InvalidConfiguration(format!(
                "Rank {rank} outside a group of {size}"
            )));
        }
        Ok(Self { rank, size })
    }

    /// Single-process context
    pub fn single() -> Self {
        Self { rank: 0, size: 1 }
    }
}

/// Global shape, tiling and distribution of a matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixLayout {
    m: usize,
    n: usize,
    mb: usize,
    nb: usize,
    grid: ProcessGrid,
}

impl MatrixLayout {
    pub fn new(m: usize, n: usize, mb: usize, nb: usize, grid: ProcessGrid) -> Result<Self> {
        if mb == 0 || nb == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "Tile dimensions {mb}x{nb} must be positive"
            )));
        }
        Ok(Self { m, n, mb, nb, grid })
    }

    #[inline]
    pub fn m(&self) -> usize {
        self.m
    }

    #[inline]
    pub fn n(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn mb(&self) -> usize {
        self.mb
    }

    #[inline]
    pub fn nb(&self) -> usize {
        self.nb
    }

    #[inline]
    pub fn grid(&self) -> ProcessGrid {
        self.grid
    }

    /// Number of tile rows
    #[inline]
    pub fn mt(&self) -> usize {
        self.m.div_ceil(self.mb)
    }

    /// Number of tile columns
    #[inline]
    pub fn nt(&self) -> usize {
        self.n.div_ceil(self.nb)
    }

    /// Rows in tile row `i`
    #[inline]
    pub fn tile_mb(&self, i: usize) -> usize {
        self.mb.min(self.m - i * self.mb)
    }

    /// Columns in tile column `j`
    #[inline]
    pub fn tile_nb(&self, j: usize) -> usize {
        self.nb.min(self.n - j * self.nb)
    }

    #[inline]
    pub fn owner(&self, i: usize, j: usize) -> Rank {
        self.grid.owner(i, j)
    }

    /// Tile row and local offset of global row `r`
    #[inline]
    pub fn tile_of_row(&self, r: usize) -> (usize, usize) {
        (r / self.mb, r % self.mb)
    }

    /// Tile column and local offset of global column `c`
    #[inline]
    pub fn tile_of_col(&self, c: usize) -> (usize, usize) {
        (c / self.nb, c % self.nb)
    }

    /// Device of tile `(i, j)` among `devices` accelerators on its owner
    #[inline]
    pub fn device_of(&self, _i: usize, j: usize, devices: usize) -> Option<usize> {
        if devices == 0 {
            None
        } else {
            Some((j / self.grid.cols()) % devices)
        }
    }

    /// Same row tiling and grid, different column count
    pub fn with_cols(&self, n: usize) -> Self {
        Self { n, ..*self }
    }

    /// Whether `other`'s tile rows line up with this layout's tile columns
    pub fn rows_match_cols_of(&self, other: &MatrixLayout) -> bool {
        self.m == other.n && self.mb == other.nb && self.grid == other.grid
    }
}

/// When local tiles get storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryPolicy {
    /// All local tiles allocated at construction
    #[default]
    Eager,
    /// Tiles allocated on first write or on [`TiledMatrix::allocate`]
    Lazy,
}

/// Result of the last factorization applied in place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixStatus {
    Ready,
    Factored(FactorKind),
    Failed { panel: usize },
}

/// Distributed tiled matrix; stores only this rank's tiles
#[derive(Debug, Clone)]
pub struct TiledMatrix<T> {
    layout: MatrixLayout,
    storage: Uplo,
    ctx: RankContext,
    policy: MemoryPolicy,
    status: MatrixStatus,
    tiles: BTreeMap<(usize, usize), Tile<T>>,
}

impl<T: Scalar> TiledMatrix<T> {
    /// General eager matrix of `m x n` with `mb x nb` tiles over `grid`
    pub fn new(
        m: usize,
        n: usize,
        mb: usize,
        nb: usize,
        grid: ProcessGrid,
        ctx: RankContext,
    ) -> Result<Self> {
        Self::with_layout(MatrixLayout::new(m, n, mb, nb, grid)?, Uplo::General, ctx, MemoryPolicy::Eager)
    }

    pub fn builder(m: usize, n: usize) -> TiledMatrixBuilder<T> {
        TiledMatrixBuilder::new(m, n)
    }

    pub fn with_layout(
        layout: MatrixLayout,
        storage: Uplo,
        ctx: RankContext,
        policy: MemoryPolicy,
    ) -> Result<Self> {
        if layout.grid().size() != ctx.size {
            return Err(Error::InvalidConfiguration(format!(
                "Process grid {}x{} does not partition {} ranks",
                layout.grid().rows(),
                layout.grid().cols(),
                ctx.size
            )));
        }
        if ctx.rank >= ctx.size {
            return Err(Error::InvalidConfiguration(format!(
                "Rank {} outside a group of {}",
                ctx.rank, ctx.size
            )));
        }

        let mut tiles = BTreeMap::new();
        for j in 0..layout.nt() {
            for i in 0..layout.mt() {
                if stores(storage, i, j) && layout.owner(i, j) == ctx.rank {
                    tiles.insert((i, j), Tile::empty(layout.tile_mb(i), layout.tile_nb(j)));
                }
            }
        }

        let mut matrix = Self {
            layout,
            storage,
            ctx,
            policy,
            status: MatrixStatus::Ready,
            tiles,
        };
        if policy == MemoryPolicy::Eager {
            matrix.allocate()?;
        }
        debug!(
            "rank {}: {}x{} matrix in {}x{} tiles, {} local",
            ctx.rank,
            layout.m(),
            layout.n(),
            layout.mb(),
            layout.nb(),
            matrix.tiles.len()
        );
        Ok(matrix)
    }

    /// Zero matrix with the same layout, storage and rank
    pub fn zeros_like(&self) -> Result<Self> {
        Self::with_layout(self.layout, self.storage, self.ctx, MemoryPolicy::Eager)
    }

    /// Zero matrix with the same row distribution and `n` columns
    pub fn zeros_with_cols(&self, n: usize) -> Result<Self> {
        Self::with_layout(
            self.layout.with_cols(n),
            Uplo::General,
            self.ctx,
            MemoryPolicy::Eager,
        )
    }

    #[inline]
    pub fn layout(&self) -> &MatrixLayout {
        &self.layout
    }

    #[inline]
    pub fn m(&self) -> usize {
        self.layout.m()
    }

    #[inline]
    pub fn n(&self) -> usize {
        self.layout.n()
    }

    #[inline]
    pub fn mb(&self) -> usize {
        self.layout.mb()
    }

    #[inline]
    pub fn nb(&self) -> usize {
        self.layout.nb()
    }

    #[inline]
    pub fn mt(&self) -> usize {
        self.layout.mt()
    }

    #[inline]
    pub fn nt(&self) -> usize {
        self.layout.nt()
    }

    #[inline]
    pub fn tile_mb(&self, i: usize) -> usize {
        self.layout.tile_mb(i)
    }

    #[inline]
    pub fn tile_nb(&self, j: usize) -> usize {
        self.layout.tile_nb(j)
    }

    #[inline]
    pub fn storage(&self) -> Uplo {
        self.storage
    }

    #[inline]
    pub fn rank(&self) -> Rank {
        self.ctx.rank
    }

    #[inline]
    pub fn context(&self) -> RankContext {
        self.ctx
    }

    #[inline]
    pub fn policy(&self) -> MemoryPolicy {
        self.policy
    }

    #[inline]
    pub fn status(&self) -> MatrixStatus {
        self.status
    }

    pub fn mark_factored(&mut self, kind: FactorKind) {
        self.status = MatrixStatus::Factored(kind);
    }

    /// Contents are an ordinary matrix again (after an in-place inverse)
    pub fn mark_ready(&mut self) {
        self.status = MatrixStatus::Ready;
    }

    pub fn mark_failed(&mut self, panel: usize) {
        self.status = MatrixStatus::Failed { panel };
    }

    /// Require a completed factorization of `kind`
    pub fn expect_factored(&self, kind: FactorKind) -> Result<()> {
        match self.status {
            MatrixStatus::Factored(k) if k == kind => Ok(()),
            other => Err(Error::InvalidState(format!(
                "Expected a {kind:?} factorization, matrix is {other:?}"
            ))),
        }
    }

    /// Owner of tile `(i, j)`; pure function of the layout
    #[inline]
    pub fn owner(&self, i: usize, j: usize) -> Rank {
        self.layout.owner(i, j)
    }

    /// Whether `(i, j)` is in range and part of the stored triangle
    #[inline]
    pub fn has_tile(&self, i: usize, j: usize) -> bool {
        i < self.mt() && j < self.nt() && stores(self.storage, i, j)
    }

    #[inline]
    pub fn is_local(&self, i: usize, j: usize) -> bool {
        self.has_tile(i, j) && self.owner(i, j) == self.ctx.rank
    }

    fn check_local(&self, i: usize, j: usize) -> Result<()> {
        if !self.has_tile(i, j) {
            return Err(Error::InvalidParameter(format!(
                "Tile ({i}, {j}) outside a {}x{} {:?} tile grid",
                self.mt(),
                self.nt(),
                self.storage
            )));
        }
        let owner = self.owner(i, j);
        if owner != self.ctx.rank {
            return Err(Error::NotLocal { i, j, owner });
        }
        Ok(())
    }

    /// Local tile `(i, j)`
    pub fn tile_at(&self, i: usize, j: usize) -> Result<&Tile<T>> {
        self.check_local(i, j)?;
        match self.tiles.get(&(i, j)) {
            Some(tile) if tile.is_materialized() => Ok(tile),
            _ => Err(Error::NotMaterialized { i, j }),
        }
    }

    /// Mutable local tile `(i, j)`, allocating it under the lazy policy
    pub fn tile_at_mut(&mut self, i: usize, j: usize) -> Result<&mut Tile<T>> {
        self.check_local(i, j)?;
        let (mb, nb) = (self.tile_mb(i), self.tile_nb(j));
        let tile = self
            .tiles
            .entry((i, j))
            .or_insert_with(|| Tile::empty(mb, nb));
        tile.materialize()?;
        Ok(tile)
    }

    /// Coordinates of local tiles in column-major tile order
    pub fn local_coords(&self) -> Vec<(usize, usize)> {
        let mut coords: Vec<_> = self.tiles.keys().copied().collect();
        coords.sort_by_key(|&(i, j)| (j, i));
        coords
    }

    /// Local tiles with their coordinates, for disjoint parallel mutation
    pub fn tiles_mut(&mut self) -> impl Iterator<Item = ((usize, usize), &mut Tile<T>)> {
        self.tiles.iter_mut().map(|(&ij, tile)| (ij, tile))
    }

    pub fn tiles(&self) -> impl Iterator<Item = ((usize, usize), &Tile<T>)> {
        self.tiles.iter().map(|(&ij, tile)| (ij, tile))
    }

    /// Reserve storage for every local tile.
    ///
    /// On failure all storage is released again: a partially allocated
    /// matrix is never handed back.
    pub fn allocate(&mut self) -> Result<()> {
        for tile in self.tiles.values_mut() {
            if let Err(e) = tile.materialize() {
                for t in self.tiles.values_mut() {
                    t.release();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Free the storage of every local tile
    pub fn release(&mut self) {
        for tile in self.tiles.values_mut() {
            tile.release();
        }
    }

    /// Bytes held by materialized local tiles
    pub fn bytes_allocated(&self) -> usize {
        self.tiles
            .values()
            .map(|t| t.as_slice().len() * std::mem::size_of::<T>())
            .sum()
    }

    /// Set every local entry from a global generator `f(row, col)`
    pub fn fill_with(&mut self, f: impl Fn(usize, usize) -> T) -> Result<()> {
        let (mb, nb) = (self.mb(), self.nb());
        for (&(i, j), tile) in self.tiles.iter_mut() {
            tile.materialize()?;
            let (rows, cols, stride) = (tile.rows(), tile.cols(), tile.stride());
            let data = tile.as_mut_slice();
            for c in 0..cols {
                for r in 0..rows {
                    data[r + c * stride] = f(i * mb + r, j * nb + c);
                }
            }
        }
        Ok(())
    }

    /// Fill local tiles from a global column-major array with leading dimension `m`
    pub fn fill_from_col_major(&mut self, data: &[T]) -> Result<()> {
        let m = self.m();
        if data.len() != m * self.n() {
            return Err(Error::size_mismatch(m * self.n(), data.len(), "global matrix"));
        }
        self.fill_with(|r, c| data[r + c * m])
    }

    /// Entry at global `(row, col)`, if its tile is local
    pub fn local_get(&self, row: usize, col: usize) -> Result<T> {
        let (i, r) = self.layout.tile_of_row(row);
        let (j, c) = self.layout.tile_of_col(col);
        Ok(self.tile_at(i, j)?.get(r, c))
    }

    /// Overwrite local tile `(i, j)` with `tile`
    pub fn store_tile(&mut self, i: usize, j: usize, tile: &Tile<T>) -> Result<()> {
        self.tile_at_mut(i, j)?.copy_from(tile)
    }
}

/// Whether `storage` keeps tile `(i, j)`
#[inline]
pub fn stores(storage: Uplo, i: usize, j: usize) -> bool {
    match storage {
        Uplo::General => true,
        Uplo::Lower => i >= j,
        Uplo::Upper => i <= j,
    }
}

/// Builder for [`TiledMatrix`]
#[derive(Debug, Clone)]
pub struct TiledMatrixBuilder<T> {
    m: usize,
    n: usize,
    mb: usize,
    nb: usize,
    grid: Option<ProcessGrid>,
    storage: Uplo,
    policy: MemoryPolicy,
    scalar: PhantomData<fn() -> T>,
}

impl<T: Scalar> TiledMatrixBuilder<T> {
    pub fn new(m: usize, n: usize) -> Self {
        Self {
            m,
            n,
            mb: 64,
            nb: 64,
            grid: None,
            storage: Uplo::General,
            policy: MemoryPolicy::Eager,
            scalar: PhantomData,
        }
    }

    pub fn tile_size(mut self, mb: usize, nb: usize) -> Self {
        self.mb = mb;
        self.nb = nb;
        self
    }

    pub fn grid(mut self, grid: ProcessGrid) -> Self {
        self.grid = Some(grid);
        self
    }

    pub fn storage(mut self, storage: Uplo) -> Self {
        self.storage = storage;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.policy = MemoryPolicy::Lazy;
        self
    }

    /// Build for `ctx`; without an explicit grid the most square one is used
    pub fn build(self, ctx: RankContext) -> Result<TiledMatrix<T>> {
        let grid = match self.grid {
            Some(grid) => grid,
            None => ProcessGrid::square_for(ctx.size)?,
        };
        let layout = MatrixLayout::new(self.m, self.n, self.mb, self.nb, grid)?;
        TiledMatrix::with_layout(layout, self.storage, ctx, self.policy)
    }
}
