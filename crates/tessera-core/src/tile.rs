//! Tiles: the unit of storage, ownership and communication
//!
//! A tile is a dense column-major block with a leading stride. Its extent is
//! fixed at construction; only its values and residency change. Every host
//! write bumps a version counter so device-side caches can tell when their
//! copy is stale.

use crate::numeric::{max_nan, Scalar};
use crate::{Error, Result};
use num_traits::Zero;

/// Residency of a tile's data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    /// No backing storage
    Empty,
    /// Host copy is current and in sync with any device copy
    PackedHost,
    /// A device owns the current values; the host copy is stale
    PackedDevice(usize),
    /// Host copy written since the last device sync
    Modified,
}

/// Dense column-major tile
#[derive(Debug, Clone)]
pub struct Tile<T> {
    rows: usize,
    cols: usize,
    stride: usize,
    data: Vec<T>,
    state: TileState,
    version: u64,
}

impl<T: Scalar> Tile<T> {
    /// Tile with no storage
    pub fn empty(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            stride: rows.max(1),
            data: Vec::new(),
            state: TileState::Empty,
            version: 0,
        }
    }

    /// Zero-filled tile
    pub fn zeros(rows: usize, cols: usize) -> Self {
        let stride = rows.max(1);
        Self {
            rows,
            cols,
            stride,
            data: vec![T::zero(); stride * cols],
            state: TileState::PackedHost,
            version: 0,
        }
    }

    /// Zero-filled tile, reporting allocation failure instead of aborting
    pub fn try_zeros(rows: usize, cols: usize) -> Result<Self> {
        let mut tile = Self::empty(rows, cols);
        tile.materialize()?;
        Ok(tile)
    }

    /// Wrap packed column-major data (`stride == rows`)
    pub fn from_col_major(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::size_mismatch(rows * cols, data.len(), "tile data"));
        }
        Ok(Self {
            rows,
            cols,
            stride: rows.max(1),
            data: if rows == 0 { vec![T::zero(); cols] } else { data },
            state: TileState::PackedHost,
            version: 0,
        })
    }

    /// Tile filled from `f(row, col)`
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut tile = Self::zeros(rows, cols);
        for j in 0..cols {
            for i in 0..rows {
                tile.data[i + j * tile.stride] = f(i, j);
            }
        }
        tile
    }

    pub fn identity(n: usize) -> Self {
        Self::from_fn(n, n, |i, j| if i == j { T::one() } else { T::zero() })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Leading dimension of the column-major storage
    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn state(&self) -> TileState {
        self.state
    }

    /// Counter bumped by every host write
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn is_materialized(&self) -> bool {
        self.state != TileState::Empty
    }

    /// Reserve zeroed storage for an empty tile
    pub fn materialize(&mut self) -> Result<()> {
        if self.is_materialized() {
            return Ok(());
        }
        let len = self.stride * self.cols;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| Error::host_oom(len, std::mem::size_of::<T>()))?;
        data.resize(len, T::zero());
        self.data = data;
        self.state = TileState::PackedHost;
        Ok(())
    }

    /// Drop the storage, keeping the extent
    pub fn release(&mut self) {
        self.data = Vec::new();
        self.state = TileState::Empty;
    }

    /// Record a host write
    #[inline]
    fn touch(&mut self) {
        self.state = TileState::Modified;
        self.version = self.version.wrapping_add(1);
    }

    /// Record that a device now holds the current values
    pub fn mark_on_device(&mut self, device: usize) {
        self.state = TileState::PackedDevice(device);
    }

    /// Replace the values with data copied back from a device
    pub fn load_from_device(&mut self, packed: &[T]) -> Result<()> {
        self.copy_packed(packed)?;
        self.state = TileState::PackedHost;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> T {
        debug_assert!(i < self.rows && j < self.cols, "index ({i}, {j}) outside tile");
        self.data[i + j * self.stride]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: T) {
        debug_assert!(i < self.rows && j < self.cols, "index ({i}, {j}) outside tile");
        self.data[i + j * self.stride] = value;
        self.touch();
    }

    /// Raw storage, `stride * cols` elements
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Mutable raw storage; counts as a host write
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.touch();
        &mut self.data
    }

    /// Column `j`, `rows` elements
    #[inline]
    pub fn col(&self, j: usize) -> &[T] {
        let start = j * self.stride;
        &self.data[start..start + self.rows]
    }

    #[inline]
    pub fn col_mut(&mut self, j: usize) -> &mut [T] {
        self.touch();
        let start = j * self.stride;
        &mut self.data[start..start + self.rows]
    }

    /// Copy of row `i`
    pub fn row(&self, i: usize) -> Vec<T> {
        (0..self.cols).map(|j| self.get(i, j)).collect()
    }

    pub fn set_row(&mut self, i: usize, values: &[T]) {
        debug_assert_eq!(values.len(), self.cols);
        for (j, &v) in values.iter().enumerate() {
            self.data[i + j * self.stride] = v;
        }
        self.touch();
    }

    /// Copy of column `j`
    pub fn column(&self, j: usize) -> Vec<T> {
        self.col(j).to_vec()
    }

    pub fn set_column(&mut self, j: usize, values: &[T]) {
        self.col_mut(j).copy_from_slice(values);
    }

    pub fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for j in 0..self.cols {
            self.data.swap(a + j * self.stride, b + j * self.stride);
        }
        self.touch();
    }

    pub fn swap_cols(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for i in 0..self.rows {
            self.data.swap(i + a * self.stride, i + b * self.stride);
        }
        self.touch();
    }

    /// Packed column-major copy (`stride == rows`)
    pub fn to_col_major(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.rows * self.cols);
        for j in 0..self.cols {
            out.extend_from_slice(self.col(j));
        }
        out
    }

    /// Overwrite from packed column-major data
    pub fn copy_packed(&mut self, packed: &[T]) -> Result<()> {
        if packed.len() != self.rows * self.cols {
            return Err(Error::size_mismatch(
                self.rows * self.cols,
                packed.len(),
                "packed tile",
            ));
        }
        self.materialize()?;
        for j in 0..self.cols {
            let start = j * self.stride;
            self.data[start..start + self.rows]
                .copy_from_slice(&packed[j * self.rows..(j + 1) * self.rows]);
        }
        self.touch();
        Ok(())
    }

    /// Overwrite the values with another tile of the same extent
    pub fn copy_from(&mut self, other: &Tile<T>) -> Result<()> {
        if other.rows != self.rows || other.cols != self.cols {
            return Err(Error::InvalidParameter(format!(
                "Cannot copy a {}x{} tile into a {}x{} tile",
                other.rows, other.cols, self.rows, self.cols
            )));
        }
        self.copy_packed(&other.to_col_major())
    }

    /// `rows x cols` block starting at `(r0, c0)`
    pub fn sub_tile(&self, r0: usize, c0: usize, rows: usize, cols: usize) -> Tile<T> {
        Tile::from_fn(rows, cols, |i, j| self.get(r0 + i, c0 + j))
    }

    /// Write `block` at offset `(r0, c0)`
    pub fn set_sub_tile(&mut self, r0: usize, c0: usize, block: &Tile<T>) {
        for j in 0..block.cols {
            for i in 0..block.rows {
                self.data[r0 + i + (c0 + j) * self.stride] = block.get(i, j);
            }
        }
        self.touch();
    }

    pub fn conj_transpose(&self) -> Tile<T> {
        Tile::from_fn(self.cols, self.rows, |i, j| self.get(j, i).conj())
    }

    /// Unit lower triangle (strict lower part plus ones on the diagonal)
    pub fn unit_lower(&self) -> Tile<T> {
        Tile::from_fn(self.rows, self.cols, |i, j| match i.cmp(&j) {
            std::cmp::Ordering::Greater => self.get(i, j),
            std::cmp::Ordering::Equal => T::one(),
            std::cmp::Ordering::Less => T::zero(),
        })
    }

    /// Upper triangle including the diagonal
    pub fn upper(&self) -> Tile<T> {
        Tile::from_fn(self.rows, self.cols, |i, j| {
            if i <= j {
                self.get(i, j)
            } else {
                T::zero()
            }
        })
    }

    /// Lower triangle including the diagonal
    pub fn lower(&self) -> Tile<T> {
        Tile::from_fn(self.rows, self.cols, |i, j| {
            if i >= j {
                self.get(i, j)
            } else {
                T::zero()
            }
        })
    }

    /// Largest modulus, NaN if any entry is NaN
    pub fn max_abs(&self) -> T::Real {
        let mut best = T::Real::zero();
        for j in 0..self.cols {
            for &x in self.col(j) {
                best = max_nan(best, x.abs_val());
            }
        }
        best
    }

    /// Fill with `value`
    pub fn fill(&mut self, value: T) {
        for x in self.data.iter_mut() {
            *x = value;
        }
        self.touch();
    }

    /// Mirror the stored lower triangle into the upper one (Hermitian)
    pub fn hermitian_from_lower(&mut self) {
        for j in 0..self.cols.min(self.rows) {
            let d = self.get(j, j).real();
            self.data[j + j * self.stride] = T::from_real(d);
            for i in j + 1..self.rows.min(self.cols) {
                let v = self.get(i, j).conj();
                self.data[j + i * self.stride] = v;
            }
        }
        self.touch();
    }

    /// Exact comparison against the identity
    pub fn is_identity(&self) -> bool {
        (0..self.cols).all(|j| {
            (0..self.rows).all(|i| {
                let expected = if i == j { T::one() } else { T::zero() };
                self.get(i, j) == expected
            })
        })
    }
}

impl<T: Scalar> PartialEq for Tile<T> {
    /// Value equality over the logical extent
    fn eq(&self, other: &Self) -> bool {
        self.rows == other.rows
            && self.cols == other.cols
            && (0..self.cols).all(|j| self.col(j) == other.col(j))
    }
}
