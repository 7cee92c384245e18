//! Batched per-tile norms
//!
//! Each tile is reduced row by row; the rows are independent and run in
//! parallel on the device's execution units. The per-row partials are then
//! merged in row order, which is the only serial step and keeps the result
//! identical to the host path.
//!
//! Output layout per tile `k`, starting at `values[k * ldv]`:
//!
//! | norm | entries                                   |
//! |------|-------------------------------------------|
//! | Max  | 1: largest modulus (NaN if any is NaN)    |
//! | One  | `n`: sum of moduli of each column         |
//! | Inf  | `m`: row sums (General), `n` (symmetric)  |
//! | Fro  | 2: `scale`, `sumsq`                       |
//!
//! For `Lower`/`Upper` the tile is a Hermitian diagonal block of which only
//! the named triangle is read; the other triangle is its mirror and the
//! imaginary part of the diagonal is ignored.

use crate::device::DeviceBuffer;
use crate::queue::Queue;
use crate::sumsq::SumSq;
use num_traits::Zero;
use rayon::prelude::*;
use tessera_core::{max_nan, Error, Norm, Result, Scalar, Tile, Uplo};
use tracing::{instrument, trace};

/// Borrowed column-major tile
#[derive(Debug, Clone, Copy)]
pub struct TileRef<'a, T> {
    data: &'a [T],
    m: usize,
    n: usize,
    ld: usize,
}

impl<'a, T: Scalar> TileRef<'a, T> {
    pub fn new(data: &'a [T], m: usize, n: usize, ld: usize) -> Result<Self> {
        if ld < m.max(1) {
            return Err(Error::InvalidParameter(format!(
                "Leading dimension {ld} smaller than {m} rows"
            )));
        }
        let needed = if n == 0 { 0 } else { ld * (n - 1) + m };
        if data.len() < needed {
            return Err(Error::size_mismatch(needed, data.len(), "tile buffer"));
        }
        Ok(Self { data, m, n, ld })
    }

    pub fn of(tile: &'a Tile<T>) -> Self {
        Self {
            data: tile.as_slice(),
            m: tile.rows(),
            n: tile.cols(),
            ld: tile.stride(),
        }
    }

    #[inline]
    fn abs(&self, i: usize, j: usize) -> T::Real {
        self.data[i + j * self.ld].abs_val()
    }

    #[inline]
    fn diag(&self, i: usize) -> T::Real {
        self.data[i + i * self.ld].real().abs_val()
    }

    /// Off-diagonal columns of row `i` inside the stored triangle
    #[inline]
    fn stored_row(&self, uplo: Uplo, i: usize) -> std::ops::Range<usize> {
        match uplo {
            Uplo::General => 0..self.n,
            Uplo::Lower => 0..i,
            Uplo::Upper => i + 1..self.n,
        }
    }
}

/// Number of result entries one tile produces
pub fn output_len(norm: Norm, uplo: Uplo, m: usize, n: usize) -> usize {
    match (norm, uplo) {
        (Norm::Max, _) => 1,
        (Norm::One, _) => n,
        (Norm::Inf, Uplo::General) => m,
        (Norm::Inf, _) => n,
        (Norm::Fro, _) => 2,
    }
}

fn row_max<T: Scalar>(a: &TileRef<'_, T>, uplo: Uplo, i: usize) -> T::Real {
    let mut best = T::Real::zero();
    for j in a.stored_row(uplo, i) {
        best = max_nan(best, a.abs(i, j));
    }
    if uplo != Uplo::General {
        best = max_nan(best, a.diag(i));
    }
    best
}

fn row_sumsq<T: Scalar>(a: &TileRef<'_, T>, uplo: Uplo, i: usize) -> SumSq<T::Real> {
    let mut acc = SumSq::new();
    for j in a.stored_row(uplo, i) {
        acc.add(a.abs(i, j));
    }
    if uplo != Uplo::General {
        // every stored off-diagonal entry also stands for its mirror
        acc.double();
        acc.add(a.diag(i));
    }
    acc
}

/// Sum of moduli of logical column `idx` of a Hermitian tile
fn hermitian_line_sum<T: Scalar>(a: &TileRef<'_, T>, uplo: Uplo, idx: usize) -> T::Real {
    let mut sum = T::Real::zero();
    match uplo {
        Uplo::Lower => {
            for j in 0..idx {
                sum = sum + a.abs(idx, j);
            }
            sum = sum + a.diag(idx);
            for i in idx + 1..a.n {
                sum = sum + a.abs(i, idx);
            }
        }
        _ => {
            for j in idx + 1..a.n {
                sum = sum + a.abs(idx, j);
            }
            sum = sum + a.diag(idx);
            for i in 0..idx {
                sum = sum + a.abs(i, idx);
            }
        }
    }
    sum
}

fn map_lines<R, F>(count: usize, parallel: bool, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize) -> R + Sync + Send,
{
    if parallel {
        (0..count).into_par_iter().map(f).collect()
    } else {
        (0..count).map(f).collect()
    }
}

fn reduce_tile<T: Scalar>(norm: Norm, uplo: Uplo, a: &TileRef<'_, T>, out: &mut [T::Real], parallel: bool) {
    let (m, n) = (a.m, a.n);
    let zero = T::Real::zero();
    if m == 0 || n == 0 {
        out.iter_mut().for_each(|v| *v = zero);
        return;
    }
    match (norm, uplo) {
        (Norm::Max, _) => {
            let rows = map_lines(m, parallel, |i| row_max(a, uplo, i));
            out[0] = rows.into_iter().fold(zero, max_nan);
        }
        (Norm::Fro, _) => {
            let rows = map_lines(m, parallel, |i| row_sumsq(a, uplo, i));
            let mut acc = SumSq::new();
            for row in rows {
                acc.merge(row);
            }
            out[..2].copy_from_slice(&acc.to_pair());
        }
        (Norm::One, Uplo::General) => {
            let cols = map_lines(n, parallel, |j| (0..m).fold(zero, |s, i| s + a.abs(i, j)));
            out[..n].copy_from_slice(&cols);
        }
        (Norm::Inf, Uplo::General) => {
            let rows = map_lines(m, parallel, |i| (0..n).fold(zero, |s, j| s + a.abs(i, j)));
            out[..m].copy_from_slice(&rows);
        }
        (Norm::One | Norm::Inf, _) => {
            let lines = map_lines(n, parallel, |idx| hermitian_line_sum(a, uplo, idx));
            out[..n].copy_from_slice(&lines);
        }
    }
}

/// Norm entries of one host tile, laid out as [`output_len`] describes
pub fn tile_norm<T: Scalar>(norm: Norm, uplo: Uplo, tile: &Tile<T>) -> Result<Vec<T::Real>> {
    check_shape(uplo, tile.rows(), tile.cols())?;
    let a = TileRef::of(tile);
    let mut out = vec![T::Real::zero(); output_len(norm, uplo, a.m, a.n)];
    reduce_tile(norm, uplo, &a, &mut out, false);
    Ok(out)
}

fn check_shape(uplo: Uplo, m: usize, n: usize) -> Result<()> {
    if uplo != Uplo::General && m != n {
        return Err(Error::InvalidParameter(format!(
            "{uplo:?} tile norm needs a square tile, got {m}x{n}"
        )));
    }
    Ok(())
}

/// Batched norm of `batch_count` device tiles of uniform shape `m x n`.
///
/// Tile `k` is `tiles[k]` with leading dimension `lda`; its result goes to
/// `values[k * ldv..]`. Arguments are checked before anything is launched.
/// `batch_count == 0` is a no-op.
#[allow(clippy::too_many_arguments)]
#[instrument(skip(queue, tiles, values), fields(device = queue.device().id()))]
pub fn reduce_norm<T: Scalar>(
    queue: &Queue,
    norm: Norm,
    uplo: Uplo,
    m: usize,
    n: usize,
    tiles: &[DeviceBuffer<T>],
    lda: usize,
    values: &DeviceBuffer<T::Real>,
    ldv: usize,
    batch_count: usize,
) -> Result<()> {
    if batch_count == 0 {
        return Ok(());
    }
    check_shape(uplo, m, n)?;
    if tiles.len() < batch_count {
        return Err(Error::size_mismatch(batch_count, tiles.len(), "tile array"));
    }
    if lda < m.max(1) {
        return Err(Error::InvalidParameter(format!("lda {lda} < {m}")));
    }
    let width = output_len(norm, uplo, m, n);
    if ldv < width.max(1) {
        return Err(Error::InvalidParameter(format!(
            "ldv {ldv} too small for {norm:?} results of width {width}"
        )));
    }
    if values.len() < batch_count * ldv {
        return Err(Error::size_mismatch(batch_count * ldv, values.len(), "norm values"));
    }
    let device = queue.device().id();
    let needed = if n == 0 { 0 } else { lda * (n - 1) + m };
    for (k, tile) in tiles[..batch_count].iter().enumerate() {
        if tile.device_id() != device || values.device_id() != device {
            return Err(Error::InvalidParameter(format!(
                "Tile {k} or the output is not resident on device {device}"
            )));
        }
        if tile.len() < needed {
            return Err(Error::size_mismatch(needed, tile.len(), "device tile"));
        }
    }

    let tiles: Vec<DeviceBuffer<T>> = tiles[..batch_count].to_vec();
    let values = values.clone();
    queue.launch(move || {
        let results = tiles
            .par_iter()
            .map(|buffer| {
                buffer.read(|data| {
                    let mut out = vec![T::Real::zero(); width];
                    let a = TileRef { data, m, n, ld: lda };
                    reduce_tile(norm, uplo, &a, &mut out, true);
                    out
                })
            })
            .collect::<Result<Vec<_>>>()?;
        values.write(|v| {
            for (k, out) in results.iter().enumerate() {
                v[k * ldv..k * ldv + width].copy_from_slice(out);
            }
        })?;
        trace!(batch = results.len(), "norm kernel done");
        Ok(())
    })
}
