//! Batched tile updates
//!
//! `batch_gemm` and `batch_trsm` apply the same operation to every tile of
//! a uniform-shape batch. Each batch entry runs the host tile kernel, so a
//! device update produces exactly the values the host would.

use crate::device::{Device, DeviceBuffer};
use crate::queue::Queue;
use rayon::prelude::*;
use tessera_core::{Diag, Error, Op, Result, Scalar, ScalarBackend, Side, Tile, TileKernels, Uplo};
use tracing::instrument;

/// Device-resident tile: `rows x cols` with leading dimension `ld`
#[derive(Debug, Clone)]
pub struct DeviceTile<T> {
    pub rows: usize,
    pub cols: usize,
    pub ld: usize,
    pub buffer: DeviceBuffer<T>,
}

impl<T: Scalar> DeviceTile<T> {
    /// Zeroed tile on `device`
    pub fn alloc(device: &Device, rows: usize, cols: usize) -> Result<Self> {
        let ld = rows.max(1);
        Ok(Self {
            rows,
            cols,
            ld,
            buffer: device.alloc(ld * cols)?,
        })
    }

    /// Copy of a host tile on `device`
    pub fn upload(device: &Device, tile: &Tile<T>) -> Result<Self> {
        let dev = Self::alloc(device, tile.rows(), tile.cols())?;
        if tile.rows() > 0 {
            dev.buffer.copy_from(&tile.to_col_major())?;
        }
        Ok(dev)
    }

    /// Packed column-major host copy
    pub fn download(&self) -> Result<Vec<T>> {
        self.buffer.read(|data| {
            let mut out = Vec::with_capacity(self.rows * self.cols);
            for j in 0..self.cols {
                out.extend_from_slice(&data[j * self.ld..j * self.ld + self.rows]);
            }
            out
        })
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn to_tile(&self) -> Result<Tile<T>> {
        self.buffer
            .read(|data| Tile::from_fn(self.rows, self.cols, |i, j| data[i + j * self.ld]))
    }

    fn store(&self, tile: &Tile<T>) -> Result<()> {
        self.buffer.write(|data| {
            for j in 0..self.cols {
                data[j * self.ld..j * self.ld + self.rows].copy_from_slice(tile.col(j));
            }
        })
    }
}

fn uniform<T: Scalar>(tiles: &[DeviceTile<T>], what: &str) -> Result<Option<(usize, usize)>> {
    let Some(first) = tiles.first() else {
        return Ok(None);
    };
    if let Some(other) = tiles.iter().find(|t| t.shape() != first.shape()) {
        return Err(Error::InvalidParameter(format!(
            "Batch {what} mixes {:?} and {:?} tiles",
            first.shape(),
            other.shape()
        )));
    }
    Ok(Some(first.shape()))
}

fn check_outputs<T: Scalar>(outputs: &[DeviceTile<T>], inputs: &[&[DeviceTile<T>]], device: usize) -> Result<()> {
    for (k, out) in outputs.iter().enumerate() {
        if out.buffer.device_id() != device {
            return Err(Error::InvalidParameter(format!("Output {k} is not on device {device}")));
        }
        let aliased = outputs[k + 1..]
            .iter()
            .chain(inputs.iter().flat_map(|s| s.iter()))
            .any(|other| other.buffer.same_allocation(&out.buffer));
        if aliased {
            return Err(Error::InvalidParameter(format!(
                "Output {k} aliases another tile of the batch"
            )));
        }
    }
    for input in inputs.iter().flat_map(|s| s.iter()) {
        if input.buffer.device_id() != device {
            return Err(Error::InvalidParameter(format!("Input is not on device {device}")));
        }
    }
    Ok(())
}

#[inline]
fn op_shape(op: Op, (r, c): (usize, usize)) -> (usize, usize) {
    if op.is_transposed() {
        (c, r)
    } else {
        (r, c)
    }
}

/// `C[k] = alpha op(A[k]) op(B[k]) + beta C[k]` for every `k`
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(device = queue.device().id(), batch = c.len()))]
pub fn batch_gemm<T: Scalar>(
    queue: &Queue,
    alpha: T,
    op_a: Op,
    a: &[DeviceTile<T>],
    op_b: Op,
    b: &[DeviceTile<T>],
    beta: T,
    c: &[DeviceTile<T>],
) -> Result<()> {
    if a.len() != c.len() || b.len() != c.len() {
        return Err(Error::InvalidParameter(format!(
            "Batch sizes differ: {} A, {} B, {} C",
            a.len(),
            b.len(),
            c.len()
        )));
    }
    let (Some(sa), Some(sb), Some(sc)) = (uniform(a, "A")?, uniform(b, "B")?, uniform(c, "C")?) else {
        return Ok(());
    };
    let (m, k) = op_shape(op_a, sa);
    let (kb, n) = op_shape(op_b, sb);
    if k != kb || (m, n) != sc {
        return Err(Error::InvalidParameter(format!(
            "gemm shapes do not conform: op(A) {m}x{k}, op(B) {kb}x{n}, C {}x{}",
            sc.0, sc.1
        )));
    }
    check_outputs(c, &[a, b], queue.device().id())?;

    let (a, b, c) = (a.to_vec(), b.to_vec(), c.to_vec());
    queue.launch(move || {
        (0..c.len()).into_par_iter().try_for_each(|k| {
            let ta = a[k].to_tile()?;
            let tb = b[k].to_tile()?;
            let mut tc = c[k].to_tile()?;
            ScalarBackend.gemm(alpha, op_a, &ta, op_b, &tb, beta, &mut tc);
            c[k].store(&tc)
        })
    })
}

/// Triangular solve with `A[k]` applied to every `B[k]`
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(device = queue.device().id(), batch = b.len()))]
pub fn batch_trsm<T: Scalar>(
    queue: &Queue,
    side: Side,
    uplo: Uplo,
    op: Op,
    diag: Diag,
    alpha: T,
    a: &[DeviceTile<T>],
    b: &[DeviceTile<T>],
) -> Result<()> {
    if uplo == Uplo::General {
        return Err(Error::InvalidParameter("trsm needs a Lower or Upper operand".to_string()));
    }
    if a.len() != b.len() {
        return Err(Error::size_mismatch(b.len(), a.len(), "trsm batch"));
    }
    let (Some(sa), Some(sb)) = (uniform(a, "A")?, uniform(b, "B")?) else {
        return Ok(());
    };
    let needed = match side {
        Side::Left => sb.0,
        Side::Right => sb.1,
    };
    if sa.0 < needed || sa.1 < needed {
        return Err(Error::InvalidParameter(format!(
            "Triangular tile {}x{} too small for a {}x{} right-hand side",
            sa.0, sa.1, sb.0, sb.1
        )));
    }
    check_outputs(b, &[a], queue.device().id())?;

    let (a, b) = (a.to_vec(), b.to_vec());
    queue.launch(move || {
        (0..b.len()).into_par_iter().try_for_each(|k| {
            let ta = a[k].to_tile()?;
            let mut tb = b[k].to_tile()?;
            ScalarBackend.trsm(side, uplo, op, diag, alpha, &ta, &mut tb);
            b[k].store(&tb)
        })
    })
}
