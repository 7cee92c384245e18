//! Distributed matrix norms
//!
//! Each rank reduces its own tiles (on the host, or batched on its devices
//! when `devices` is set), then the partial results are combined across all
//! ranks with a fixed reduction tree, so every rank returns the same value.

use crate::engine::check_comm;
use num_traits::Zero;
use std::collections::BTreeMap;
use tessera_comm::{Channel, Collectives, Communicator, RankGroup, Tag};
use tessera_core::{max_nan, Error, Norm, Options, RealScalar, Result, Scalar, Tile, TiledMatrix, Uplo};
use tessera_device::{output_len, reduce_norm, tile_norm, DeviceSet, DeviceTile, Queue, SumSq};
use tracing::{instrument, trace};

/// Per-tile norm entries, in the order of `tiles`
fn tile_values<T: Scalar>(
    kind: Norm,
    uplo: Uplo,
    tiles: &[((usize, usize), &Tile<T>)],
    a: &TiledMatrix<T>,
    devices: Option<&DeviceSet>,
) -> Result<Vec<Vec<T::Real>>> {
    let Some(devices) = devices else {
        return tiles.iter().map(|(_, tile)| tile_norm(kind, uplo, tile)).collect();
    };

    // uniform batches per device and tile shape
    let mut batches: BTreeMap<(usize, usize, usize), Vec<usize>> = BTreeMap::new();
    for (at, ((i, j), tile)) in tiles.iter().enumerate() {
        let device = a.layout().device_of(*i, *j, devices.len()).unwrap_or(0);
        batches.entry((device, tile.rows(), tile.cols())).or_default().push(at);
    }
    let mut out = vec![Vec::new(); tiles.len()];
    for ((id, m, n), members) in batches {
        let device = devices
            .get(id)
            .ok_or_else(|| Error::Device(format!("Device {id} is not attached")))?;
        let queue = Queue::new(device)?;
        let buffers = members
            .iter()
            .map(|&at| DeviceTile::upload(device, tiles[at].1).map(|t| t.buffer))
            .collect::<Result<Vec<_>>>()?;
        let width = output_len(kind, uplo, m, n).max(1);
        let values = device.alloc::<T::Real>(members.len() * width)?;
        reduce_norm(&queue, kind, uplo, m, n, &buffers, m.max(1), &values, width, members.len())?;
        queue.sync()?;
        let host = values.to_vec()?;
        for (slot, &at) in members.iter().enumerate() {
            out[at] = host[slot * width..slot * width + output_len(kind, uplo, m, n)].to_vec();
        }
        trace!(device = id, tiles = members.len(), "device norm batch");
    }
    Ok(out)
}

fn attached_devices(options: &Options) -> Result<Option<DeviceSet>> {
    match options.devices() {
        0 => Ok(None),
        n => DeviceSet::new(n, options.device_memory()).map(Some),
    }
}

fn combine_max<R: RealScalar>(acc: &mut [R], part: &[R]) {
    for (x, &y) in acc.iter_mut().zip(part) {
        *x = max_nan(*x, y);
    }
}

fn combine_sum<R: RealScalar>(acc: &mut [R], part: &[R]) {
    for (x, &y) in acc.iter_mut().zip(part) {
        *x = *x + y;
    }
}

fn combine_sumsq<R: RealScalar>(acc: &mut [R], part: &[R]) {
    let mut total = SumSq::from_pair([acc[0], acc[1]]);
    total.merge(SumSq::from_pair([part[0], part[1]]));
    acc.copy_from_slice(&total.to_pair());
}

fn largest<R: RealScalar>(values: &[R]) -> R {
    values.iter().fold(R::zero(), |best, &v| max_nan(best, v))
}

/// Norm of a general matrix.
///
/// Collective over every rank; all of them return the same value. Only
/// `General` storage is accepted; see [`hermitian_norm`] for the others.
#[instrument(skip_all, fields(norm = ?kind, m = a.m(), n = a.n(), rank = comm.rank()))]
pub fn norm<T: Scalar, C: Communicator>(comm: &C, kind: Norm, a: &TiledMatrix<T>, options: &Options) -> Result<T::Real> {
    check_comm(comm, a)?;
    if a.storage() != Uplo::General {
        return Err(Error::InvalidConfiguration(format!(
            "norm needs General storage, matrix stores {:?}; use hermitian_norm",
            a.storage()
        )));
    }
    options.validate()?;
    let devices = attached_devices(options)?;
    // unmaterialized tiles are zero
    let tiles: Vec<_> = a.tiles().filter(|(_, t)| t.is_materialized()).collect();
    let values = tile_values(kind, Uplo::General, &tiles, a, devices.as_ref())?;
    let everyone = RankGroup::all(comm.size());
    let tag = Tag::new(Channel::Norm, 0);
    let zero = T::Real::zero();

    Ok(match kind {
        Norm::Max => {
            let mut best = [values.iter().fold(zero, |b, v| max_nan(b, largest(v)))];
            comm.all_reduce(&mut best, combine_max, &everyone, tag)?;
            best[0]
        }
        Norm::One => {
            let mut sums = vec![zero; a.n()];
            for (((_, j), _), v) in tiles.iter().zip(&values) {
                combine_sum(&mut sums[j * a.nb()..j * a.nb() + v.len()], v);
            }
            comm.all_reduce(&mut sums, combine_sum, &everyone, tag)?;
            largest(&sums)
        }
        Norm::Inf => {
            let mut sums = vec![zero; a.m()];
            for (((i, _), _), v) in tiles.iter().zip(&values) {
                combine_sum(&mut sums[i * a.mb()..i * a.mb() + v.len()], v);
            }
            comm.all_reduce(&mut sums, combine_sum, &everyone, tag)?;
            largest(&sums)
        }
        Norm::Fro => {
            let mut total = SumSq::empty();
            for v in &values {
                total.merge(SumSq::from_pair([v[0], v[1]]));
            }
            let mut pair = total.to_pair();
            comm.all_reduce(&mut pair, combine_sumsq, &everyone, tag)?;
            SumSq::from_pair(pair).value()
        }
    })
}

/// Norm of a Hermitian matrix of which only the `uplo` triangle is read.
///
/// `a` may store that triangle only or both. One and Inf norms coincide.
#[instrument(skip_all, fields(norm = ?kind, uplo = ?uplo, n = a.n(), rank = comm.rank()))]
pub fn hermitian_norm<T: Scalar, C: Communicator>(
    comm: &C,
    kind: Norm,
    uplo: Uplo,
    a: &TiledMatrix<T>,
    options: &Options,
) -> Result<T::Real> {
    check_comm(comm, a)?;
    if uplo == Uplo::General {
        return Err(Error::InvalidParameter("hermitian_norm reads Lower or Upper".to_string()));
    }
    if a.m() != a.n() || a.mb() != a.nb() {
        return Err(Error::InvalidConfiguration(format!(
            "Hermitian norm needs a square matrix with square tiles, got {}x{} in {}x{} tiles",
            a.m(),
            a.n(),
            a.mb(),
            a.nb()
        )));
    }
    if a.storage() != Uplo::General && a.storage() != uplo {
        return Err(Error::InvalidConfiguration(format!(
            "matrix stores {:?}, cannot read {uplo:?}",
            a.storage()
        )));
    }
    options.validate()?;
    let devices = attached_devices(options)?;
    let in_triangle = |i: usize, j: usize| match uplo {
        Uplo::Lower => i >= j,
        _ => i <= j,
    };
    let stored: Vec<_> = a.tiles().filter(|(_, t)| t.is_materialized()).collect();
    let (diagonal, off): (Vec<_>, Vec<_>) = stored
        .into_iter()
        .filter(|((i, j), _)| in_triangle(*i, *j))
        .partition(|((i, j), _)| i == j);
    let everyone = RankGroup::all(comm.size());
    let tag = Tag::new(Channel::Norm, 1);
    let zero = T::Real::zero();
    let nb = a.nb();

    let diag_values = tile_values(kind, uplo, &diagonal, a, devices.as_ref())?;
    Ok(match kind {
        Norm::Max => {
            let off_values = tile_values(Norm::Max, Uplo::General, &off, a, devices.as_ref())?;
            let local = diag_values
                .iter()
                .chain(&off_values)
                .fold(zero, |b, v| max_nan(b, largest(v)));
            let mut best = [local];
            comm.all_reduce(&mut best, combine_max, &everyone, tag)?;
            best[0]
        }
        Norm::One | Norm::Inf => {
            // column sums of the full matrix; an off-diagonal tile also
            // contributes its row sums to the mirrored columns
            let cols = tile_values(Norm::One, Uplo::General, &off, a, devices.as_ref())?;
            let rows = tile_values(Norm::Inf, Uplo::General, &off, a, devices.as_ref())?;
            let mut sums = vec![zero; a.n()];
            for (((i, _), _), v) in diagonal.iter().zip(&diag_values) {
                combine_sum(&mut sums[i * nb..i * nb + v.len()], v);
            }
            for ((((i, j), _), c), r) in off.iter().zip(&cols).zip(&rows) {
                combine_sum(&mut sums[j * nb..j * nb + c.len()], c);
                combine_sum(&mut sums[i * nb..i * nb + r.len()], r);
            }
            comm.all_reduce(&mut sums, combine_sum, &everyone, tag)?;
            largest(&sums)
        }
        Norm::Fro => {
            let off_values = tile_values(Norm::Fro, Uplo::General, &off, a, devices.as_ref())?;
            let mut total = SumSq::empty();
            for v in &diag_values {
                total.merge(SumSq::from_pair([v[0], v[1]]));
            }
            let mut mirrored = SumSq::empty();
            for v in &off_values {
                mirrored.merge(SumSq::from_pair([v[0], v[1]]));
            }
            mirrored.double();
            total.merge(mirrored);
            let mut pair = total.to_pair();
            comm.all_reduce(&mut pair, combine_sumsq, &everyone, tag)?;
            SumSq::from_pair(pair).value()
        }
    })
}
