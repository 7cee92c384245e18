//! Offloading trailing updates to a rank's devices
//!
//! A trailing update is a list of [`UpdateTask`]s, each a tile product
//! accumulated into one local tile. [`TileOffload::submit`] stages the work
//! on the device that owns each target column, batches tasks of equal shape
//! into single launches, and returns a [`PendingUpdate`]. The caller must
//! hand it back to [`TileOffload::complete`] before it reads or writes any
//! of the columns the update touches.
//!
//! Read-only operands (panel tiles shared through `Arc`) are uploaded once
//! per device and cached for as long as the engine still holds the panel.

use crate::batched::{batch_gemm, DeviceTile};
use crate::device::DeviceSet;
use crate::queue::Queue;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tessera_core::{Error, Op, Result, Scalar, Tile, TileKernels, TiledMatrix};
use tracing::{debug, instrument, trace};

/// `C(target) = alpha op(A) op(B) + beta C(target)`
#[derive(Debug, Clone)]
pub struct UpdateTask<T> {
    pub target: (usize, usize),
    pub alpha: T,
    pub a: Arc<Tile<T>>,
    pub op_a: Op,
    pub b: Arc<Tile<T>>,
    pub op_b: Op,
    pub beta: T,
}

impl<T: Scalar> UpdateTask<T> {
    /// Run the task on the host
    pub fn apply<K: TileKernels<T>>(&self, kernels: &K, c: &mut Tile<T>) {
        kernels.gemm(self.alpha, self.op_a, &self.a, self.op_b, &self.b, self.beta, c);
    }

    /// Column of the target tile
    #[inline]
    pub fn column(&self) -> usize {
        self.target.1
    }
}

/// Device work that has been launched but not copied back
#[must_use = "a pending update must be completed before its columns are used"]
#[derive(Debug)]
pub struct PendingUpdate<T> {
    columns: BTreeSet<usize>,
    outputs: Vec<((usize, usize), DeviceTile<T>)>,
}

impl<T> PendingUpdate<T> {
    /// Nothing outstanding
    pub fn none() -> Self {
        Self {
            columns: BTreeSet::new(),
            outputs: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Whether tile column `j` is being updated
    pub fn touches(&self, j: usize) -> bool {
        self.columns.contains(&j)
    }

    pub fn columns(&self) -> impl Iterator<Item = usize> + '_ {
        self.columns.iter().copied()
    }
}

/// Counters for tests and logs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffloadStats {
    pub uploads: usize,
    pub cache_hits: usize,
    pub launches: usize,
}

/// One read-only operand and its copies, keyed by device
struct CachedOperand<T> {
    source: Arc<Tile<T>>,
    version: u64,
    copies: HashMap<usize, DeviceTile<T>>,
}

/// Per-rank device staging for trailing updates
pub struct TileOffload<T: Scalar> {
    devices: DeviceSet,
    queues: Vec<Queue>,
    // keyed by the operand's address; the entry's `Arc` keeps it stable
    cache: HashMap<usize, CachedOperand<T>>,
    stats: OffloadStats,
}

impl<T: Scalar> TileOffload<T> {
    /// `count` devices of `memory_bytes` each, one queue per device
    pub fn new(count: usize, memory_bytes: usize) -> Result<Self> {
        let devices = DeviceSet::new(count, memory_bytes)?;
        let queues = devices.iter().map(Queue::new).collect::<Result<Vec<_>>>()?;
        Ok(Self {
            devices,
            queues,
            cache: HashMap::new(),
            stats: OffloadStats::default(),
        })
    }

    #[inline]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    pub fn stats(&self) -> OffloadStats {
        self.stats
    }

    fn operand(&mut self, device: usize, source: &Arc<Tile<T>>) -> Result<DeviceTile<T>> {
        let key = Arc::as_ptr(source) as usize;
        let entry = self.cache.entry(key).or_insert_with(|| CachedOperand {
            source: Arc::clone(source),
            version: source.version(),
            copies: HashMap::new(),
        });
        if entry.version != source.version() {
            entry.version = source.version();
            entry.copies.clear();
        }
        if let Some(tile) = entry.copies.get(&device) {
            self.stats.cache_hits += 1;
            return Ok(tile.clone());
        }
        let dev = self
            .devices
            .get(device)
            .ok_or_else(|| Error::Device(format!("No device {device} on this rank")))?;
        let tile = DeviceTile::upload(dev, source)?;
        self.stats.uploads += 1;
        entry.copies.insert(device, tile.clone());
        Ok(tile)
    }

    /// Drop cached operands nobody else holds any more
    pub fn prune(&mut self) {
        let before = self.cache.len();
        self.cache.retain(|_, c| Arc::strong_count(&c.source) > 1);
        if self.cache.len() != before {
            trace!(evicted = before - self.cache.len(), "operand cache pruned");
        }
    }

    /// Stage and launch `tasks` against the local tiles of `matrix`.
    ///
    /// Tasks on the same target run in the order given.
    #[instrument(skip_all, fields(tasks = tasks.len(), devices = self.devices.len()))]
    pub fn submit(&mut self, matrix: &mut TiledMatrix<T>, tasks: Vec<UpdateTask<T>>) -> Result<PendingUpdate<T>> {
        if tasks.is_empty() {
            return Ok(PendingUpdate::none());
        }
        if self.devices.is_empty() {
            return Err(Error::InvalidState("no devices to offload to".to_string()));
        }
        let count = self.devices.len();
        let layout = *matrix.layout();

        let mut outputs: Vec<((usize, usize), DeviceTile<T>)> = Vec::new();
        let mut slot_of: HashMap<(usize, usize), usize> = HashMap::new();
        // (device, wave, shape key) -> batch
        let mut batches: Vec<Batch<T>> = Vec::new();
        let mut waves: HashMap<(usize, usize), usize> = HashMap::new();

        for task in tasks {
            let (i, j) = task.target;
            let device = layout.device_of(i, j, count).unwrap_or(0);
            let slot = match slot_of.get(&task.target) {
                Some(&slot) => slot,
                None => {
                    let dev = self
                        .devices
                        .get(device)
                        .ok_or_else(|| Error::Device(format!("No device {device} on this rank")))?;
                    let tile = matrix.tile_at_mut(i, j)?;
                    let staged = DeviceTile::upload(dev, tile)?;
                    tile.mark_on_device(device);
                    self.stats.uploads += 1;
                    outputs.push((task.target, staged));
                    slot_of.insert(task.target, outputs.len() - 1);
                    outputs.len() - 1
                }
            };
            let wave = waves.entry(task.target).or_insert(0);
            let a = self.operand(device, &task.a)?;
            let b = self.operand(device, &task.b)?;
            let c = outputs[slot].1.clone();

            let key = BatchKey {
                device,
                wave: *wave,
                a: a.shape(),
                b: b.shape(),
                op_a: task.op_a,
                op_b: task.op_b,
                alpha: task.alpha,
                beta: task.beta,
            };
            *wave += 1;
            match batches.iter_mut().find(|batch| batch.key == key) {
                Some(batch) => batch.push(a, b, c),
                None => batches.push(Batch {
                    key,
                    a: vec![a],
                    b: vec![b],
                    c: vec![c],
                }),
            }
        }

        // waves in order; the queue keeps them ordered per device
        batches.sort_by_key(|batch| (batch.key.device, batch.key.wave));
        for batch in &batches {
            let k = &batch.key;
            batch_gemm(&self.queues[k.device], k.alpha, k.op_a, &batch.a, k.op_b, &batch.b, k.beta, &batch.c)?;
            self.stats.launches += 1;
        }
        debug!(launches = batches.len(), targets = outputs.len(), "trailing update offloaded");

        Ok(PendingUpdate {
            columns: outputs.iter().map(|((_, j), _)| *j).collect(),
            outputs,
        })
    }

    /// Wait for `pending` and copy its results back into `matrix`
    #[instrument(skip_all, fields(targets = pending.outputs.len()))]
    pub fn complete(&mut self, matrix: &mut TiledMatrix<T>, pending: PendingUpdate<T>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut first_fault = None;
        for queue in &self.queues {
            if let Err(e) = queue.sync() {
                first_fault.get_or_insert(e);
            }
        }
        if let Some(fault) = first_fault {
            return Err(fault);
        }
        for ((i, j), staged) in pending.outputs {
            let values = staged.download()?;
            matrix.tile_at_mut(i, j)?.load_from_device(&values)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BatchKey<T> {
    device: usize,
    wave: usize,
    a: (usize, usize),
    b: (usize, usize),
    op_a: Op,
    op_b: Op,
    alpha: T,
    beta: T,
}

struct Batch<T> {
    key: BatchKey<T>,
    a: Vec<DeviceTile<T>>,
    b: Vec<DeviceTile<T>>,
    c: Vec<DeviceTile<T>>,
}

impl<T> Batch<T> {
    fn push(&mut self, a: DeviceTile<T>, b: DeviceTile<T>, c: DeviceTile<T>) {
        self.a.push(a);
        self.b.push(b);
        self.c.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{ErrorKind, ProcessGrid, RankContext, ScalarBackend, TileState};

    fn matrix() -> TiledMatrix<f64> {
        let mut a = TiledMatrix::new(6, 6, 2, 2, ProcessGrid::new(1, 1).unwrap(), RankContext::single()).unwrap();
        a.fill_with(|i, j| (i * 6 + j) as f64).unwrap();
        a
    }

    fn tasks(a: &Arc<Tile<f64>>, b: &Arc<Tile<f64>>) -> Vec<UpdateTask<f64>> {
        let mut tasks = Vec::new();
        for j in 1..3 {
            for i in 0..3 {
                for _ in 0..2 {
                    tasks.push(UpdateTask {
                        target: (i, j),
                        alpha: -1.0,
                        a: Arc::clone(a),
                        op_a: Op::NoTrans,
                        b: Arc::clone(b),
                        op_b: Op::ConjTrans,
                        beta: 1.0,
                    });
                }
            }
        }
        tasks
    }

    #[test]
    fn test_offload_matches_host() {
        let a = Arc::new(Tile::from_fn(2, 2, |i, j| 0.5 + (i as f64) - j as f64));
        let b = Arc::new(Tile::from_fn(2, 2, |i, j| (i + 2 * j) as f64 * 0.25));

        let mut host = matrix();
        for task in tasks(&a, &b) {
            let (i, j) = task.target;
            task.apply(&ScalarBackend, host.tile_at_mut(i, j).unwrap());
        }

        let mut dev = matrix();
        let mut offload = TileOffload::<f64>::new(2, 1 << 20).unwrap();
        let pending = offload.submit(&mut dev, tasks(&a, &b)).unwrap();
        assert!(pending.touches(1) && pending.touches(2) && !pending.touches(0));
        assert!(matches!(dev.tile_at(0, 1).unwrap().state(), TileState::PackedDevice(_)));
        offload.complete(&mut dev, pending).unwrap();

        for ((i, j), tile) in host.tiles() {
            assert_eq!(dev.tile_at(i, j).unwrap(), tile);
        }
        let stats = offload.stats();
        // one upload of each operand per device, one per target
        assert_eq!(stats.uploads, 2 * 2 + 6);
        // two waves on each of the two devices
        assert_eq!(stats.launches, 4);

        drop((a, b));
        offload.prune();
        assert!(offload.cache.is_empty());
    }

    #[test]
    fn test_prune_releases_operands_shared_by_devices() {
        let a = Arc::new(Tile::identity(2));
        let b = Arc::new(Tile::from_fn(2, 2, |i, j| (i + j) as f64));
        let mut m = matrix();
        let mut offload = TileOffload::<f64>::new(2, 1 << 20).unwrap();
        let pending = offload.submit(&mut m, tasks(&a, &b)).unwrap();
        offload.complete(&mut m, pending).unwrap();

        // both operands live on both devices, one entry each
        assert_eq!(offload.cache.len(), 2);
        assert!(offload.cache.values().all(|c| c.copies.len() == 2));
        let used: usize = offload.devices().iter().map(|d| d.used()).sum();

        offload.prune();
        assert_eq!(offload.cache.len(), 2, "operands still held by the caller");

        drop(b);
        offload.prune();
        assert_eq!(offload.cache.len(), 1);
        let after: usize = offload.devices().iter().map(|d| d.used()).sum();
        assert_eq!(used - after, 2 * 4 * std::mem::size_of::<f64>());

        drop(a);
        offload.prune();
        assert!(offload.cache.is_empty());
    }

    #[test]
    fn test_device_oom_is_resource_error() {
        let a = Arc::new(Tile::identity(2));
        let mut m = matrix();
        let mut offload = TileOffload::<f64>::new(1, 40).unwrap();
        let err = offload.submit(&mut m, tasks(&a, &a)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
    }
}
