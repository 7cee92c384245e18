//! Device batched-kernel layer
//!
//! Simulated accelerators with their own memory budget and execution units,
//! in-order asynchronous queues, and batched kernels over uniform tiles:
//!
//! - [`reduce_norm`]: max, one, inf and Frobenius norms per tile, for
//!   general and Hermitian (Lower/Upper) tiles
//! - [`batch_gemm`] and [`batch_trsm`]: uniform-shape tile updates
//! - [`TileOffload`]: stages a rank's trailing updates on its devices
//!
//! # Example
//!
//! ```rust
//! use tessera_core::{Norm, Tile, Uplo};
//! use tessera_device::{reduce_norm, Device, DeviceConfig, DeviceTile, Queue};
//!
//! let device = Device::new(0, DeviceConfig::default()).unwrap();
//! let queue = Queue::new(&device).unwrap();
//! let tiles: Vec<_> = (1..=3)
//!     .map(|s| DeviceTile::upload(&device, &Tile::from_fn(2, 2, |_, _| s as f64)).unwrap().buffer)
//!     .collect();
//! let values = device.alloc::<f64>(3).unwrap();
//!
//! reduce_norm(&queue, Norm::Max, Uplo::General, 2, 2, &tiles, 2, &values, 1, 3).unwrap();
//! queue.sync().unwrap();
//! assert_eq!(values.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
//! ```

pub mod batched;
pub mod device;
pub mod norm;
pub mod offload;
pub mod queue;
pub mod sumsq;

pub use batched::{batch_gemm, batch_trsm, DeviceTile};
pub use device::{Device, DeviceBuffer, DeviceConfig, DeviceSet};
pub use norm::{output_len, reduce_norm, tile_norm, TileRef};
pub use offload::{OffloadStats, PendingUpdate, TileOffload, UpdateTask};
pub use queue::Queue;
pub use sumsq::SumSq;
