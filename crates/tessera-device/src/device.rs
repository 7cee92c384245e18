//! Simulated accelerators and their memory
//!
//! A [`Device`] has a fixed memory capacity and its own pool of execution
//! units. Every [`DeviceBuffer`] holds a reservation against that capacity
//! for as long as any handle to it lives.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tessera_core::{Error, MemoryLocation, Result, Scalar};
use tracing::{debug, trace};

/// Capacity and parallelism of one simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub memory_bytes: usize,
    pub execution_units: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_bytes: tessera_core::options::DEFAULT_DEVICE_MEMORY,
            execution_units: num_units(),
        }
    }
}

fn num_units() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(1)
}

struct DeviceInner {
    id: usize,
    capacity: usize,
    used: AtomicUsize,
    pool: rayon::ThreadPool,
}

impl DeviceInner {
    fn reserve(&self, bytes: usize) -> Result<()> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let next = used.checked_add(bytes).filter(|&n| n <= self.capacity);
            let Some(next) = next else {
                return Err(Error::OutOfMemory {
                    location: MemoryLocation::Device(self.id),
                    requested: bytes,
                    available: self.capacity.saturating_sub(used),
                });
            };
            match self
                .used
                .compare_exchange_weak(used, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(current) => used = current,
            }
        }
    }

    fn unreserve(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Handle to a simulated accelerator; clones share the device
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("capacity", &self.inner.capacity)
            .field("used", &self.used())
            .finish()
    }
}

impl Device {
    pub fn new(id: usize, config: DeviceConfig) -> Result<Self> {
        if config.execution_units == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "Device {id} needs at least one execution unit"
            )));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.execution_units)
            .thread_name(move |i| format!("tessera-dev{id}-{i}"))
            .build()
            .map_err(|e| Error::Device(format!("Failed to start device {id}: {e}")))?;
        debug!(device = id, memory = config.memory_bytes, units = config.execution_units, "device online");
        Ok(Self {
            inner: Arc::new(DeviceInner {
                id,
                capacity: config.memory_bytes,
                used: AtomicUsize::new(0),
                pool,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.inner.id
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bytes currently reserved by live buffers
    #[inline]
    pub fn used(&self) -> usize {
        self.inner.used.load(Ordering::Acquire)
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.used())
    }

    #[inline]
    pub fn execution_units(&self) -> usize {
        self.inner.pool.current_num_threads()
    }

    /// Zeroed buffer of `len` elements
    pub fn alloc<T: Scalar>(&self, len: usize) -> Result<DeviceBuffer<T>> {
        let bytes = len.saturating_mul(std::mem::size_of::<T>());
        self.inner.reserve(bytes)?;
        let reservation = Reservation {
            device: Arc::clone(&self.inner),
            bytes,
        };
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| Error::OutOfMemory {
            location: MemoryLocation::Device(self.id()),
            requested: bytes,
            available: self.available(),
        })?;
        data.resize(len, T::zero());
        trace!(device = self.id(), bytes, "alloc");
        Ok(DeviceBuffer {
            data: Arc::new(RwLock::new(data)),
            reservation: Arc::new(reservation),
        })
    }

    /// Buffer holding a copy of `values`
    pub fn upload<T: Scalar>(&self, values: &[T]) -> Result<DeviceBuffer<T>> {
        let buffer = self.alloc(values.len())?;
        buffer.copy_from(values)?;
        Ok(buffer)
    }

    /// Run `f` on this device's execution units
    pub fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        self.inner.pool.install(f)
    }
}

struct Reservation {
    device: Arc<DeviceInner>,
    bytes: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.device.unreserve(self.bytes);
    }
}

/// Device allocation; clones are handles to the same memory
#[derive(Clone)]
pub struct DeviceBuffer<T> {
    data: Arc<RwLock<Vec<T>>>,
    reservation: Arc<Reservation>,
}

impl<T: Scalar> DeviceBuffer<T> {
    pub fn len(&self) -> usize {
        self.reservation.bytes / std::mem::size_of::<T>().max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Device the buffer lives on
    pub fn device_id(&self) -> usize {
        self.reservation.device.id
    }

    /// Whether both handles refer to the same allocation
    pub fn same_allocation(&self, other: &DeviceBuffer<T>) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Overwrite the contents with `values`
    pub fn copy_from(&self, values: &[T]) -> Result<()> {
        self.write(|data| {
            if data.len() != values.len() {
                return Err(Error::size_mismatch(data.len(), values.len(), "device upload"));
            }
            data.copy_from_slice(values);
            Ok(())
        })?
    }

    /// Host copy of the contents
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.read(|data| data.to_vec())
    }

    pub fn read<R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        let guard = self
            .data
            .read()
            .map_err(|_| Error::Device("device buffer lock poisoned".to_string()))?;
        Ok(f(&guard))
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| Error::Device("device buffer lock poisoned".to_string()))?;
        Ok(f(&mut guard))
    }
}

impl<T> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.reservation.device.id)
            .field("bytes", &self.reservation.bytes)
            .finish()
    }
}

/// The devices attached to one rank
#[derive(Debug, Clone, Default)]
pub struct DeviceSet {
    devices: Vec<Device>,
}

impl DeviceSet {
    /// `count` identical devices of `memory_bytes` each
    pub fn new(count: usize, memory_bytes: usize) -> Result<Self> {
        let config = DeviceConfig {
            memory_bytes,
            ..DeviceConfig::default()
        };
        let devices = (0..count)
            .map(|id| Device::new(id, config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { devices })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::ErrorKind;

    fn small_device(bytes: usize) -> Device {
        Device::new(
            3,
            DeviceConfig {
                memory_bytes: bytes,
                execution_units: 2,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_reservation_follows_buffer_lifetime() {
        let device = small_device(1024);
        let a = device.alloc::<f64>(16).unwrap();
        assert_eq!(device.used(), 128);
        let b = a.clone();
        drop(a);
        assert_eq!(device.used(), 128);
        drop(b);
        assert_eq!(device.used(), 0);
    }

    #[test]
    fn test_out_of_memory_names_device() {
        let device = small_device(100);
        let _held = device.alloc::<f32>(20).unwrap();
        let err = device.alloc::<f64>(4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        match err {
            Error::OutOfMemory {
                location,
                requested,
                available,
            } => {
                assert_eq!(location, MemoryLocation::Device(3));
                assert_eq!(requested, 32);
                assert_eq!(available, 20);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_upload_and_read_back() {
        let device = small_device(1 << 10);
        let buf = device.upload(&[1.0f32, 2.0, 3.0]).unwrap();
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
        assert!(buf.copy_from(&[0.0]).is_err());
        assert!(buf.same_allocation(&buf.clone()));
        assert_eq!(buf.device_id(), 3);
    }

    #[test]
    fn test_zero_units_rejected() {
        let cfg = DeviceConfig {
            memory_bytes: 1,
            execution_units: 0,
        };
        assert_eq!(Device::new(0, cfg).unwrap_err().kind(), ErrorKind::Configuration);
    }
}
