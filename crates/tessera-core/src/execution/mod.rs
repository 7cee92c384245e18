//! Execution engines for controlling how many tiles are processed at once
//!
//! An engine couples a kernel backend with an execution strategy. Drivers
//! hand an engine a batch of disjoint tiles and it runs the per-tile kernel
//! sequentially or on a rayon pool.
//!
//! # Design Philosophy
//!
//! - **Unified Control**: one type parameter selects backend and parallelism
//! - **Disjoint mutation**: `for_each_mut` takes `&mut [U]`, so tiles updated
//!   in parallel can never alias
//! - **Thread Pool Integration**: the global rayon pool or a dedicated one

use crate::primitives::{ScalarBackend, TileKernels};
use crate::{Result, Scalar};

/// Execution strategy for batch operations
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExecutionStrategy {
    /// Process items sequentially
    Sequential,
    /// Process items in parallel
    Parallel,
}

/// Trait for execution engines that control how tile work is performed
pub trait ExecutionEngine<T: Scalar>: Clone + Send + Sync {
    /// The kernels used by this engine
    type Kernels: TileKernels<T>;

    /// Get the kernels for per-tile operations
    fn kernels(&self) -> &Self::Kernels;

    /// Execute a function in the engine's execution context
    fn execute<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send;

    /// Evaluate `f(0..count)`, collecting results in index order
    fn execute_batch<F, R>(&self, count: usize, f: F) -> Vec<R>
    where
        F: Fn(usize) -> R + Sync + Send,
        R: Send;

    /// Apply `f` to every item; items are disjoint so they may run concurrently
    fn for_each_mut<U, F>(&self, items: &mut [U], f: F)
    where
        U: Send,
        F: Fn(&mut U) + Sync + Send;

    /// Get the execution strategy
    fn strategy(&self) -> ExecutionStrategy;

    /// Check if parallel execution is available
    fn is_parallel(&self) -> bool {
        self.strategy() == ExecutionStrategy::Parallel
    }

    /// Get the number of threads available
    fn num_threads(&self) -> usize;
}

/// Sequential execution engine
///
/// Executes all operations sequentially in the current thread.
#[derive(Clone, Debug)]
pub struct SequentialEngine<T: Scalar, K: TileKernels<T>> {
    kernels: K,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: Scalar, K: TileKernels<T>> SequentialEngine<T, K> {
    /// Create a new sequential engine with the given kernels
    pub fn new(kernels: K) -> Self {
        Self {
            kernels,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T: Scalar, K: TileKernels<T>> ExecutionEngine<T> for SequentialEngine<T, K> {
    type Kernels = K;

    fn kernels(&self) -> &Self::Kernels {
        &self.kernels
    }

    fn execute<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        f()
    }

    fn execute_batch<F, R>(&self, count: usize, f: F) -> Vec<R>
    where
        F: Fn(usize) -> R + Sync + Send,
        R: Send,
    {
        (0..count).map(f).collect()
    }

    fn for_each_mut<U, F>(&self, items: &mut [U], f: F)
    where
        U: Send,
        F: Fn(&mut U) + Sync + Send,
    {
        items.iter_mut().for_each(f)
    }

    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::Sequential
    }

    fn num_threads(&self) -> usize {
        1
    }
}

/// Parallel execution engine using Rayon
#[cfg(feature = "parallel")]
#[derive(Clone, Debug)]
pub struct ParallelEngine<T: Scalar, K: TileKernels<T>> {
    kernels: K,
    thread_pool: Option<std::sync::Arc<rayon::ThreadPool>>,
    _phantom: std::marker::PhantomData<T>,
}

#[cfg(feature = "parallel")]
impl<T: Scalar, K: TileKernels<T>> ParallelEngine<T, K> {
    /// Create a new parallel engine with default thread pool
    pub fn new(kernels: K) -> Self {
        Self {
            kernels,
            thread_pool: None,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Create a new parallel engine with a custom thread pool
    pub fn with_thread_pool(kernels: K, pool: std::sync::Arc<rayon::ThreadPool>) -> Self {
        Self {
            kernels,
            thread_pool: Some(pool),
            _phantom: std::marker::PhantomData,
        }
    }

    /// Create with a specific number of threads
    pub fn with_num_threads(kernels: K, num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("tessera-host-{i}"))
            .build()
            .map_err(|e| crate::Error::Execution(format!("Failed to create thread pool: {e}")))?;

        Ok(Self::with_thread_pool(kernels, std::sync::Arc::new(pool)))
    }
}

#[cfg(feature = "parallel")]
impl<T: Scalar, K: TileKernels<T>> ExecutionEngine<T> for ParallelEngine<T, K> {
    type Kernels = K;

    fn kernels(&self) -> &Self::Kernels {
        &self.kernels
    }

    fn execute<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        if let Some(pool) = &self.thread_pool {
            pool.install(f)
        } else {
            rayon::scope(|_| f())
        }
    }

    fn execute_batch<F, R>(&self, count: usize, f: F) -> Vec<R>
    where
        F: Fn(usize) -> R + Sync + Send,
        R: Send,
    {
        use rayon::prelude::*;

        if let Some(pool) = &self.thread_pool {
            pool.install(|| (0..count).into_par_iter().map(f).collect())
        } else {
            (0..count).into_par_iter().map(f).collect()
        }
    }

    fn for_each_mut<U, F>(&self, items: &mut [U], f: F)
    where
        U: Send,
        F: Fn(&mut U) + Sync + Send,
    {
        use rayon::prelude::*;

        if let Some(pool) = &self.thread_pool {
            pool.install(|| items.par_iter_mut().for_each(f))
        } else {
            items.par_iter_mut().for_each(f)
        }
    }

    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::Parallel
    }

    fn num_threads(&self) -> usize {
        if let Some(pool) = &self.thread_pool {
            pool.current_num_threads()
        } else {
            rayon::current_num_threads()
        }
    }
}

/// Engine chosen at run time from the `HostThreads` option
#[derive(Clone, Debug)]
pub enum HostEngine<T: Scalar> {
    Sequential(SequentialEngine<T, ScalarBackend>),
    #[cfg(feature = "parallel")]
    Parallel(ParallelEngine<T, ScalarBackend>),
}

impl<T: Scalar> HostEngine<T> {
    /// `0` uses the global pool, `1` runs sequentially, `n` builds a pool of `n`
    pub fn from_threads(threads: usize) -> Result<Self> {
        #[cfg(feature = "parallel")]
        {
            match threads {
                1 => Ok(Self::Sequential(scalar_sequential())),
                0 => Ok(Self::Parallel(scalar_parallel())),
                n => Ok(Self::Parallel(ParallelEngine::with_num_threads(ScalarBackend, n)?)),
            }
        }
        #[cfg(not(feature = "parallel"))]
        {
            if threads > 1 {
                log::debug!("parallel feature disabled; ignoring {threads} host threads");
            }
            Ok(Self::Sequential(scalar_sequential()))
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $engine:ident => $body:expr) => {
        match $self {
            HostEngine::Sequential($engine) => $body,
            #[cfg(feature = "parallel")]
            HostEngine::Parallel($engine) => $body,
        }
    };
}

impl<T: Scalar> ExecutionEngine<T> for HostEngine<T> {
    type Kernels = ScalarBackend;

    fn kernels(&self) -> &ScalarBackend {
        dispatch!(self, e => e.kernels())
    }

    fn execute<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        dispatch!(self, e => e.execute(f))
    }

    fn execute_batch<F, R>(&self, count: usize, f: F) -> Vec<R>
    where
        F: Fn(usize) -> R + Sync + Send,
        R: Send,
    {
        dispatch!(self, e => e.execute_batch(count, f))
    }

    fn for_each_mut<U, F>(&self, items: &mut [U], f: F)
    where
        U: Send,
        F: Fn(&mut U) + Sync + Send,
    {
        dispatch!(self, e => e.for_each_mut(items, f))
    }

    fn strategy(&self) -> ExecutionStrategy {
        dispatch!(self, e => e.strategy())
    }

    fn num_threads(&self) -> usize {
        dispatch!(self, e => e.num_threads())
    }
}

/// Create a sequential scalar engine
pub fn scalar_sequential<T: Scalar>() -> SequentialEngine<T, ScalarBackend> {
    SequentialEngine::new(ScalarBackend)
}

/// Create a parallel scalar engine on the global pool
#[cfg(feature = "parallel")]
pub fn scalar_parallel<T: Scalar>() -> ParallelEngine<T, ScalarBackend> {
    ParallelEngine::new(ScalarBackend)
}

/// Create an engine based on available features
pub fn auto_engine<T: Scalar>() -> HostEngine<T> {
    #[cfg(feature = "parallel")]
    {
        HostEngine::Parallel(scalar_parallel())
    }
    #[cfg(not(feature = "parallel"))]
    {
        HostEngine::Sequential(scalar_sequential())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::Tile;

    #[test]
    fn test_sequential_engine() {
        let engine = scalar_sequential::<f64>();
        assert_eq!(engine.strategy(), ExecutionStrategy::Sequential);
        assert_eq!(engine.num_threads(), 1);
        assert!(!engine.is_parallel());

        let squares = engine.execute_batch(4, |i| i * i);
        assert_eq!(squares, vec![0, 1, 4, 9]);
    }

    #[test]
    fn test_for_each_mut_updates_tiles() {
        let engine = auto_engine::<f64>();
        let mut tiles: Vec<Tile<f64>> = (0..8).map(|_| Tile::zeros(2, 2)).collect();
        engine.for_each_mut(&mut tiles, |t| t.fill(3.0));
        assert!(tiles.iter().all(|t| t.get(1, 1) == 3.0));
        assert_eq!(TileKernels::<f64>::backend_name(engine.kernels()), "scalar");
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_engine_threads() {
        let engine = HostEngine::<f64>::from_threads(2).unwrap();
        assert!(engine.is_parallel());
        assert_eq!(engine.num_threads(), 2);
        let total: usize = engine.execute(|| engine.execute_batch(100, |i| i).iter().sum());
        assert_eq!(total, 4950);

        let seq = HostEngine::<f64>::from_threads(1).unwrap();
        assert!(!seq.is_parallel());
    }
}
