//! Shared utilities for integration tests
//!
//! Matrices are generated densely (column-major, seeded) so every rank can
//! build its share and the expected results are computed serially.

#![allow(dead_code)]

use num_complex::Complex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tessera_comm::{LocalCommunicator, LocalFabric};
use tessera_core::{ProcessGrid, Scalar, TiledMatrix, Uplo};

pub type C64 = Complex<f64>;

/// Scalars the tests draw at random
pub trait TestScalar: Scalar<Real = f64> {
    fn sample(rng: &mut ChaCha8Rng) -> Self;
}

impl TestScalar for f64 {
    fn sample(rng: &mut ChaCha8Rng) -> Self {
        rng.gen_range(-1.0..1.0)
    }
}

impl TestScalar for C64 {
    fn sample(rng: &mut ChaCha8Rng) -> Self {
        Complex::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
    }
}

/// Dense column-major `m x n` matrix
#[derive(Debug, Clone, PartialEq)]
pub struct Dense<T> {
    pub m: usize,
    pub n: usize,
    pub data: Vec<T>,
}

impl<T: TestScalar> Dense<T> {
    pub fn zeros(m: usize, n: usize) -> Self {
        Self { m, n, data: vec![T::zero(); m * n] }
    }

    pub fn from_fn(m: usize, n: usize, f: impl Fn(usize, usize) -> T) -> Self {
        let data = (0..n).flat_map(|j| (0..m).map(move |i| (i, j))).map(|(i, j)| f(i, j)).collect();
        Self { m, n, data }
    }

    pub fn identity(n: usize) -> Self {
        Self::from_fn(n, n, |i, j| if i == j { T::one() } else { T::zero() })
    }

    pub fn random(m: usize, n: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let data = (0..m * n).map(|_| T::sample(&mut rng)).collect();
        Self { m, n, data }
    }

    /// Random Hermitian positive definite matrix `B B^H + n I`
    pub fn random_hpd(n: usize, seed: u64) -> Self {
        let b = Self::random(n, n, seed);
        let mut a = b.mul(&b.adjoint());
        for i in 0..n {
            let d = a.get(i, i).real() + n as f64;
            a.set(i, i, T::from_real(d));
        }
        a
    }

    /// Random Hermitian matrix with a real diagonal, generally indefinite
    pub fn random_hermitian(n: usize, seed: u64) -> Self {
        let r = Self::random(n, n, seed);
        Self::from_fn(n, n, |i, j| match i.cmp(&j) {
            std::cmp::Ordering::Greater => r.get(i, j),
            std::cmp::Ordering::Equal => T::from_real(r.get(i, i).real()),
            std::cmp::Ordering::Less => r.get(j, i).conj(),
        })
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> T {
        self.data[i + j * self.m]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, v: T) {
        self.data[i + j * self.m] = v;
    }

    pub fn adjoint(&self) -> Self {
        Self::from_fn(self.n, self.m, |i, j| self.get(j, i).conj())
    }

    pub fn mul(&self, other: &Self) -> Self {
        assert_eq!(self.n, other.m, "inner dimensions");
        let mut out = Self::zeros(self.m, other.n);
        for j in 0..other.n {
            for l in 0..self.n {
                let b = other.get(l, j);
                for i in 0..self.m {
                    out.data[i + j * self.m] += self.get(i, l) * b;
                }
            }
        }
        out
    }

    pub fn sub(&self, other: &Self) -> Self {
        Self::from_fn(self.m, self.n, |i, j| self.get(i, j) - other.get(i, j))
    }

    /// Frobenius norm
    pub fn fro(&self) -> f64 {
        self.data.iter().map(|x| x.abs_sqr()).sum::<f64>().sqrt()
    }

    /// Leading `rows x cols` block
    pub fn head(&self, rows: usize, cols: usize) -> Self {
        Self::from_fn(rows, cols, |i, j| self.get(i, j))
    }
}

/// Process grid for `p x q` ranks
pub fn grid(p: usize, q: usize) -> ProcessGrid {
    ProcessGrid::new(p, q).unwrap()
}

/// Run `f` on every rank of a `p x q` grid
pub fn on_grid<R, F>(p: usize, q: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(LocalCommunicator, ProcessGrid) -> R + Sync,
{
    let g = grid(p, q);
    LocalFabric::run(p * q, |comm| f(comm, g)).unwrap()
}

/// This rank's share of `dense`, in `nb x nb` tiles
pub fn distribute<T: TestScalar>(
    comm: &LocalCommunicator,
    grid: ProcessGrid,
    dense: &Dense<T>,
    nb: usize,
    storage: Uplo,
) -> TiledMatrix<T> {
    use tessera_comm::Communicator;
    let mut a: TiledMatrix<T> = TiledMatrix::builder(dense.m, dense.n)
        .tile_size(nb, nb)
        .grid(grid)
        .storage(storage)
        .build(comm.context())
        .unwrap();
    a.fill_from_col_major(&dense.data).unwrap();
    a
}

/// Every rank's view of `a`, reassembled densely
pub fn collect<T: TestScalar>(comm: &LocalCommunicator, a: &TiledMatrix<T>) -> Dense<T> {
    let data = tessera_linalg::all_gather(comm, a).unwrap();
    Dense { m: a.m(), n: a.n(), data }
}

/// `||A X - B|| / (||A|| ||X|| + ||B||)`
pub fn relative_residual<T: TestScalar>(a: &Dense<T>, x: &Dense<T>, b: &Dense<T>) -> f64 {
    a.mul(x).sub(b).fro() / (a.fro() * x.fro() + b.fro())
}

/// Assert two dense matrices agree entrywise
pub fn assert_dense_close<T: TestScalar>(actual: &Dense<T>, expected: &Dense<T>, tol: f64, context: &str) {
    assert_eq!((actual.m, actual.n), (expected.m, expected.n), "shape mismatch for {context}");
    for j in 0..actual.n {
        for i in 0..actual.m {
            let (a, e) = (actual.get(i, j), expected.get(i, j));
            assert!(
                (a - e).abs_val() <= tol * (1.0 + e.abs_val()),
                "{context}: entry ({i}, {j}) is {a:?}, expected {e:?}"
            );
        }
    }
}
