//! Small band LU used for the block tridiagonal factor of the indefinite solver
//!
//! Column-major band storage with room for the fill-in created by partial
//! pivoting: entry `(i, j)` lives at `data[kl + ku + i - j + j * ldab]`
//! where `ldab = 2 kl + ku + 1`. The matrix is replicated on every rank,
//! so everything here is purely local.

use tessera_core::{Breakdown, Error, Result, Scalar, Tile};

#[derive(Debug, Clone)]
pub struct BandMatrix<T> {
    n: usize,
    kl: usize,
    ku: usize,
    ldab: usize,
    data: Vec<T>,
    pivots: Vec<usize>,
    factored: bool,
}

impl<T: Scalar> BandMatrix<T> {
    /// Zero `n x n` band matrix with `kl` sub- and `ku` superdiagonals
    pub fn new(n: usize, kl: usize, ku: usize) -> Result<Self> {
        let ldab = 2 * kl + ku + 1;
        let len = ldab
            .checked_mul(n)
            .ok_or_else(|| Error::InvalidConfiguration(format!("Band of order {n} with width {ldab} overflows")))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| Error::host_oom(len, std::mem::size_of::<T>()))?;
        data.resize(len, T::zero());
        Ok(Self {
            n,
            kl,
            ku,
            ldab,
            data,
            pivots: Vec::new(),
            factored: false,
        })
    }

    /// Block tridiagonal Hermitian matrix from its diagonal blocks
    /// `T(k, k)` and subdiagonal blocks `T(k + 1, k)`; the superdiagonal
    /// blocks are the adjoints of the subdiagonal ones.
    ///
    /// Subdiagonal blocks are upper triangular, so the band is `nb` wide on
    /// both sides.
    pub fn from_block_tridiagonal(n: usize, nb: usize, diag: &[Tile<T>], sub: &[Tile<T>]) -> Result<Self> {
        let mut band = Self::new(n, nb, nb)?;
        for (k, block) in diag.iter().enumerate() {
            let r0 = k * nb;
            for c in 0..block.cols() {
                for r in 0..block.rows() {
                    band.set(r0 + r, r0 + c, block.get(r, c))?;
                }
            }
        }
        for (k, block) in sub.iter().enumerate() {
            let (r0, c0) = ((k + 1) * nb, k * nb);
            for c in 0..block.cols() {
                for r in 0..block.rows().min(c + 1) {
                    let v = block.get(r, c);
                    band.set(r0 + r, c0 + c, v)?;
                    band.set(c0 + c, r0 + r, v.conj())?;
                }
            }
        }
        Ok(band)
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn kl(&self) -> usize {
        self.kl
    }

    pub fn ku(&self) -> usize {
        self.ku
    }

    pub fn is_factored(&self) -> bool {
        self.factored
    }

    /// Row interchanges of the factorization, one per column
    pub fn pivots(&self) -> &[usize] {
        &self.pivots
    }

    #[inline]
    fn in_band(&self, i: usize, j: usize) -> bool {
        i < self.n && j < self.n && j <= i + self.ku && i <= j + self.kl
    }

    #[inline]
    fn at(&self, i: usize, j: usize) -> usize {
        self.kl + self.ku + i - j + j * self.ldab
    }

    /// Entry `(i, j)`; zero outside the band
    pub fn get(&self, i: usize, j: usize) -> T {
        if self.in_band(i, j) {
            self.data[self.at(i, j)]
        } else {
            T::zero()
        }
    }

    pub fn set(&mut self, i: usize, j: usize, value: T) -> Result<()> {
        if !self.in_band(i, j) {
            return Err(Error::InvalidParameter(format!(
                "({i}, {j}) is outside the band of an order {} matrix with kl={} ku={}",
                self.n, self.kl, self.ku
            )));
        }
        let at = self.at(i, j);
        self.data[at] = value;
        Ok(())
    }

    /// LU with partial pivoting in place.
    ///
    /// Stops at the first exactly zero pivot and reports its column.
    pub fn factor(&mut self) -> std::result::Result<(), Breakdown> {
        let (n, kl, ku, ld) = (self.n, self.kl, self.ku, self.ldab);
        let kv = kl + ku;
        let d = &mut self.data;
        self.pivots.clear();
        let mut ju = 0;
        for j in 0..n {
            if j + kv < n {
                for i in 0..kl {
                    d[i + (j + kv) * ld] = T::zero();
                }
            }
            let km = kl.min(n - 1 - j);
            let mut jp = 0;
            let mut best = d[kv + j * ld].abs_val();
            for r in 1..=km {
                let v = d[kv + r + j * ld].abs_val();
                if v > best {
                    best = v;
                    jp = r;
                }
            }
            self.pivots.push(j + jp);
            if d[kv + jp + j * ld] == T::zero() {
                return Err(Breakdown { column: j });
            }
            ju = ju.max((j + ku + jp).min(n - 1));
            if jp != 0 {
                for c in j..=ju {
                    d.swap(kv + j + jp - c + c * ld, kv + j - c + c * ld);
                }
            }
            if km > 0 {
                let recip = T::one() / d[kv + j * ld];
                for r in 1..=km {
                    d[kv + r + j * ld] *= recip;
                }
                for c in j + 1..=ju {
                    let u = d[kv + j - c + c * ld];
                    if u == T::zero() {
                        continue;
                    }
                    for r in 1..=km {
                        let l = d[kv + r + j * ld];
                        d[kv + j + r - c + c * ld] -= l * u;
                    }
                }
            }
        }
        self.factored = true;
        Ok(())
    }

    /// Solve `A X = B` with the factored matrix; `b` is column-major `n x nrhs`.
    pub fn solve(&self, b: &mut [T], nrhs: usize) -> Result<()> {
        if !self.factored {
            return Err(Error::InvalidState("band matrix is not factored".to_string()));
        }
        let n = self.n;
        if b.len() != n * nrhs {
            return Err(Error::size_mismatch(n * nrhs, b.len(), "band right-hand side"));
        }
        let (kl, ld) = (self.kl, self.ldab);
        let kv = self.kl + self.ku;
        let d = &self.data;
        for x in b.chunks_exact_mut(n.max(1)) {
            for j in 0..n.saturating_sub(1) {
                let l = self.pivots[j];
                if l != j {
                    x.swap(l, j);
                }
                let xj = x[j];
                for r in 1..=kl.min(n - 1 - j) {
                    x[j + r] -= d[kv + r + j * ld] * xj;
                }
            }
            for j in (0..n).rev() {
                if x[j] == T::zero() {
                    continue;
                }
                x[j] /= d[kv + j * ld];
                let xj = x[j];
                for i in j.saturating_sub(kv)..j {
                    x[i] -= d[kv + i - j + j * ld] * xj;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_band(n: usize, kl: usize, ku: usize, seed: u64) -> BandMatrix<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut band = BandMatrix::new(n, kl, ku).unwrap();
        for j in 0..n {
            for i in j.saturating_sub(ku)..(j + kl + 1).min(n) {
                band.set(i, j, rng.gen_range(-1.0..1.0)).unwrap();
            }
        }
        band
    }

    #[test]
    fn test_factor_solve_matches_dense_product() {
        let (n, kl, ku) = (9, 2, 1);
        let band = random_band(n, kl, ku, 7);
        let x: Vec<f64> = (0..n).map(|i| 1.0 + i as f64).collect();
        let mut b: Vec<f64> = (0..n).map(|i| (0..n).map(|j| band.get(i, j) * x[j]).sum()).collect();

        let mut lu = band.clone();
        lu.factor().unwrap();
        lu.solve(&mut b, 1).unwrap();
        for (got, want) in b.iter().zip(&x) {
            assert_relative_eq!(got, want, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_block_tridiagonal_is_hermitian() {
        let diag = vec![Tile::from_fn(2, 2, |i, j| (1 + i + j) as f64), Tile::identity(1)];
        let sub = vec![Tile::from_fn(1, 2, |_, j| 5.0 + j as f64)];
        let band = BandMatrix::from_block_tridiagonal(3, 2, &diag, &sub).unwrap();
        assert_eq!(band.get(2, 0), 5.0);
        assert_eq!(band.get(0, 2), 5.0);
        assert_eq!(band.get(2, 1), 6.0);
        assert_eq!(band.get(1, 2), 6.0);
        assert_eq!(band.get(1, 0), 2.0);
    }

    #[test]
    fn test_zero_pivot_is_reported() {
        let mut band = BandMatrix::<f64>::new(3, 1, 1).unwrap();
        band.set(0, 0, 1.0).unwrap();
        band.set(2, 2, 1.0).unwrap();
        assert_eq!(band.factor(), Err(Breakdown { column: 1 }));
        assert!(band.set(0, 2, 1.0).is_err());
    }
}
