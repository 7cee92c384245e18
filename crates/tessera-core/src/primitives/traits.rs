//! Tile kernel trait
//!
//! Dense per-tile building blocks used by every factorization: matrix
//! multiply, triangular solve, and the unblocked panel factorizations. All
//! methods have default implementations; a backend only has to name itself.

use crate::numeric::{RealScalar, Scalar};
use crate::tile::Tile;
use crate::types::{Diag, Op, Side, Uplo};
use num_traits::{Float, One, Zero};

/// Pivot search policy for [`TileKernels::getrf`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PivotPolicy<R> {
    /// Search the column for the largest magnitude
    pub partial: bool,
    /// Pivots at or below this magnitude stop the factorization.
    /// `None` tolerates exact zeros and skips their elimination.
    pub threshold: Option<R>,
}

impl<R: RealScalar> PivotPolicy<R> {
    pub fn partial(threshold: R) -> Self {
        Self {
            partial: true,
            threshold: Some(threshold),
        }
    }

    pub fn no_pivot(threshold: R) -> Self {
        Self {
            partial: false,
            threshold: Some(threshold),
        }
    }

    /// Partial pivoting that never fails
    pub fn tolerant() -> Self {
        Self {
            partial: true,
            threshold: None,
        }
    }
}

/// Local column where an unblocked factorization broke down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakdown {
    pub column: usize,
}

#[inline]
fn op_get<T: Scalar>(a: &Tile<T>, op: Op, i: usize, j: usize) -> T {
    match op {
        Op::NoTrans => a.get(i, j),
        Op::Trans => a.get(j, i),
        Op::ConjTrans => a.get(j, i).conj(),
    }
}

/// Per-tile dense kernels
pub trait TileKernels<T: Scalar>: Clone + Send + Sync {
    /// Get the name of this backend
    fn backend_name(&self) -> &'static str;

    /// `C = alpha op(A) op(B) + beta C`
    fn gemm(&self, alpha: T, op_a: Op, a: &Tile<T>, op_b: Op, b: &Tile<T>, beta: T, c: &mut Tile<T>) {
        let (m, n) = (c.rows(), c.cols());
        let k = if op_a.is_transposed() { a.rows() } else { a.cols() };
        debug_assert_eq!(m, if op_a.is_transposed() { a.cols() } else { a.rows() });
        debug_assert_eq!(k, if op_b.is_transposed() { b.cols() } else { b.rows() });
        debug_assert_eq!(n, if op_b.is_transposed() { b.rows() } else { b.cols() });

        let ldc = c.stride();
        let cd = c.as_mut_slice();
        for j in 0..n {
            let cj = &mut cd[j * ldc..j * ldc + m];
            if beta == T::zero() {
                cj.iter_mut().for_each(|x| *x = T::zero());
            } else if beta != T::one() {
                cj.iter_mut().for_each(|x| *x *= beta);
            }
            match op_a {
                Op::NoTrans => {
                    for l in 0..k {
                        let blj = alpha * op_get(b, op_b, l, j);
                        if blj == T::zero() {
                            continue;
                        }
                        for (x, &ail) in cj.iter_mut().zip(a.col(l)) {
                            *x += ail * blj;
                        }
                    }
                }
                _ => {
                    for (i, x) in cj.iter_mut().enumerate() {
                        let ai = a.col(i);
                        let mut s = T::zero();
                        for l in 0..k {
                            let ail = if op_a == Op::ConjTrans { ai[l].conj() } else { ai[l] };
                            s += ail * op_get(b, op_b, l, j);
                        }
                        *x += alpha * s;
                    }
                }
            }
        }
    }

    /// Triangular solve with a triangular tile `A`.
    ///
    /// `Left`: `B = alpha op(A)^-1 B`, using the leading `rows(B)` block of `A`.
    /// `Right`: `B = alpha B op(A)^-1`, using the leading `cols(B)` block.
    #[allow(clippy::too_many_arguments)]
    fn trsm(&self, side: Side, uplo: Uplo, op: Op, diag: Diag, alpha: T, a: &Tile<T>, b: &mut Tile<T>) {
        debug_assert!(uplo != Uplo::General, "trsm needs a triangular operand");
        let lower_stored = uplo != Uplo::Upper;
        // op(A) is lower: stored lower and untransposed, or stored upper and transposed
        let lower = lower_stored == (op == Op::NoTrans);
        let unit = diag == Diag::Unit;
        let ta = |i: usize, l: usize| op_get(a, op, i, l);

        let (m, n) = (b.rows(), b.cols());
        let ldb = b.stride();
        let bd = b.as_mut_slice();
        if alpha != T::one() {
            for j in 0..n {
                bd[j * ldb..j * ldb + m].iter_mut().for_each(|x| *x *= alpha);
            }
        }

        match side {
            Side::Left => {
                for c in 0..n {
                    let col = &mut bd[c * ldb..c * ldb + m];
                    if lower {
                        for i in 0..m {
                            let mut s = col[i];
                            for l in 0..i {
                                s -= ta(i, l) * col[l];
                            }
                            col[i] = if unit { s } else { s / ta(i, i) };
                        }
                    } else {
                        for i in (0..m).rev() {
                            let mut s = col[i];
                            for l in i + 1..m {
                                s -= ta(i, l) * col[l];
                            }
                            col[i] = if unit { s } else { s / ta(i, i) };
                        }
                    }
                }
            }
            Side::Right => {
                for r in 0..m {
                    if lower {
                        for j in (0..n).rev() {
                            let mut s = bd[r + j * ldb];
                            for l in j + 1..n {
                                s -= bd[r + l * ldb] * ta(l, j);
                            }
                            bd[r + j * ldb] = if unit { s } else { s / ta(j, j) };
                        }
                    } else {
                        for j in 0..n {
                            let mut s = bd[r + j * ldb];
                            for l in 0..j {
                                s -= bd[r + l * ldb] * ta(l, j);
                            }
                            bd[r + j * ldb] = if unit { s } else { s / ta(j, j) };
                        }
                    }
                }
            }
        }
    }

    /// Unblocked LU of a tall panel with row interchanges confined to the panel.
    ///
    /// Returns the local pivot row chosen for each column.
    fn getrf(&self, panel: &mut Tile<T>, policy: PivotPolicy<T::Real>) -> Result<Vec<usize>, Breakdown> {
        let (rows, cols) = (panel.rows(), panel.cols());
        let kmax = rows.min(cols);
        let ld = panel.stride();
        let d = panel.as_mut_slice();
        let mut pivots = Vec::with_capacity(kmax);

        for c in 0..kmax {
            let mut p = c;
            if policy.partial {
                let mut best = d[c + c * ld].abs_val();
                for r in c + 1..rows {
                    let v = d[r + c * ld].abs_val();
                    if v > best {
                        best = v;
                        p = r;
                    }
                }
            }
            let pivot = d[p + c * ld];
            match policy.threshold {
                Some(t) if !(pivot.abs_val() > t) => return Err(Breakdown { column: c }),
                _ => {}
            }
            pivots.push(p);
            if p != c {
                for j in 0..cols {
                    d.swap(c + j * ld, p + j * ld);
                }
            }
            if pivot == T::zero() {
                continue;
            }
            for r in c + 1..rows {
                d[r + c * ld] /= pivot;
            }
            for j in c + 1..cols {
                let u = d[c + j * ld];
                if u == T::zero() {
                    continue;
                }
                for r in c + 1..rows {
                    let l = d[r + c * ld];
                    d[r + j * ld] -= l * u;
                }
            }
        }
        Ok(pivots)
    }

    /// Lower Cholesky factor of a Hermitian positive definite tile, in place.
    ///
    /// Only the lower triangle is read; the strict upper triangle is left untouched.
    fn potrf(&self, a: &mut Tile<T>) -> Result<(), Breakdown> {
        let n = a.rows().min(a.cols());
        let ld = a.stride();
        let d = a.as_mut_slice();
        for j in 0..n {
            let mut diag = d[j + j * ld].real();
            for l in 0..j {
                diag = diag - d[j + l * ld].abs_sqr();
            }
            if !(diag > T::Real::zero()) {
                return Err(Breakdown { column: j });
            }
            let ljj = Float::sqrt(diag);
            d[j + j * ld] = T::from_real(ljj);
            let inv = T::from_real(T::Real::one() / ljj);
            for i in j + 1..n {
                let mut s = d[i + j * ld];
                for l in 0..j {
                    s -= d[i + l * ld] * d[j + l * ld].conj();
                }
                d[i + j * ld] = s * inv;
            }
        }
        Ok(())
    }

    /// Householder QR of a tall panel.
    ///
    /// On return the upper triangle holds `R` and the strict lower part the
    /// reflectors (unit diagonal implied). The returned upper triangular
    /// `T` gives `Q = I - V T V^H`.
    fn geqrf(&self, panel: &mut Tile<T>) -> Tile<T> {
        let (rows, cols) = (panel.rows(), panel.cols());
        let k = rows.min(cols);
        let ld = panel.stride();
        let mut taus = Vec::with_capacity(k);
        {
            let d = panel.as_mut_slice();
            for c in 0..k {
                let alpha = d[c + c * ld];
                let xnorm = nrm2(&d[c * ld + c + 1..c * ld + rows]);
                let (ar, ai) = (alpha.real(), alpha.imag());
                if xnorm == T::Real::zero() && ai == T::Real::zero() {
                    taus.push(T::zero());
                    continue;
                }
                let mag = nrm2(&[T::from_real(ar), T::from_real(ai), T::from_real(xnorm)]);
                let beta = if ar >= T::Real::zero() { -mag } else { mag };
                let tau = T::from_parts((beta - ar) / beta, -ai / beta);
                let scal = T::one() / (alpha - T::from_real(beta));
                for r in c + 1..rows {
                    d[r + c * ld] *= scal;
                }
                d[c + c * ld] = T::from_real(beta);
                taus.push(tau);

                // apply H^H = I - conj(tau) v v^H to the trailing columns
                let ctau = tau.conj();
                for j in c + 1..cols {
                    let mut w = d[c + j * ld];
                    for r in c + 1..rows {
                        w += d[r + c * ld].conj() * d[r + j * ld];
                    }
                    let f = ctau * w;
                    d[c + j * ld] -= f;
                    for r in c + 1..rows {
                        let v = d[r + c * ld];
                        d[r + j * ld] -= v * f;
                    }
                }
            }
        }

        // forward columnwise T factor
        let mut t = Tile::<T>::zeros(k, k);
        for i in 0..k {
            let tau = taus[i];
            t.set(i, i, tau);
            if tau == T::zero() || i == 0 {
                continue;
            }
            let mut w = vec![T::zero(); i];
            for (l, wl) in w.iter_mut().enumerate() {
                let mut s = panel.get(i, l).conj();
                for r in i + 1..rows {
                    s += panel.get(r, l).conj() * panel.get(r, i);
                }
                *wl = s;
            }
            for row in 0..i {
                let mut s = T::zero();
                for (l, &wl) in w.iter().enumerate().skip(row) {
                    s += t.get(row, l) * wl;
                }
                t.set(row, i, -(tau * s));
            }
        }
        t
    }
}

/// Overflow-safe Euclidean norm
pub fn nrm2<T: Scalar>(x: &[T]) -> T::Real {
    let zero = T::Real::zero();
    let mut scale = zero;
    let mut ssq = T::Real::one();
    for &v in x {
        for part in [v.real(), v.imag()] {
            if part != zero {
                let a = Float::abs(part);
                if scale < a {
                    let r = scale / a;
                    ssq = T::Real::one() + ssq * r * r;
                    scale = a;
                } else {
                    let r = a / scale;
                    ssq = ssq + r * r;
                }
            }
        }
    }
    scale * Float::sqrt(ssq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::ScalarBackend;
    use approx::assert_relative_eq;
    use num_complex::Complex;

    fn multiply(a: &Tile<f64>, b: &Tile<f64>) -> Tile<f64> {
        let mut c = Tile::zeros(a.rows(), b.cols());
        ScalarBackend.gemm(1.0, Op::NoTrans, a, Op::NoTrans, b, 0.0, &mut c);
        c
    }

    fn assert_tiles_close(a: &Tile<f64>, b: &Tile<f64>, tol: f64) {
        assert_eq!((a.rows(), a.cols()), (b.rows(), b.cols()));
        for j in 0..a.cols() {
            for i in 0..a.rows() {
                assert_relative_eq!(a.get(i, j), b.get(i, j), epsilon = tol);
            }
        }
    }

    #[test]
    fn test_gemm_ops() {
        let a = Tile::from_fn(2, 3, |i, j| (1 + i + 2 * j) as f64);
        let b = Tile::from_fn(3, 2, |i, j| (i as f64) - (j as f64));
        let c = multiply(&a, &b);
        // row 0 of a: [1, 3, 5], column 1 of b: [-1, 0, 1]
        assert_relative_eq!(c.get(0, 1), 4.0);

        let at = a.conj_transpose();
        let mut c2 = Tile::zeros(2, 2);
        ScalarBackend.gemm(1.0, Op::Trans, &at, Op::NoTrans, &b, 0.0, &mut c2);
        assert_tiles_close(&c, &c2, 1e-14);

        let mut c3 = c.clone();
        ScalarBackend.gemm(-1.0, Op::NoTrans, &a, Op::NoTrans, &b, 1.0, &mut c3);
        assert_tiles_close(&c3, &Tile::zeros(2, 2), 1e-14);
    }

    #[test]
    fn test_trsm_all_sides() {
        let l = Tile::from_fn(3, 3, |i, j| if i >= j { 1.0 + (i + j) as f64 } else { 0.0 });
        let x = Tile::from_fn(3, 2, |i, j| (i * 2 + j) as f64 - 1.0);

        // left lower
        let mut b = multiply(&l, &x);
        ScalarBackend.trsm(Side::Left, Uplo::Lower, Op::NoTrans, Diag::NonUnit, 1.0, &l, &mut b);
        assert_tiles_close(&b, &x, 1e-12);

        // left lower conj-trans
        let lh = l.conj_transpose();
        let mut b = multiply(&lh, &x);
        ScalarBackend.trsm(Side::Left, Uplo::Lower, Op::ConjTrans, Diag::NonUnit, 1.0, &l, &mut b);
        assert_tiles_close(&b, &x, 1e-12);

        // right lower conj-trans: B = X L^H
        let xr = x.conj_transpose();
        let mut b = multiply(&xr, &lh);
        ScalarBackend.trsm(Side::Right, Uplo::Lower, Op::ConjTrans, Diag::NonUnit, 1.0, &l, &mut b);
        assert_tiles_close(&b, &xr, 1e-12);

        // right upper no-trans
        let u = lh;
        let mut b = multiply(&xr, &u);
        ScalarBackend.trsm(Side::Right, Uplo::Upper, Op::NoTrans, Diag::NonUnit, 1.0, &u, &mut b);
        assert_tiles_close(&b, &xr, 1e-12);
    }

    #[test]
    fn test_trsm_uses_leading_block() {
        let a = Tile::from_fn(4, 4, |i, j| if i == j { 2.0 } else if i > j { 1.0 } else { 9.0 });
        let mut b = Tile::from_fn(2, 1, |_, _| 2.0);
        ScalarBackend.trsm(Side::Left, Uplo::Lower, Op::NoTrans, Diag::Unit, 1.0, &a, &mut b);
        assert_eq!(b.column(0), vec![2.0, 0.0]);
    }

    #[test]
    fn test_getrf_reconstructs() {
        let a = Tile::from_fn(5, 3, |i, j| ((i * 7 + j * 3) % 5) as f64 + if i == j { 4.0 } else { 0.0 });
        let mut lu = a.clone();
        let piv = ScalarBackend.getrf(&mut lu, PivotPolicy::partial(1e-12)).unwrap();
        assert_eq!(piv.len(), 3);

        let l = lu.unit_lower();
        let u = lu.sub_tile(0, 0, 3, 3).upper();
        let prod = multiply(&l, &u);

        let mut pa = a.clone();
        for (c, &p) in piv.iter().enumerate() {
            pa.swap_rows(c, p);
        }
        assert_tiles_close(&prod, &pa, 1e-12);
    }

    #[test]
    fn test_getrf_detects_zero_pivot() {
        let mut a = Tile::from_fn(3, 3, |i, j| if j == 1 { 0.0 } else { (i + j + 1) as f64 });
        let err = ScalarBackend.getrf(&mut a, PivotPolicy::partial(1e-12)).unwrap_err();
        assert_eq!(err.column, 1);

        let mut a = Tile::from_fn(3, 3, |i, j| if j == 1 { 0.0 } else { (i + j + 1) as f64 });
        assert!(ScalarBackend.getrf(&mut a, PivotPolicy::tolerant()).is_ok());
    }

    #[test]
    fn test_potrf() {
        let a = Tile::from_fn(3, 3, |i, j| if i == j { 4.0 } else { 1.0 });
        let mut l = a.clone();
        ScalarBackend.potrf(&mut l).unwrap();
        let l = l.lower();
        let mut prod = Tile::zeros(3, 3);
        ScalarBackend.gemm(1.0, Op::NoTrans, &l, Op::ConjTrans, &l, 0.0, &mut prod);
        assert_tiles_close(&prod, &a, 1e-12);

        let mut bad = Tile::from_fn(2, 2, |i, j| if i == j { 1.0 } else { 2.0 });
        assert_eq!(ScalarBackend.potrf(&mut bad).unwrap_err().column, 1);
    }

    #[test]
    fn test_geqrf_complex() {
        type C = Complex<f64>;
        let a = Tile::from_fn(4, 3, |i, j| C::new((i + 2 * j) as f64 - 1.5, (i * j) as f64 * 0.5));
        let mut qr = a.clone();
        let t = ScalarBackend.geqrf(&mut qr);

        // Q = I - V T V^H applied to R must give back A
        let v = qr.unit_lower();
        let mut r = Tile::<C>::zeros(4, 3);
        r.set_sub_tile(0, 0, &qr.sub_tile(0, 0, 3, 3).upper());
        let mut vhr = Tile::zeros(3, 3);
        ScalarBackend.gemm(C::new(1.0, 0.0), Op::ConjTrans, &v, Op::NoTrans, &r, C::new(0.0, 0.0), &mut vhr);
        let mut tvhr = Tile::zeros(3, 3);
        ScalarBackend.gemm(C::new(1.0, 0.0), Op::NoTrans, &t, Op::NoTrans, &vhr, C::new(0.0, 0.0), &mut tvhr);
        ScalarBackend.gemm(C::new(-1.0, 0.0), Op::NoTrans, &v, Op::NoTrans, &tvhr, C::new(1.0, 0.0), &mut r);

        for j in 0..3 {
            for i in 0..4 {
                assert_relative_eq!(r.get(i, j).re, a.get(i, j).re, epsilon = 1e-12);
                assert_relative_eq!(r.get(i, j).im, a.get(i, j).im, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_nrm2_no_overflow() {
        let x = [1e300f64, 1e300];
        assert_relative_eq!(nrm2(&x), 1e300 * 2f64.sqrt(), max_relative = 1e-14);
        assert_eq!(nrm2::<f64>(&[]), 0.0);
    }
}
