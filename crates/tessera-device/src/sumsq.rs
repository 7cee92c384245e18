//! Scaled sum of squares
//!
//! Frobenius norms are accumulated as a pair `(scale, sumsq)` with
//! `value = scale * sqrt(sumsq)`. Every magnitude is divided by the running
//! scale before squaring, so no intermediate overflows or underflows.

use tessera_core::RealScalar;

/// `(scale, sumsq)` accumulator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SumSq<R> {
    pub scale: R,
    pub sumsq: R,
}

impl<R: RealScalar> Default for SumSq<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RealScalar> SumSq<R> {
    /// Accumulator for a non-empty reduction: `(0, 1)`
    pub fn new() -> Self {
        Self {
            scale: R::zero(),
            sumsq: R::one(),
        }
    }

    /// Result of an empty reduction: `(0, 0)`
    pub fn empty() -> Self {
        Self {
            scale: R::zero(),
            sumsq: R::zero(),
        }
    }

    pub fn from_pair(pair: [R; 2]) -> Self {
        Self {
            scale: pair[0],
            sumsq: pair[1],
        }
    }

    pub fn to_pair(self) -> [R; 2] {
        [self.scale, self.sumsq]
    }

    /// Add one magnitude `x >= 0`
    #[inline]
    pub fn add(&mut self, x: R) {
        if x.is_nan() {
            self.scale = x;
            return;
        }
        if x == R::zero() {
            return;
        }
        if self.scale < x {
            let r = self.scale / x;
            self.sumsq = R::one() + self.sumsq * r * r;
            self.scale = x;
        } else {
            let r = x / self.scale;
            self.sumsq = self.sumsq + r * r;
        }
    }

    /// Double the accumulated sum, for mirrored off-diagonal entries
    #[inline]
    pub fn double(&mut self) {
        self.sumsq = self.sumsq + self.sumsq;
    }

    /// Fold `other` in; the larger scale is kept
    #[inline]
    pub fn merge(&mut self, other: SumSq<R>) {
        if self.scale > other.scale {
            let r = other.scale / self.scale;
            self.sumsq = self.sumsq + other.sumsq * r * r;
        } else if other.scale != R::zero() {
            let r = self.scale / other.scale;
            self.sumsq = self.sumsq * r * r + other.sumsq;
            self.scale = other.scale;
        }
    }

    /// `scale * sqrt(sumsq)`
    #[inline]
    pub fn value(&self) -> R {
        self.scale * self.sumsq.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_extreme_magnitudes() {
        let mut acc = SumSq::<f64>::new();
        acc.add(3e200);
        acc.add(4e200);
        assert_relative_eq!(acc.value(), 5e200, max_relative = 1e-15);

        let mut tiny = SumSq::<f32>::new();
        tiny.add(3e-30);
        tiny.add(4e-30);
        assert_relative_eq!(tiny.value(), 5e-30, max_relative = 1e-6);
    }

    #[test]
    fn test_empty_and_zero() {
        assert_eq!(SumSq::<f64>::empty().value(), 0.0);
        let mut acc = SumSq::<f64>::new();
        acc.add(0.0);
        assert_eq!(acc.value(), 0.0);
        let mut other = SumSq::new();
        other.merge(acc);
        assert_eq!(other.value(), 0.0);
    }

    #[test]
    fn test_merge_keeps_larger_scale() {
        let mut a = SumSq::<f64>::new();
        a.add(1.0);
        let mut b = SumSq::new();
        b.add(100.0);
        a.merge(b);
        assert_eq!(a.scale, 100.0);
        assert_relative_eq!(a.value(), 10001f64.sqrt(), max_relative = 1e-15);
    }

    #[test]
    fn test_nan_propagates() {
        let mut a = SumSq::<f64>::new();
        a.add(2.0);
        a.add(f64::NAN);
        a.add(1.0);
        assert!(a.value().is_nan());
        let mut b = SumSq::new();
        b.add(1.0);
        b.merge(a);
        assert!(b.value().is_nan());
    }

    #[test]
    fn test_double() {
        let mut a = SumSq::<f64>::new();
        a.add(3.0);
        a.double();
        assert_relative_eq!(a.value(), 18f64.sqrt(), max_relative = 1e-15);
    }
}
