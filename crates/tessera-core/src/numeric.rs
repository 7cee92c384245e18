//! Scalar trait hierarchy for real and complex tiled arithmetic
//!
//! The kernels are written once against [`Scalar`] and instantiated for
//! single and double precision, real and complex. Every scalar is
//! `bytemuck::Pod` so tiles can be shipped between ranks as plain bytes.
//!
//! # Design Philosophy
//!
//! - **Pure type constraints**: no computation lives here, only the
//!   operations every kernel needs (modulus, conjugation, real part)
//! - **Associated real type**: norms and pivot thresholds are always real,
//!   even for complex matrices

use bytemuck::Pod;
use num_complex::Complex;
use num_traits::{Float, One, Zero};
use std::fmt::Debug;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

/// Element type of a tile
pub trait Scalar:
    Pod
    + Debug
    + PartialEq
    + Send
    + Sync
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + 'static
{
    /// Real counterpart (`Self` for real types)
    type Real: RealScalar;

    /// Whether the type carries an imaginary part
    const IS_COMPLEX: bool;

    /// Short name used in logs and benchmark ids
    const TYPE_NAME: &'static str;

    /// Modulus `|x|`
    fn abs_val(self) -> Self::Real;

    /// Squared modulus `|x|²`
    fn abs_sqr(self) -> Self::Real;

    /// Real part
    fn real(self) -> Self::Real;

    /// Imaginary part (zero for real types)
    fn imag(self) -> Self::Real;

    /// Complex conjugate (identity for real types)
    fn conj(self) -> Self;

    /// Embed a real value
    fn from_real(re: Self::Real) -> Self;

    /// Build from parts; `im` is ignored for real types
    fn from_parts(re: Self::Real, im: Self::Real) -> Self;

    /// Lossy conversion used by generators and tests
    fn from_f64(x: f64) -> Self;

    /// Whether either part is NaN
    fn is_nan_val(self) -> bool;

    /// Multiply by a real factor
    #[inline]
    fn scale_by(self, s: Self::Real) -> Self {
        self * Self::from_real(s)
    }
}

/// Real scalar used for norms, thresholds and Householder scalars
pub trait RealScalar: Scalar<Real = Self> + Float + Sum + Default {}

macro_rules! impl_real_scalar {
    ($t:ty, $name:expr) => {
        impl Scalar for $t {
            type Real = $t;
            const IS_COMPLEX: bool = false;
            const TYPE_NAME: &'static str = $name;

            #[inline]
            fn abs_val(self) -> $t {
                self.abs()
            }

            #[inline]
            fn abs_sqr(self) -> $t {
                self * self
            }

            #[inline]
            fn real(self) -> $t {
                self
            }

            #[inline]
            fn imag(self) -> $t {
                0.0
            }

            #[inline]
            fn conj(self) -> $t {
                self
            }

            #[inline]
            fn from_real(re: $t) -> $t {
                re
            }

            #[inline]
            fn from_parts(re: $t, _im: $t) -> $t {
                re
            }

            #[inline]
            fn from_f64(x: f64) -> $t {
                x as $t
            }

            #[inline]
            fn is_nan_val(self) -> bool {
                self.is_nan()
            }
        }

        impl RealScalar for $t {}
    };
}

impl_real_scalar!(f32, "f32");
impl_real_scalar!(f64, "f64");

macro_rules! impl_complex_scalar {
    ($t:ty, $name:expr) => {
        impl Scalar for Complex<$t> {
            type Real = $t;
            const IS_COMPLEX: bool = true;
            const TYPE_NAME: &'static str = $name;

            #[inline]
            fn abs_val(self) -> $t {
                self.re.hypot(self.im)
            }

            #[inline]
            fn abs_sqr(self) -> $t {
                self.re * self.re + self.im * self.im
            }

            #[inline]
            fn real(self) -> $t {
                self.re
            }

            #[inline]
            fn imag(self) -> $t {
                self.im
            }

            #[inline]
            fn conj(self) -> Self {
                Complex::new(self.re, -self.im)
            }

            #[inline]
            fn from_real(re: $t) -> Self {
                Complex::new(re, 0.0)
            }

            #[inline]
            fn from_parts(re: $t, im: $t) -> Self {
                Complex::new(re, im)
            }

            #[inline]
            fn from_f64(x: f64) -> Self {
                Complex::new(x as $t, 0.0)
            }

            #[inline]
            fn is_nan_val(self) -> bool {
                self.re.is_nan() || self.im.is_nan()
            }
        }
    };
}

impl_complex_scalar!(f32, "c32");
impl_complex_scalar!(f64, "c64");

/// NaN-preserving maximum: NaN in either argument wins
#[inline]
pub fn max_nan<R: RealScalar>(x: R, y: R) -> R {
    if y.is_nan() || y > x {
        y
    } else {
        x
    }
}

/// Machine epsilon of the real type
#[inline]
pub fn epsilon<T: Scalar>() -> T::Real {
    <T::Real as Float>::epsilon()
}

/// `|x| == 0` test that treats NaN as nonzero
#[inline]
pub fn is_exact_zero<T: Scalar>(x: T) -> bool {
    x == T::zero()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    type C64 = Complex<f64>;

    #[test]
    fn test_real_scalar_ops() {
        assert_eq!((-3.0f64).abs_val(), 3.0);
        assert_eq!(2.0f32.conj(), 2.0);
        assert_eq!(f64::from_parts(1.5, 9.0), 1.5);
        assert!(!f64::IS_COMPLEX);
        assert!(f64::NAN.is_nan_val());
    }

    #[test]
    fn test_complex_scalar_ops() {
        let z = C64::new(3.0, -4.0);
        assert_relative_eq!(z.abs_val(), 5.0);
        assert_relative_eq!(z.abs_sqr(), 25.0);
        assert_eq!(Scalar::conj(z), C64::new(3.0, 4.0));
        assert_eq!(z.real(), 3.0);
        assert_eq!(z.imag(), -4.0);
        assert_eq!(z.scale_by(2.0), C64::new(6.0, -8.0));
        assert!(C64::new(0.0, f64::NAN).is_nan_val());
        assert!(C64::IS_COMPLEX);
    }

    #[test]
    fn test_max_nan() {
        assert_eq!(max_nan(1.0, 2.0), 2.0);
        assert_eq!(max_nan(2.0, 1.0), 2.0);
        assert!(max_nan(f64::NAN, 1.0).is_nan());
        assert!(max_nan(1.0, f64::NAN).is_nan());
    }

    #[test]
    fn test_complex_is_pod() {
        let data = [C64::new(1.0, 2.0), C64::new(3.0, 4.0)];
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        assert_eq!(bytes.len(), 32);
        let back: Vec<C64> = bytemuck::pod_collect_to_vec(bytes);
        assert_eq!(back, data);
    }
}
