//! Scalar kinds the solver is instantiated for.
//!
//! Real and complex, single and double precision share one generic code path;
//! `Scalar` carries the handful of operations the kernels need beyond
//! ordinary arithmetic, plus the wire encoding used by the collectives.

use num_complex::{Complex32, Complex64};
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Precision/kind of a scalar instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    RealSingle,
    RealDouble,
    ComplexSingle,
    ComplexDouble,
}

impl ScalarKind {
    pub fn is_complex(self) -> bool {
        matches!(self, ScalarKind::ComplexSingle | ScalarKind::ComplexDouble)
    }
}

/// Trait bounds needed for factorization and solve arithmetic.
pub trait Scalar:
    Copy
    + Default
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + PartialEq
    + AddAssign
    + SubAssign
    + std::fmt::Debug
    + 'static
{
    const KIND: ScalarKind;
    /// Number of `f64` words one value occupies on the wire.
    const PARTS: usize;

    fn zero() -> Self;
    fn one() -> Self;
    fn abs_val(self) -> f64;
    fn conj(self) -> Self;
    fn from_real(value: f64) -> Self;
    fn real_part(self) -> f64;
    /// Unit roundoff of the underlying precision.
    fn epsilon() -> f64;
    fn is_finite_val(self) -> bool;
    fn write_parts(self, out: &mut Vec<f64>);
    fn read_parts(parts: &[f64]) -> Self;
}

impl Scalar for f64 {
    const KIND: ScalarKind = ScalarKind::RealDouble;
    const PARTS: usize = 1;

    fn zero() -> Self {
        0.0
    }
    fn one() -> Self {
        1.0
    }
    fn abs_val(self) -> f64 {
        self.abs()
    }
    fn conj(self) -> Self {
        self
    }
    fn from_real(value: f64) -> Self {
        value
    }
    fn real_part(self) -> f64 {
        self
    }
    fn epsilon() -> f64 {
        f64::EPSILON
    }
    fn is_finite_val(self) -> bool {
        self.is_finite()
    }
    fn write_parts(self, out: &mut Vec<f64>) {
        out.push(self);
    }
    fn read_parts(parts: &[f64]) -> Self {
        parts[0]
    }
}

impl Scalar for f32 {
    const KIND: ScalarKind = ScalarKind::RealSingle;
    const PARTS: usize = 1;

    fn zero() -> Self {
        0.0
    }
    fn one() -> Self {
        1.0
    }
    fn abs_val(self) -> f64 {
        self.abs() as f64
    }
    fn conj(self) -> Self {
        self
    }
    fn from_real(value: f64) -> Self {
        value as f32
    }
    fn real_part(self) -> f64 {
        self as f64
    }
    fn epsilon() -> f64 {
        f32::EPSILON as f64
    }
    fn is_finite_val(self) -> bool {
        self.is_finite()
    }
    fn write_parts(self, out: &mut Vec<f64>) {
        out.push(self as f64);
    }
    fn read_parts(parts: &[f64]) -> Self {
        parts[0] as f32
    }
}

impl Scalar for Complex64 {
    const KIND: ScalarKind = ScalarKind::ComplexDouble;
    const PARTS: usize = 2;

    fn zero() -> Self {
        Complex64::new(0.0, 0.0)
    }
    fn one() -> Self {
        Complex64::new(1.0, 0.0)
    }
    fn abs_val(self) -> f64 {
        self.norm()
    }
    fn conj(self) -> Self {
        Complex64::conj(&self)
    }
    fn from_real(value: f64) -> Self {
        Complex64::new(value, 0.0)
    }
    fn real_part(self) -> f64 {
        self.re
    }
    fn epsilon() -> f64 {
        f64::EPSILON
    }
    fn is_finite_val(self) -> bool {
        self.re.is_finite() && self.im.is_finite()
    }
    fn write_parts(self, out: &mut Vec<f64>) {
        out.push(self.re);
        out.push(self.im);
    }
    fn read_parts(parts: &[f64]) -> Self {
        Complex64::new(parts[0], parts[1])
    }
}

impl Scalar for Complex32 {
    const KIND: ScalarKind = ScalarKind::ComplexSingle;
    const PARTS: usize = 2;

    fn zero() -> Self {
        Complex32::new(0.0, 0.0)
    }
    fn one() -> Self {
        Complex32::new(1.0, 0.0)
    }
    fn abs_val(self) -> f64 {
        self.norm() as f64
    }
    fn conj(self) -> Self {
        Complex32::conj(&self)
    }
    fn from_real(value: f64) -> Self {
        Complex32::new(value as f32, 0.0)
    }
    fn real_part(self) -> f64 {
        self.re as f64
    }
    fn epsilon() -> f64 {
        f32::EPSILON as f64
    }
    fn is_finite_val(self) -> bool {
        self.re.is_finite() && self.im.is_finite()
    }
    fn write_parts(self, out: &mut Vec<f64>) {
        out.push(self.re as f64);
        out.push(self.im as f64);
    }
    fn read_parts(parts: &[f64]) -> Self {
        Complex32::new(parts[0] as f32, parts[1] as f32)
    }
}

/// Encode a slice of scalars into `f64` words for a collective.
pub fn encode_values<T: Scalar>(values: &[T], out: &mut Vec<f64>) {
    out.reserve(values.len() * T::PARTS);
    for &v in values {
        v.write_parts(out);
    }
}

/// Decode `count` scalars from `words`, returning them and the words consumed.
pub fn decode_values<T: Scalar>(words: &[f64], count: usize) -> Option<(Vec<T>, usize)> {
    let needed = count * T::PARTS;
    if words.len() < needed {
        return None;
    }
    let values = words[..needed]
        .chunks_exact(T::PARTS)
        .map(T::read_parts)
        .collect();
    Some((values, needed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complex_wire_encoding_keeps_both_parts() {
        let values = vec![Complex64::new(1.5, -2.0), Complex64::new(0.0, 3.25)];
        let mut words = Vec::new();
        encode_values(&values, &mut words);
        assert_eq!(words, vec![1.5, -2.0, 0.0, 3.25]);
        let (back, used) = decode_values::<Complex64>(&words, 2).unwrap();
        assert_eq!(used, 4);
        assert_eq!(back, values);
    }

    #[test]
    fn decode_rejects_short_payload() {
        assert!(decode_values::<Complex32>(&[1.0, 2.0, 3.0], 2).is_none());
    }

    #[test]
    fn conj_is_identity_for_reals() {
        assert_eq!(Scalar::conj(-3.0f64), -3.0);
        assert_eq!(Scalar::conj(Complex32::new(1.0, 2.0)), Complex32::new(1.0, -2.0));
        assert!(ScalarKind::ComplexDouble.is_complex());
        assert!(!<f32 as Scalar>::KIND.is_complex());
    }
}
