// THEORY:
// The `numeric` module decides what a histogram cell *is*: floating-point
// probability mass, or Q16 fixed-point counts for a core without an FPU.
// Rather than forking every algorithm, a single `Numeric` trait captures the
// handful of operations the rest of the system needs:
//
// 1.  **Seeding**: every cell starts strictly positive so a later ratio never
//     divides by zero.
// 2.  **Accumulation**: adding one unit of probability mass to a bin, or the
//     fraction of a unit that a kernel-weighted pixel contributes.
// 3.  **Ratio**: `model / candidate`, always delivered as `f32` because the
//     weight field is floating point regardless of how the histograms are
//     stored.
//
// Host and accelerator are instantiated with the same backend, which is what
// keeps the offload split from changing the answer.

use std::fmt::Debug;

/// A histogram cell representation.
pub trait Numeric: Copy + Debug + PartialEq + Send + Sync + 'static {
    /// Short backend name used in log lines.
    const NAME: &'static str;

    /// The strictly positive starting value of every cell.
    fn seed() -> Self;

    /// One unit of probability mass.
    fn unit() -> Self;

    /// A fraction of a unit, rounded to the nearest representable value.
    fn from_f64(value: f64) -> Self;

    fn accumulate(self, other: Self) -> Self;

    fn is_positive(self) -> bool;

    fn to_f32(self) -> f32;

    /// `model / candidate` as a float, or `None` when the candidate cannot be
    /// used as a divisor.
    fn ratio(model: Self, candidate: Self) -> Option<f32>;
}

impl Numeric for f32 {
    const NAME: &'static str = "f32";

    fn seed() -> Self {
        1e-10
    }

    fn unit() -> Self {
        1.0
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn accumulate(self, other: Self) -> Self {
        self + other
    }

    fn is_positive(self) -> bool {
        self > 0.0
    }

    fn to_f32(self) -> f32 {
        self
    }

    fn ratio(model: Self, candidate: Self) -> Option<f32> {
        if candidate > 0.0 && candidate.is_finite() {
            Some(model / candidate)
        } else {
            None
        }
    }
}

/// Signed Q16 fixed-point number: 16 integer bits, 16 fractional bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Q16(i32);

impl Q16 {
    pub const FRAC_BITS: u32 = 16;
    pub const ONE: Q16 = Q16(1 << Self::FRAC_BITS);
    /// Smallest strictly positive value.
    pub const EPSILON: Q16 = Q16(1);

    pub const fn from_raw(raw: i32) -> Self {
        Q16(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub fn from_int(value: i16) -> Self {
        Q16((value as i32) << Self::FRAC_BITS)
    }

    pub fn to_f32(self) -> f32 {
        self.0 as f32 / (1u32 << Self::FRAC_BITS) as f32
    }

    pub fn saturating_add(self, other: Q16) -> Q16 {
        Q16(self.0.saturating_add(other.0))
    }

    /// Rounded fixed-point division, saturated to the representable range.
    /// Returns `None` for a zero divisor.
    pub fn checked_div(self, divisor: Q16) -> Option<Q16> {
        if divisor.0 == 0 {
            return None;
        }
        let numerator = ((self.0 as i64) << Self::FRAC_BITS) + (divisor.0 as i64) / 2;
        let quotient = numerator / divisor.0 as i64;
        Some(Q16(quotient.clamp(i32::MIN as i64, i32::MAX as i64) as i32))
    }
}

impl Numeric for Q16 {
    const NAME: &'static str = "q16";

    fn seed() -> Self {
        Q16::EPSILON
    }

    fn unit() -> Self {
        Q16::ONE
    }

    fn from_f64(value: f64) -> Self {
        // `as` saturates out-of-range values.
        Q16((value * Q16::ONE.0 as f64).round() as i32)
    }

    fn accumulate(self, other: Self) -> Self {
        self.saturating_add(other)
    }

    fn is_positive(self) -> bool {
        self.0 > 0
    }

    fn to_f32(self) -> f32 {
        Q16::to_f32(self)
    }

    fn ratio(model: Self, candidate: Self) -> Option<f32> {
        if candidate.0 <= 0 {
            return None;
        }
        model.checked_div(candidate).map(Q16::to_f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn q16_one_round_trips_through_float() {
        assert_eq!(Q16::ONE.to_f32(), 1.0);
        assert_eq!(Q16::from_int(3).raw(), 3 << 16);
        assert_eq!(Q16::from_int(-2).to_f32(), -2.0);
    }

    #[test]
    fn q16_division_rounds_to_nearest() {
        let one = Q16::ONE;
        let three = Q16::from_int(3);
        // 1/3 = 21845.33 in Q16, rounds down.
        assert_eq!(one.checked_div(three), Some(Q16::from_raw(21845)));
        // 2/3 = 43690.67 in Q16, rounds up.
        assert_eq!(Q16::from_int(2).checked_div(three), Some(Q16::from_raw(43691)));
    }

    #[test]
    fn q16_division_saturates_instead_of_wrapping() {
        let model = Q16::ONE.saturating_add(Q16::EPSILON);
        let quotient = model.checked_div(Q16::EPSILON).unwrap();
        assert_eq!(quotient.raw(), i32::MAX);
    }

    #[test]
    fn q16_zero_divisor_is_rejected() {
        assert_eq!(Q16::ONE.checked_div(Q16::default()), None);
        assert_eq!(<Q16 as Numeric>::ratio(Q16::ONE, Q16::default()), None);
    }

    #[test]
    fn seeded_equal_cells_give_unit_ratio() {
        let seeded = <Q16 as Numeric>::seed();
        let bumped = seeded.accumulate(<Q16 as Numeric>::unit());
        assert_eq!(<Q16 as Numeric>::ratio(seeded, seeded), Some(1.0));
        assert_eq!(<Q16 as Numeric>::ratio(bumped, bumped), Some(1.0));

        let seeded = <f32 as Numeric>::seed();
        let bumped = seeded.accumulate(1.0);
        assert_eq!(<f32 as Numeric>::ratio(seeded, seeded), Some(1.0));
        assert_eq!(<f32 as Numeric>::ratio(bumped, bumped), Some(1.0));
    }

    #[test]
    fn fractional_mass_rounds_to_nearest_q16() {
        assert_eq!(<Q16 as Numeric>::from_f64(1.0), Q16::ONE);
        assert_eq!(<Q16 as Numeric>::from_f64(0.25).raw(), 1 << 14);
        // 1e-5 * 65536 = 0.655..., rounds up to one raw unit.
        assert_eq!(<Q16 as Numeric>::from_f64(1e-5), Q16::EPSILON);
        assert_eq!(<Q16 as Numeric>::from_f64(1e12).raw(), i32::MAX);
    }

    #[test]
    fn float_ratio_guards_non_positive_candidate() {
        assert_eq!(<f32 as Numeric>::ratio(1.0, 0.0), None);
        assert_eq!(<f32 as Numeric>::ratio(1.0, -1.0), None);
        assert_eq!(<f32 as Numeric>::ratio(1.0, f32::NAN), None);
    }
}
