use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Number of fractional bits.
const FRAC_BITS: u32 = 14;

/// Scale factor: 2^14.
const F: i32 = 1 << FRAC_BITS;

/// A signed Q17.14 fixed-point number.
///
/// The scheduler's load average and per-thread recent-CPU figures are
/// real numbers, but the kernel has no floating point. All of that
/// arithmetic is done on `Fixed` instead: the low 14 bits of an `i32`
/// hold the fraction. Intermediate products of two `Fixed` values are
/// widened to 64 bits so they cannot overflow for operands within
/// [-2^29, 2^29].
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fixed(i32);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);

    /// Converts an integer to fixed point.
    pub const fn from_int(n: i32) -> Fixed {
        Fixed(n * F)
    }

    /// Converts to an integer, rounding toward zero.
    pub const fn trunc(self) -> i32 {
        self.0 / F
    }

    /// Converts to an integer, rounding to nearest.
    /// Halves round away from zero for both signs.
    pub const fn round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
    }

    /// Multiplies two fixed-point values, widening through 64 bits.
    pub fn mul(self, other: Fixed) -> Fixed {
        Fixed((self.0 as i64 * other.0 as i64 / F as i64) as i32)
    }

    /// Divides by another fixed-point value, widening through 64 bits.
    pub fn div(self, other: Fixed) -> Fixed {
        Fixed((self.0 as i64 * F as i64 / other.0 as i64) as i32)
    }

    /// Multiplies by a plain integer. No widening is needed.
    pub const fn mul_int(self, n: i32) -> Fixed {
        Fixed(self.0 * n)
    }

    /// Divides by a plain integer. No widening is needed.
    pub const fn div_int(self, n: i32) -> Fixed {
        Fixed(self.0 / n)
    }

    /// Adds a plain integer.
    pub const fn add_int(self, n: i32) -> Fixed {
        Fixed(self.0 + n * F)
    }

    /// Subtracts a plain integer.
    pub const fn sub_int(self, n: i32) -> Fixed {
        Fixed(self.0 - n * F)
    }
}

impl Add for Fixed {
    type Output = Fixed;
    fn add(self, other: Fixed) -> Fixed {
        Fixed(self.0 + other.0)
    }
}

impl AddAssign for Fixed {
    fn add_assign(&mut self, other: Fixed) {
        self.0 += other.0;
    }
}

impl Sub for Fixed {
    type Output = Fixed;
    fn sub(self, other: Fixed) -> Fixed {
        Fixed(self.0 - other.0)
    }
}

impl fmt::Debug for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Two decimal places is plenty for log output.
        let hundredths = (self.0 as i64 * 100 / F as i64) as i32;
        write!(f, "{}.{:02}", hundredths / 100, (hundredths % 100).abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_round_trip() {
        assert_eq!(Fixed::from_int(17).trunc(), 17);
        assert_eq!(Fixed::from_int(-17).trunc(), -17);
        assert_eq!(Fixed::from_int(0).trunc(), 0);
    }

    #[test]
    fn truncation_goes_toward_zero() {
        let x = Fixed::from_int(7).div_int(2); // 3.5
        assert_eq!(x.trunc(), 3);
        let y = Fixed::from_int(-7).div_int(2); // -3.5
        assert_eq!(y.trunc(), -3);
    }

    #[test]
    fn rounding_halves_away_from_zero() {
        assert_eq!(Fixed::from_int(7).div_int(2).round(), 4); // 3.5
        assert_eq!(Fixed::from_int(-7).div_int(2).round(), -4); // -3.5
        assert_eq!(Fixed::from_int(10).div_int(4).round(), 3); // 2.5
        assert_eq!(Fixed::from_int(9).div_int(4).round(), 2); // 2.25
    }

    #[test]
    fn add_sub() {
        let a = Fixed::from_int(5);
        let b = Fixed::from_int(3);
        assert_eq!((a + b).trunc(), 8);
        assert_eq!((a - b).trunc(), 2);
        assert_eq!(a.add_int(2).trunc(), 7);
        assert_eq!(a.sub_int(2).trunc(), 3);
    }

    #[test]
    fn widening_multiply() {
        // 3/2 * 3/2 = 9/4
        let x = Fixed::from_int(3).div_int(2);
        assert_eq!(x.mul(x), Fixed::from_int(9).div_int(4));
        // Values near the documented operand bound must not wrap.
        let big = Fixed::from_int(20_000);
        assert_eq!(big.mul(Fixed::from_int(2)).trunc(), 40_000);
    }

    #[test]
    fn widening_divide() {
        let x = Fixed::from_int(1).div(Fixed::from_int(3));
        assert_eq!(x.mul_int(3).round(), 1);
        assert_eq!(Fixed::from_int(-9).div(Fixed::from_int(3)).trunc(), -3);
    }

    #[test]
    fn load_avg_style_expression() {
        // (59/60) * 1.0 + (1/60) * 2 computed the way the scheduler does.
        let coeff = Fixed::from_int(59).div_int(60);
        let term = Fixed::from_int(2).div_int(60);
        let result = coeff.mul(Fixed::from_int(1)) + term;
        // 59/60 + 2/60 = 61/60 ~ 1.016
        assert_eq!(result.round(), 1);
        assert_eq!(result.mul_int(100).round(), 102);
    }
}
