//! 17.14 fixed-point arithmetic for the MLFQ scheduler's `recent_cpu` and `load_avg`.

const FRACTION_BITS: i64 = 14;
const FRACTION: i64 = 1 << FRACTION_BITS;

/// A signed 17.14 fixed-point number stored as a raw `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed(i64);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);

    pub fn from_int(n: i64) -> Self {
        Fixed(n * FRACTION)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    /// Truncate toward zero.
    pub fn to_int_trunc(self) -> i64 {
        self.0 / FRACTION
    }

    /// Round to nearest integer, ties away from zero (round-half-to-even away
    /// from zero per the scheduler's reporting convention: `(x + FRACTION/2) / FRACTION`
    /// for non-negative `x`, mirrored for negative `x`).
    pub fn to_int_round(self) -> i64 {
        if self.0 >= 0 {
            (self.0 + FRACTION / 2) / FRACTION
        } else {
            (self.0 - FRACTION / 2) / FRACTION
        }
    }

    pub fn add(self, other: Fixed) -> Fixed {
        Fixed(self.0 + other.0)
    }

    pub fn sub(self, other: Fixed) -> Fixed {
        Fixed(self.0 - other.0)
    }

    pub fn add_int(self, n: i64) -> Fixed {
        Fixed(self.0 + n * FRACTION)
    }

    pub fn sub_int(self, n: i64) -> Fixed {
        Fixed(self.0 - n * FRACTION)
    }

    pub fn mul(self, other: Fixed) -> Fixed {
        Fixed(((self.0 as i128 * other.0 as i128) / FRACTION as i128) as i64)
    }

    pub fn mul_int(self, n: i64) -> Fixed {
        Fixed(self.0 * n)
    }

    pub fn div(self, other: Fixed) -> Fixed {
        Fixed(((self.0 as i128 * FRACTION as i128) / other.0 as i128) as i64)
    }

    pub fn div_int(self, n: i64) -> Fixed {
        Fixed(self.0 / n)
    }

    /// Convert to a "times 100" integer, as reported by `get_load_avg`/`get_recent_cpu`.
    pub fn to_percent_round(self) -> i64 {
        self.mul_int(100).to_int_round()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_round_trip() {
        assert_eq!(Fixed::from_int(5).to_int_trunc(), 5);
        assert_eq!(Fixed::from_int(-5).to_int_trunc(), -5);
    }

    #[test]
    fn rounding_half_away_from_zero() {
        // 5/2 = 2.5 -> rounds to 3 (away from zero)
        let half = Fixed::from_int(5).div_int(2);
        assert_eq!(half.to_int_round(), 3);
        let neg_half = Fixed::from_int(-5).div_int(2);
        assert_eq!(neg_half.to_int_round(), -3);
    }

    #[test]
    fn mul_div_inverse() {
        let a = Fixed::from_int(7);
        let b = Fixed::from_int(3);
        let product = a.mul(b);
        assert_eq!(product.to_int_trunc(), 21);
        let quotient = product.div(b);
        assert_eq!(quotient.to_int_round(), 7);
    }

    #[test]
    fn negative_nice_in_recent_cpu_formula() {
        // recent_cpu' = (2*load)/(2*load+1) * recent_cpu + nice, with load_avg == 0
        // collapses the coefficient to 0, so the new value is exactly `nice`.
        let load = Fixed::ZERO;
        let recent_cpu = Fixed::from_int(10);
        let coeff = load.mul_int(2).div(load.mul_int(2).add_int(1));
        let updated = coeff.mul(recent_cpu).add_int(-5);
        assert_eq!(updated.to_int_round(), -5);
    }

    #[test]
    fn percent_reporting() {
        let x = Fixed::from_int(1).div_int(2); // 0.5
        assert_eq!(x.to_percent_round(), 50);
    }
}
