//! 24-bit unsigned integer carried by the Observe option, with the serial-number arithmetic
//! RFC 7641 uses to order notifications.

use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub struct u24(u32);

/// Half of the 24-bit sequence space, see
/// [RFC 7641 §3.4](https://datatracker.ietf.org/doc/html/rfc7641#section-3.4).
const HALF_RANGE: u32 = 1 << 23;

impl u24 {
    pub const MIN: u24 = u24(0);
    pub const MAX: u24 = u24(0xffffff);
    pub const BITS: u32 = 24;

    pub fn wrapping_add(self, rhs: Self) -> Self {
        u24(self.0.wrapping_add(rhs.0) & Self::MAX.0)
    }

    pub fn wrapping_sub(self, rhs: Self) -> Self {
        u24(self.0.wrapping_sub(rhs.0) & Self::MAX.0)
    }

    /// Compares two sequence numbers in the circular 24-bit space.  `Less` means `self` was
    /// issued before `other`.  Values exactly half the space apart are treated as `Less` so
    /// that a notification can never be fresher than its mirror image in both directions.
    pub fn serial_cmp(self, other: Self) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }
        let forward = other.wrapping_sub(self).0;
        if forward > 0 && forward <= HALF_RANGE {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    pub fn is_fresher_than(self, other: Self) -> bool {
        self.serial_cmp(other) == Ordering::Greater
    }
}

impl Display for u24 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for u24 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl From<u8> for u24 {
    fn from(value: u8) -> Self {
        u24(u32::from(value))
    }
}

impl From<u16> for u24 {
    fn from(value: u16) -> Self {
        u24(u32::from(value))
    }
}

impl TryFrom<u32> for u24 {
    type Error = TryFromCustomIntError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value > u24::MAX.0 {
            Err(TryFromCustomIntError)
        } else {
            Ok(u24(value))
        }
    }
}

impl From<u24> for u32 {
    fn from(value: u24) -> Self {
        value.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TryFromCustomIntError;

impl Display for TryFromCustomIntError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("out of range integral type conversion attempted")
    }
}

impl std::error::Error for TryFromCustomIntError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(value: u32) -> u24 {
        u24::try_from(value).unwrap()
    }

    #[test]
    fn test_wrapping_add() {
        let x = u24::MAX;
        let y = x.wrapping_add(u24::from(1u8));
        assert_eq!(y, u24::MIN);
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(u24::try_from(0x1000000u32), Err(TryFromCustomIntError));
    }

    #[test]
    fn test_serial_order() {
        assert!(n(5).is_fresher_than(n(3)));
        assert!(!n(1).is_fresher_than(n(3)));
        assert!(!n(3).is_fresher_than(n(3)));
    }

    #[test]
    fn test_serial_order_rollover() {
        assert!(n(2).is_fresher_than(u24::MAX));
        assert!(!u24::MAX.is_fresher_than(n(2)));
        assert!(n(HALF_RANGE - 1).is_fresher_than(n(0)));
        assert!(!n(HALF_RANGE + 1).is_fresher_than(n(0)));
    }
}
