use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};

/// A 16-bit uTP sequence number. Arithmetic wraps around, and ordering is only defined within
///  half the number space, so this type deliberately does not implement `Ord`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNr(u16);

impl Display for SeqNr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNr {
    pub const fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SeqNr {
        SeqNr(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> SeqNr {
        SeqNr(self.0.wrapping_sub(1))
    }

    /// `self < other` modulo 2^16, treating the half of the number space 'below' `other` as
    ///  smaller
    pub fn is_before(&self, other: SeqNr) -> bool {
        let a = self.0;
        let b = other.0;
        if b < 0x8000 {
            a < b || a >= b.wrapping_sub(0x8000)
        }
        else {
            a < b && a >= b - 0x8000
        }
    }
}

impl Add<u16> for SeqNr {
    type Output = SeqNr;

    fn add(self, rhs: u16) -> SeqNr {
        SeqNr(self.0.wrapping_add(rhs))
    }
}

impl Sub<u16> for SeqNr {
    type Output = SeqNr;

    fn sub(self, rhs: u16) -> SeqNr {
        SeqNr(self.0.wrapping_sub(rhs))
    }
}

/// distance from `rhs` forward to `self`, modulo 2^16
impl Sub<SeqNr> for SeqNr {
    type Output = u16;

    fn sub(self, rhs: SeqNr) -> u16 {
        self.0.wrapping_sub(rhs.0)
    }
}
