use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};

/// A 16 bit packet sequence number with wrap-around semantics.
///
/// Sequence numbers have no total order: two numbers are compared by their signed distance,
///  which is meaningful as long as they are less than half the number space apart. Windows and
///  ack bitfields are tiny compared to that, so the assumption always holds for numbers that are
///  compared in practice.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SequenceNumber(u16);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    /// signed distance from `base` to `self`, i.e. positive if `self` comes after `base`
    pub fn offset_from(&self, base: SequenceNumber) -> i16 {
        self.0.wrapping_sub(base.0) as i16
    }

    pub fn is_after(&self, other: SequenceNumber) -> bool {
        self.offset_from(other) > 0
    }

    pub fn is_before(&self, other: SequenceNumber) -> bool {
        self.offset_from(other) < 0
    }

    /// iterates from `self` (inclusive) to `end` (exclusive), wrapping around if necessary
    pub fn to(&self, end: SequenceNumber) -> impl Iterator<Item = SequenceNumber> {
        let start = *self;
        (0..end.0.wrapping_sub(start.0))
            .map(move |offs| start + offs)
    }
}

impl Add<u16> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: u16) -> Self::Output {
        SequenceNumber(self.0.wrapping_add(rhs))
    }
}

/// The number of steps from `rhs` forward to `self`, modulo the sequence number space
impl Sub<SequenceNumber> for SequenceNumber {
    type Output = u16;

    fn sub(self, rhs: SequenceNumber) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::equal(5, 5, 0)]
    #[case::after(7, 5, 2)]
    #[case::before(3, 5, -2)]
    #[case::wrap_after(1, 65535, 2)]
    #[case::wrap_before(65535, 1, -2)]
    #[case::half(32767, 0, 32767)]
    fn test_offset_from(#[case] seq: u16, #[case] base: u16, #[case] expected: i16) {
        assert_eq!(SequenceNumber::from_raw(seq).offset_from(SequenceNumber::from_raw(base)), expected);
    }

    #[rstest]
    #[case::simple(5, 6, true)]
    #[case::equal(5, 5, false)]
    #[case::wrap(65535, 0, true)]
    #[case::wrap_reverse(0, 65535, false)]
    fn test_is_after(#[case] a: u16, #[case] b: u16, #[case] expected: bool) {
        assert_eq!(SequenceNumber::from_raw(b).is_after(SequenceNumber::from_raw(a)), expected);
        assert_eq!(SequenceNumber::from_raw(a).is_before(SequenceNumber::from_raw(b)), expected);
    }

    #[rstest]
    #[case::empty(3, 3, vec![])]
    #[case::simple(3, 6, vec![3, 4, 5])]
    #[case::wrapping(65534, 1, vec![65534, 65535, 0])]
    fn test_to(#[case] start: u16, #[case] end: u16, #[case] expected: Vec<u16>) {
        let actual = SequenceNumber::from_raw(start)
            .to(SequenceNumber::from_raw(end))
            .map(|s| s.to_raw())
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_next_wraps() {
        assert_eq!(SequenceNumber::from_raw(u16::MAX).next(), SequenceNumber::ZERO);
        assert_eq!(SequenceNumber::from_raw(2) - SequenceNumber::from_raw(u16::MAX), 3);
    }
}
