use std::fmt::{Display, Formatter};

/// 16-bit message correlation id. ACK and RST packets echo the id of the packet they confirm
///  or reject, and recently seen ids index the dedup window - so ids are opaque except for
///  the allocator's wrap-around.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MessageId(u16);

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MessageId {
    pub const ZERO: MessageId = MessageId(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    /// the successor id, wrapping from 0xFFFF back to 0
    pub fn next(&self) -> MessageId {
        MessageId(self.0.wrapping_add(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 1)]
    #[case::mid_range(0x1234, 0x1235)]
    #[case::below_max(0xfffe, 0xffff)]
    #[case::wrap_around(0xffff, 0)]
    fn test_next(#[case] raw: u16, #[case] expected: u16) {
        assert_eq!(MessageId::from_raw(raw).next(), MessageId::from_raw(expected));
    }

    #[rstest]
    fn test_raw_roundtrip() {
        for raw in [0u16, 1, 0x8000, u16::MAX] {
            assert_eq!(MessageId::from_raw(raw).to_raw(), raw);
        }
    }
}
