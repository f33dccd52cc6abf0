use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::safe_converter::PrecheckedCast;

/// upper bound for an option value: 14 bytes in the length nibble, plus 0..=255 via the
///  extended length byte
pub const MAX_OPTION_LEN: usize = 270;
/// the serialized option count (including fenceposts) must fit the header's 4-bit field
pub const MAX_SERIALIZED_OPTION_COUNT: usize = 15;

/// the largest option number delta expressible in the delta nibble; larger gaps are bridged
///  with fencepost options
const MAX_DELTA: u16 = 14;
/// option numbers that are a multiple of this are reserved for (empty) fencepost options
const FENCEPOST_INTERVAL: u16 = 14;
/// length nibble value flagging an extended length byte; also the value that byte counts from
const EXTENDED_LENGTH_BASE: usize = 15;

/// Option numbers assigned by the protocol. Numbers not in this table travel through an
///  [OptionSet] as opaque (number, bytes) pairs so that intermediaries can pass them along.
#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum OptionNumber {
    ContentType = 1,
    MaxAge = 2,
    ProxyUri = 3,
    Etag = 4,
    UriHost = 5,
    LocationPath = 6,
    UriPort = 7,
    LocationQuery = 8,
    UriPath = 9,
    Observe = 10,
    Token = 11,
    Accept = 12,
    IfMatch = 13,
    UriQuery = 15,
    Block2 = 17,
    Block1 = 19,
    IfNoneMatch = 21,
}

impl OptionNumber {
    pub fn is_repeatable(&self) -> bool {
        matches!(
            self,
            OptionNumber::ProxyUri
                | OptionNumber::Etag
                | OptionNumber::LocationPath
                | OptionNumber::LocationQuery
                | OptionNumber::UriPath
                | OptionNumber::Accept
                | OptionNumber::IfMatch
                | OptionNumber::UriQuery
        )
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageOption {
    number: u16,
    value: Vec<u8>,
}

impl MessageOption {
    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// The ordered option sequence of a message.
///
/// Options are kept sorted ascending by option number at all times (options with the same
///  number keep their insertion order), so serialization is a single pass emitting deltas.
///  Fencepost options are an artifact of the delta encoding: they are inserted on the fly
///  when serializing and stripped when parsing, and never appear in the set itself.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct OptionSet {
    options: Vec<MessageOption>,
}

impl OptionSet {
    pub fn new() -> OptionSet {
        OptionSet { options: Vec::new() }
    }

    /// Add an option, keeping the set sorted. Fails for values over [MAX_OPTION_LEN] and for
    ///  repetitions of non-repeatable options.
    pub fn add(&mut self, number: OptionNumber, value: Vec<u8>) -> anyhow::Result<()> {
        if !number.is_repeatable() && self.get_first(number).is_some() {
            bail!("option {:?} must not be repeated", number);
        }
        self.add_raw(number.into(), value)
    }

    /// Add an option by raw number without repeatability checking. This is the pass-through
    ///  path for option numbers this implementation does not know about.
    pub fn add_raw(&mut self, number: u16, value: Vec<u8>) -> anyhow::Result<()> {
        if value.len() > MAX_OPTION_LEN {
            bail!("option {} value has {} bytes, the maximum is {}", number, value.len(), MAX_OPTION_LEN);
        }
        if number % FENCEPOST_INTERVAL == 0 {
            bail!("option number {} is reserved for fenceposts", number);
        }

        let idx = self.options.partition_point(|o| o.number <= number);
        self.options.insert(idx, MessageOption { number, value });
        Ok(())
    }

    /// Replace all occurrences of an option with a single value.
    pub fn set(&mut self, number: OptionNumber, value: Vec<u8>) -> anyhow::Result<()> {
        self.remove(number);
        self.add_raw(number.into(), value)
    }

    pub fn set_uint(&mut self, number: OptionNumber, value: u32) -> anyhow::Result<()> {
        self.set(number, encode_uint(value))
    }

    pub fn get_first(&self, number: OptionNumber) -> Option<&[u8]> {
        let raw: u16 = number.into();
        self.options.iter()
            .find(|o| o.number == raw)
            .map(|o| o.value.as_slice())
    }

    pub fn get_all(&self, number: OptionNumber) -> Vec<&[u8]> {
        let raw: u16 = number.into();
        self.options.iter()
            .filter(|o| o.number == raw)
            .map(|o| o.value.as_slice())
            .collect()
    }

    /// The decoded uint value of an option, or None if the option is absent. Fails for values
    ///  longer than four bytes.
    pub fn get_uint(&self, number: OptionNumber) -> anyhow::Result<Option<u32>> {
        match self.get_first(number) {
            Some(value) => Ok(Some(decode_uint(value)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&mut self, number: OptionNumber) {
        let raw: u16 = number.into();
        self.options.retain(|o| o.number != raw);
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageOption> {
        self.options.iter()
    }

    /// number of options in the set, not counting fenceposts
    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// The options as they go on the wire, with fenceposts inserted wherever the gap between
    ///  consecutive option numbers exceeds [MAX_DELTA].
    fn wire_options(&self) -> Vec<(u16, &[u8])> {
        const EMPTY: &[u8] = &[];

        let mut result = Vec::with_capacity(self.options.len());
        let mut prev = 0u16;
        for opt in &self.options {
            while opt.number - prev > MAX_DELTA {
                let fencepost = (prev / FENCEPOST_INTERVAL + 1) * FENCEPOST_INTERVAL;
                result.push((fencepost, EMPTY));
                prev = fencepost;
            }
            result.push((opt.number, opt.value.as_slice()));
            prev = opt.number;
        }
        result
    }

    /// the option count that goes into the header's 4-bit field, i.e. including fenceposts
    pub fn serialized_count(&self) -> usize {
        self.wire_options().len()
    }

    /// serialized size of the option sequence in bytes
    pub fn serialized_len(&self) -> usize {
        self.wire_options().iter()
            .map(|(_, value)| {
                if value.len() < EXTENDED_LENGTH_BASE {
                    1 + value.len()
                }
                else {
                    2 + value.len()
                }
            })
            .sum()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut prev = 0u16;
        for (number, value) in self.wire_options() {
            let delta: u8 = (number - prev).prechecked_cast();
            prev = number;

            if value.len() < EXTENDED_LENGTH_BASE {
                let len: u8 = value.len().prechecked_cast();
                buf.put_u8(delta << 4 | len);
            }
            else {
                let ext_len: u8 = (value.len() - EXTENDED_LENGTH_BASE).prechecked_cast();
                buf.put_u8(delta << 4 | 0x0f);
                buf.put_u8(ext_len);
            }
            buf.put_slice(value);
        }
    }

    /// Parse `option_count` options. Fenceposts are stripped; unknown option numbers are kept
    ///  verbatim. Option values running past the end of the buffer are a format error.
    pub fn deser(buf: &mut impl Buf, option_count: u8) -> anyhow::Result<OptionSet> {
        let mut options = Vec::with_capacity(option_count as usize);
        let mut prev = 0u16;

        for _ in 0..option_count {
            let first = buf.try_get_u8()?;
            let delta = (first >> 4) as u16;
            let mut len = (first & 0x0f) as usize;
            if len == EXTENDED_LENGTH_BASE {
                len = EXTENDED_LENGTH_BASE + buf.try_get_u8()? as usize;
            }

            let number = prev + delta;
            prev = number;

            if buf.remaining() < len {
                bail!("option {} declares a length of {} but only {} bytes remain", number, len, buf.remaining());
            }
            let mut value = vec![0u8; len];
            buf.copy_to_slice(&mut value);

            if number % FENCEPOST_INTERVAL == 0 && value.is_empty() {
                continue;
            }
            // NB: deltas are non-negative, so parsed options are sorted by construction
            options.push(MessageOption { number, value });
        }

        Ok(OptionSet { options })
    }
}

/// Minimal-length big-endian encoding of a uint option value; zero encodes to zero bytes.
pub(crate) fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[skip..].to_vec()
}

pub(crate) fn decode_uint(bytes: &[u8]) -> anyhow::Result<u32> {
    if bytes.len() > 4 {
        bail!("uint option value has {} bytes, at most 4 are supported", bytes.len());
    }
    let mut result = 0u32;
    for &b in bytes {
        result = result << 8 | b as u32;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn set_of(options: Vec<(u16, Vec<u8>)>) -> OptionSet {
        let mut result = OptionSet::new();
        for (number, value) in options {
            result.add_raw(number, value).unwrap();
        }
        result
    }

    #[rstest]
    #[case::empty(vec![], vec![], 0)]
    #[case::single_content_type(vec![(1, vec![0x29])], vec![0x11, 0x29], 1)]
    #[case::token(vec![(11, vec![0xab, 0xcd])], vec![0xb2, 0xab, 0xcd], 1)]
    #[case::two_options(vec![(1, vec![0x29]), (11, vec![0xab, 0xcd])], vec![0x11, 0x29, 0xa2, 0xab, 0xcd], 2)]
    #[case::repeated_uri_path(vec![(9, b"a".to_vec()), (9, b"bc".to_vec())], vec![0x91, 0x61, 0x02, 0x62, 0x63], 2)]
    #[case::zero_length_value(vec![(1, vec![])], vec![0x10], 1)]
    #[case::fencepost_before_block2(vec![(17, vec![0x12])], vec![0xe0, 0x31, 0x12], 2)]
    #[case::fencepost_before_uri_query(vec![(15, b"x".to_vec())], vec![0xe0, 0x11, 0x78], 2)]
    #[case::fencepost_before_if_none_match(vec![(21, vec![])], vec![0xe0, 0x70], 2)]
    #[case::two_fenceposts(vec![(30, vec![0x01])], vec![0xe0, 0xe0, 0x21, 0x01], 3)]
    #[case::fencepost_between(vec![(2, vec![0x3c]), (19, vec![0x08])], vec![0x21, 0x3c, 0xc0, 0x51, 0x08], 3)]
    #[case::extended_length(
        vec![(3, vec![0x61; 20])],
        {
            let mut expected = vec![0x3f, 0x05];
            expected.extend_from_slice(&[0x61; 20]);
            expected
        },
        1
    )]
    fn test_ser_deser(
        #[case] options: Vec<(u16, Vec<u8>)>,
        #[case] expected_buf: Vec<u8>,
        #[case] expected_count: usize,
    ) {
        let original = set_of(options);

        assert_eq!(original.serialized_count(), expected_count);
        assert_eq!(original.serialized_len(), expected_buf.len());

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected_buf.as_slice());

        let mut b: &[u8] = &buf;
        let deser = OptionSet::deser(&mut b, expected_count.try_into().unwrap()).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[rstest]
    fn test_deser_unknown_option_roundtrip() {
        // 22 is unassigned: fencepost at 14, then delta 8
        let raw = vec![0xe0u8, 0x81, 0x05];
        let mut b: &[u8] = &raw;
        let parsed = OptionSet::deser(&mut b, 2).unwrap();

        assert_eq!(parsed.len(), 1);
        let opt = parsed.iter().next().unwrap();
        assert_eq!(opt.number(), 22);
        assert_eq!(opt.value(), &[0x05]);

        let mut buf = BytesMut::new();
        parsed.ser(&mut buf);
        assert_eq!(buf.as_ref(), raw.as_slice());
    }

    #[rstest]
    fn test_deser_nonempty_fencepost_number_kept() {
        // an option at a fencepost number with a value is not a fencepost and round-trips
        let raw = vec![0xe1u8, 0x07];
        let mut b: &[u8] = &raw;
        let parsed = OptionSet::deser(&mut b, 1).unwrap();

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.iter().next().unwrap().number(), 14);

        let mut buf = BytesMut::new();
        parsed.ser(&mut buf);
        assert_eq!(buf.as_ref(), raw.as_slice());
    }

    #[rstest]
    #[case::value_truncated(vec![0x14, 0x01], 1)]
    #[case::ext_length_byte_missing(vec![0x1f], 1)]
    #[case::ext_value_truncated(vec![0x1f, 0x00, 0x01], 1)]
    #[case::count_exceeds_bytes(vec![], 1)]
    #[case::second_option_missing(vec![0x11, 0x29], 2)]
    fn test_deser_malformed(#[case] raw: Vec<u8>, #[case] option_count: u8) {
        let mut b: &[u8] = &raw;
        assert!(OptionSet::deser(&mut b, option_count).is_err());
    }

    #[rstest]
    fn test_add_duplicate_non_repeatable() {
        let mut options = OptionSet::new();
        options.add(OptionNumber::ContentType, vec![0x29]).unwrap();
        assert!(options.add(OptionNumber::ContentType, vec![0x2a]).is_err());
        assert_eq!(options.len(), 1);
    }

    #[rstest]
    fn test_add_repeatable() {
        let mut options = OptionSet::new();
        options.add(OptionNumber::UriPath, b"a".to_vec()).unwrap();
        options.add(OptionNumber::UriPath, b"b".to_vec()).unwrap();
        assert_eq!(options.get_all(OptionNumber::UriPath), vec![b"a".as_slice(), b"b".as_slice()]);
    }

    #[rstest]
    #[case::fencepost_14(14)]
    #[case::fencepost_28(28)]
    #[case::zero(0)]
    fn test_add_reserved_number(#[case] number: u16) {
        let mut options = OptionSet::new();
        assert!(options.add_raw(number, vec![]).is_err());
    }

    #[rstest]
    fn test_add_value_length_bounds() {
        let mut options = OptionSet::new();
        assert!(options.add(OptionNumber::ProxyUri, vec![0u8; 271]).is_err());
        options.add(OptionNumber::ProxyUri, vec![0u8; 270]).unwrap();
        assert_eq!(options.serialized_len(), 2 + 270);
    }

    #[rstest]
    fn test_sorted_insertion() {
        let mut options = OptionSet::new();
        options.add(OptionNumber::Token, vec![1]).unwrap();
        options.add(OptionNumber::ContentType, vec![2]).unwrap();
        options.add(OptionNumber::UriPath, vec![3]).unwrap();

        let numbers: Vec<u16> = options.iter().map(|o| o.number()).collect();
        assert_eq!(numbers, vec![1, 9, 11]);
    }

    #[rstest]
    fn test_set_replaces_all() {
        let mut options = OptionSet::new();
        options.add(OptionNumber::UriPath, b"a".to_vec()).unwrap();
        options.add(OptionNumber::UriPath, b"b".to_vec()).unwrap();
        options.set(OptionNumber::UriPath, b"z".to_vec()).unwrap();
        assert_eq!(options.get_all(OptionNumber::UriPath), vec![b"z".as_slice()]);
    }

    #[rstest]
    #[case::zero(0, vec![])]
    #[case::one(1, vec![1])]
    #[case::one_byte_max(0xff, vec![0xff])]
    #[case::two_bytes(0x100, vec![0x01, 0x00])]
    #[case::three_bytes(0x012345, vec![0x01, 0x23, 0x45])]
    #[case::four_bytes(0xffffffff, vec![0xff, 0xff, 0xff, 0xff])]
    fn test_uint_codec(#[case] value: u32, #[case] expected: Vec<u8>) {
        assert_eq!(encode_uint(value), expected);
        assert_eq!(decode_uint(&expected).unwrap(), value);
    }

    #[rstest]
    fn test_uint_decode_too_long() {
        assert!(decode_uint(&[1, 2, 3, 4, 5]).is_err());
    }

    #[rstest]
    fn test_uint_option_accessors() {
        let mut options = OptionSet::new();
        options.set_uint(OptionNumber::Observe, 7).unwrap();
        assert_eq!(options.get_uint(OptionNumber::Observe).unwrap(), Some(7));
        assert_eq!(options.get_uint(OptionNumber::MaxAge).unwrap(), None);

        options.set_uint(OptionNumber::Observe, 0).unwrap();
        assert_eq!(options.get_first(OptionNumber::Observe), Some([].as_slice()));
        assert_eq!(options.get_uint(OptionNumber::Observe).unwrap(), Some(0));
    }
}
