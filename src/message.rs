use std::time::Duration;
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::TryFromPrimitive;
use crate::block::BlockOption;
use crate::codes::{MediaType, MessageCode, Method, PacketType, ResponseStatus};
use crate::message_id::MessageId;
use crate::options::{OptionNumber, OptionSet, MAX_SERIALIZED_OPTION_COUNT};
use crate::safe_converter::PrecheckedCast;

pub const PROTOCOL_VERSION: u8 = 1;
/// the fixed header in front of options and payload
pub const HEADER_LEN: usize = 4;
/// The engine never sends datagrams larger than this, and sizes its receive buffer
///  accordingly. The value leaves room for lower layer headers in a typical MTU.
pub const MAX_DATAGRAM_SIZE: usize = 1152;
/// upper bound for a single message's payload; larger payloads go through block transfers
pub const MAX_PAYLOAD_SIZE: usize = 1024;
pub const MAX_TOKEN_LEN: usize = 8;
/// how long intermediaries may serve a cacheable response without revalidating it
pub const CACHEABLE_LIFETIME: Duration = Duration::from_secs(60);

/// A protocol message: the unit that is serialized into one UDP datagram.
///
/// Wire layout (all numbers big-endian):
/// ```ascii
/// 0:  version (2 bits) | packet type (2 bits) | option count (4 bits)
/// 1:  code (0 empty, 1..=31 request method, 64..=191 response status)
/// 2:  message id (u16)
/// 4:  options (see [OptionSet]), then the payload as the remaining bytes
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    packet_type: PacketType,
    code: MessageCode,
    message_id: MessageId,
    options: OptionSet,
    payload: Vec<u8>,
}

impl Message {
    pub fn new(packet_type: PacketType, code: MessageCode, message_id: MessageId) -> Message {
        Message {
            packet_type,
            code,
            message_id,
            options: OptionSet::new(),
            payload: Vec::new(),
        }
    }

    pub fn request(packet_type: PacketType, method: Method, message_id: MessageId) -> Message {
        Self::new(packet_type, MessageCode::Request(method), message_id)
    }

    pub fn response(packet_type: PacketType, status: ResponseStatus, message_id: MessageId) -> Message {
        Self::new(packet_type, MessageCode::Response(status), message_id)
    }

    /// a bare acknowledgement without a piggybacked response
    pub fn empty_ack(message_id: MessageId) -> Message {
        Self::new(PacketType::Ack, MessageCode::Empty, message_id)
    }

    pub fn reset(message_id: MessageId) -> Message {
        Self::new(PacketType::Rst, MessageCode::Empty, message_id)
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn code(&self) -> MessageCode {
        self.code
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn set_message_id(&mut self, message_id: MessageId) {
        self.message_id = message_id;
    }

    pub fn is_confirmable(&self) -> bool {
        self.packet_type == PacketType::Con
    }

    pub fn options(&self) -> &OptionSet {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut OptionSet {
        &mut self.options
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Sets the payload. Size limits apply when the message goes out: a payload larger than
    ///  [MAX_PAYLOAD_SIZE] either goes through a block transfer or fails send validation.
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    /// The token correlates a response with its request across message ids, most importantly
    ///  for separate responses and notifications. It travels as an option.
    pub fn token(&self) -> Option<&[u8]> {
        self.options.get_first(OptionNumber::Token)
    }

    pub fn set_token(&mut self, token: Vec<u8>) -> anyhow::Result<()> {
        if token.len() > MAX_TOKEN_LEN {
            bail!("token has {} bytes, the maximum is {}", token.len(), MAX_TOKEN_LEN);
        }
        self.options.set(OptionNumber::Token, token)
    }

    pub fn media_type(&self) -> anyhow::Result<Option<MediaType>> {
        match self.options.get_uint(OptionNumber::ContentType)? {
            Some(raw) => {
                let raw: u8 = raw.try_into()?;
                Ok(Some(MediaType::try_from_primitive(raw)?))
            }
            None => Ok(None),
        }
    }

    pub fn set_media_type(&mut self, media_type: MediaType) -> anyhow::Result<()> {
        self.options.set_uint(OptionNumber::ContentType, u8::from(media_type) as u32)
    }

    pub fn block1(&self) -> anyhow::Result<Option<BlockOption>> {
        self.block(OptionNumber::Block1)
    }

    pub fn set_block1(&mut self, block: BlockOption) -> anyhow::Result<()> {
        self.options.set_uint(OptionNumber::Block1, block.to_raw())
    }

    pub fn block2(&self) -> anyhow::Result<Option<BlockOption>> {
        self.block(OptionNumber::Block2)
    }

    pub fn set_block2(&mut self, block: BlockOption) -> anyhow::Result<()> {
        self.options.set_uint(OptionNumber::Block2, block.to_raw())
    }

    fn block(&self, number: OptionNumber) -> anyhow::Result<Option<BlockOption>> {
        match self.options.get_uint(number)? {
            Some(raw) => Ok(Some(BlockOption::from_raw(raw)?)),
            None => Ok(None),
        }
    }

    pub fn observe(&self) -> anyhow::Result<Option<u32>> {
        self.options.get_uint(OptionNumber::Observe)
    }

    pub fn set_observe(&mut self, sequence_number: u32) -> anyhow::Result<()> {
        self.options.set_uint(OptionNumber::Observe, sequence_number)
    }

    pub fn serialized_len(&self) -> usize {
        HEADER_LEN + self.options.serialized_len() + self.payload.len()
    }

    /// Local sanity checks before a message goes out. This is the send path's contract:
    ///  [Message::ser] relies on it having passed.
    pub fn validate_for_send(&self) -> anyhow::Result<()> {
        if self.code.is_empty() && (!self.options.is_empty() || !self.payload.is_empty()) {
            bail!("empty messages must not carry options or payload");
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            bail!("payload has {} bytes, the maximum is {}", self.payload.len(), MAX_PAYLOAD_SIZE);
        }
        let option_count = self.options.serialized_count();
        if option_count > MAX_SERIALIZED_OPTION_COUNT {
            bail!("{} serialized options (including fenceposts), the header field fits {}", option_count, MAX_SERIALIZED_OPTION_COUNT);
        }
        if self.serialized_len() > MAX_DATAGRAM_SIZE {
            bail!("serialized message has {} bytes, the maximum datagram size is {}", self.serialized_len(), MAX_DATAGRAM_SIZE);
        }
        Ok(())
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let option_count: u8 = self.options.serialized_count().prechecked_cast();
        assert!(option_count as usize <= MAX_SERIALIZED_OPTION_COUNT, "this is a bug: the message should have been validated before serialization");

        let type_bits: u8 = self.packet_type.into();
        buf.put_u8(PROTOCOL_VERSION << 6 | type_bits << 4 | option_count);
        buf.put_u8(self.code.to_raw());
        buf.put_u16(self.message_id.to_raw());
        self.options.ser(buf);
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let first = buf.try_get_u8()?;
        let version = first >> 6;
        if version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }
        let packet_type = PacketType::try_from_primitive(first >> 4 & 0x03)?;
        let option_count = first & 0x0f;

        let code = MessageCode::from_raw(buf.try_get_u8()?)?;
        let message_id = MessageId::from_raw(buf.try_get_u16()?);
        let options = OptionSet::deser(buf, option_count)?;

        let mut payload = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut payload);

        Ok(Message {
            packet_type,
            code,
            message_id,
            options,
            payload,
        })
    }
}
