use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Transmission semantics of a packet, stored in two bits of the first header byte.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PacketType {
    /// confirmable - retransmitted with exponential backoff until the peer answers with
    ///  ACK or RST, or the retransmission budget is exhausted
    Con = 0,
    /// non-confirmable - sent exactly once, fire and forget
    Non = 1,
    /// acknowledgement, echoing the message id of the CON packet it confirms. May carry a
    ///  piggybacked response.
    Ack = 2,
    /// reset - the peer received the packet but rejects it (or cancels an exchange)
    Rst = 3,
}

impl PacketType {
    pub fn is_reply(&self) -> bool {
        matches!(self, PacketType::Ack | PacketType::Rst)
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum Method {
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
}

/// Response status, packed as `class << 5 | detail` into the code byte (2.01 -> 65 etc.).
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ResponseStatus {
    Created = 65,
    Deleted = 66,
    Valid = 67,
    Changed = 68,
    Content = 69,
    /// sent instead of the final response while a request-side block transfer is in
    ///  progress: the block was stored, the peer should send the next one
    Continue = 95,
    BadRequest = 128,
    Unauthorized = 129,
    BadOption = 130,
    Forbidden = 131,
    NotFound = 132,
    MethodNotAllowed = 133,
    NotAcceptable = 134,
    PreconditionFailed = 140,
    RequestEntityTooLarge = 141,
    UnsupportedMediaType = 143,
    InternalServerError = 160,
    NotImplemented = 161,
    BadGateway = 162,
    ServiceUnavailable = 163,
    GatewayTimeout = 164,
    ProxyingNotSupported = 165,
}

impl ResponseStatus {
    pub fn is_success(&self) -> bool {
        let raw: u8 = (*self).into();
        raw >> 5 == 2
    }
}

/// The code byte distinguishes requests, responses and empty packets (bare ACK / RST).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageCode {
    Empty,
    Request(Method),
    Response(ResponseStatus),
}

impl MessageCode {
    pub fn from_raw(value: u8) -> anyhow::Result<MessageCode> {
        match value {
            0 => Ok(MessageCode::Empty),
            1..=31 => Ok(MessageCode::Request(Method::try_from_primitive(value)?)),
            64..=191 => Ok(MessageCode::Response(ResponseStatus::try_from_primitive(value)?)),
            _ => bail!("code {} is outside the request and response ranges", value),
        }
    }

    pub fn to_raw(&self) -> u8 {
        match self {
            MessageCode::Empty => 0,
            MessageCode::Request(method) => (*method).into(),
            MessageCode::Response(status) => (*status).into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, MessageCode::Empty)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, MessageCode::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, MessageCode::Response(_))
    }
}

/// Payload media types, transported as a uint value in the Content-Type option.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum MediaType {
    TextPlain = 0,
    LinkFormat = 40,
    Xml = 41,
    OctetStream = 42,
    Exi = 47,
    Json = 50,
}
