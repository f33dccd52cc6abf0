//! This is a request / response protocol for constrained networks, running over plain UDP
//!  datagrams. It is aimed at small devices and lossy links: every message fits into a single
//!  unfragmented datagram, reliability is opt-in per message, and large payloads are split
//!  into blocks at the application layer rather than relying on IP fragmentation.
//!
//! ## Design goals
//!
//! * Every message fits into one UDP datagram (at most 1152 bytes, with at most 1024 bytes
//!   of payload), so the network layer never has to fragment
//! * Reliability is chosen per message: *confirmable* messages are retransmitted with
//!   exponential backoff until acknowledged, *non-confirmable* messages are fire-and-forget
//! * The same local port serves both roles: an endpoint can connect to servers as a client
//!   and accept requests from clients, with one channel per remote socket address
//! * Duplicate detection is the receiver's job: message ids are tracked for a while, and
//!   replies are cached so a retransmitted request gets the same answer again
//! * Responses can be piggybacked onto the ACK, or sent separately when producing them
//!   takes longer than the client's retransmission patience
//! * Large payloads are transferred block by block, with the protocol layer fetching and
//!   reassembling blocks transparently so the application only ever sees complete payloads
//!
//! ## Header
//!
//! Every message starts with a fixed four byte header - all numbers in network byte
//!  order (BE):
//! ```ascii
//! 0: version (2 bits, always 1)
//!    type (2 bits): 0 CON, 1 NON, 2 ACK, 3 RST
//!    option count (4 bits)
//! 1: code (u8): 0 for empty messages, 1-31 for request methods, 64-191 for response codes
//! 2: message id (u16 BE): correlates ACK / RST with the message they refer to, and is
//!     the key for duplicate detection
//! ```
//!
//! ## Options
//!
//! Options follow the header, sorted by option number. Each option stores the *delta* to
//!  the previous option's number rather than the number itself:
//! ```ascii
//! 0: option delta (4 bits)
//!    length (4 bits): 0-14 literal, 15 marks an extended length byte
//! 1: extended length (u8, only if length nibble is 15): actual length minus 15
//! *: option value (up to 270 bytes)
//! ```
//!
//! A delta can not express more than 14, so larger gaps are bridged with *fenceposts*:
//!  zero-length options at the next multiple of 14, which carry no meaning of their own.
//!
//! NB: The request token is an ordinary option (number 11). It correlates a response with
//!      its request across message ids, which is what makes separate responses work.
//!
//! ## Block transfer
//!
//! Payloads larger than a datagram are moved in equally sized blocks of 16 to 1024 bytes
//!  (powers of two), negotiated between the peers. The block option value encodes the
//!  block number, a "more blocks follow" flag and the block size:
//! ```ascii
//! NUM << 4 | M << 3 | SZX    with block size = 2^(SZX + 4)
//! ```
//!
//! Uploads (block option 19) push a request payload block by block, with the server
//!  answering each non-final block with a Continue response. Downloads (block option 17)
//!  pull a response payload, with the client requesting each further block under a fresh
//!  message id. Reassembly is exact: the payload arrives at the application byte-identical
//!  to what the peer sent.
//!
//! ## Reliability
//!
//! A confirmable message is retransmitted on a doubling timeout (starting at a randomised
//!  2-3 seconds) until the peer confirms it with ACK or RST, up to four retransmissions.
//!  After that the channel reports the peer as unreachable. ACK and RST themselves are
//!  never retransmitted on a timer, but are replayed from the reply cache when the
//!  message they answer arrives again.

pub mod message_id;
pub mod codes;
pub mod options;
pub mod block;
pub mod message;
pub mod channel;
pub mod registry;
pub mod send_queue;
pub mod handler;
pub mod end_point;
pub mod config;
pub mod safe_converter;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            // .with_max_level(Level::DEBUG)
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
