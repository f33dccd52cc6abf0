use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use anyhow::bail;
use crate::block::BlockSize;
use crate::message::MAX_PAYLOAD_SIZE;

/// the IANA registered default port
pub const DEFAULT_PORT: u16 = 5683;

/// Configuration for a protocol endpoint. The defaults are meant to be usable as-is on
///  constrained networks; applications typically only set the bind address.
#[derive(Debug, Clone)]
pub struct CoapConfig {
    /// the local address on which the endpoint's socket listens
    pub self_addr: SocketAddr,

    /// Base timeout before a confirmable message is retransmitted for the first time. The
    ///  actual initial timeout is drawn uniformly from
    ///  `[ack_timeout, ack_timeout * ack_random_factor)` and doubles with every retransmission.
    pub ack_timeout: Duration,
    /// spreading factor for the initial retransmission timeout, must be at least 1.0
    pub ack_random_factor: f64,
    /// Number of retransmissions of a confirmable message before the transmission is reported
    ///  as failed. The message is sent `max_retransmit + 1` times in total.
    pub max_retransmit: u32,

    /// Window during which a message id of an inbound CON / NON message counts as a duplicate.
    ///  Must comfortably exceed the peer's complete retransmission span.
    pub dedup_window: Duration,
    /// window during which sent ACK / RST messages are kept for replay to duplicate requests
    pub reply_cache_window: Duration,
    /// window during which duplicate inbound ACK / RST messages are suppressed
    pub ack_dedup_window: Duration,

    /// upper bound for the worker's sleep between housekeeping runs
    pub tick_interval: Duration,

    /// the block size this endpoint proposes for blockwise transfers
    pub default_block_size: BlockSize,
    /// upper bound on the reassembled size of a blockwise transfer
    pub max_transfer_size: usize,
}

impl CoapConfig {
    pub fn default_for(self_addr: SocketAddr) -> CoapConfig {
        CoapConfig {
            self_addr,
            ack_timeout: Duration::from_millis(2000),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            dedup_window: Duration::from_secs(45),
            reply_cache_window: Duration::from_secs(45),
            ack_dedup_window: Duration::from_secs(10),
            tick_interval: Duration::from_millis(250),
            default_block_size: BlockSize::S512,
            max_transfer_size: 64 * 1024,
        }
    }

    pub fn default_ipv4() -> CoapConfig {
        Self::default_for(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ack_timeout.is_zero() {
            bail!("ack_timeout must not be zero");
        }
        if self.ack_random_factor < 1.0 {
            bail!("ack_random_factor must be at least 1.0");
        }
        if self.tick_interval.is_zero() {
            bail!("tick_interval must not be zero");
        }
        if self.max_transfer_size < self.default_block_size.size() {
            bail!("max_transfer_size must hold at least one block");
        }
        if self.max_transfer_size < MAX_PAYLOAD_SIZE {
            bail!("max_transfer_size must be at least the single message payload limit");
        }
        Ok(())
    }
}
