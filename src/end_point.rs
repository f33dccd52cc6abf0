use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::channel::Channel;
use crate::config::CoapConfig;
use crate::handler::{ClientHandler, ServerHandler};
use crate::message::{Message, MAX_DATAGRAM_SIZE};
use crate::message_id::MessageId;
use crate::registry::{ChannelRegistry, IdGenerator};
use crate::send_queue::{QueuedMessage, SendQueue};

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending datagram to {:?}", to);

        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// EndPoint is the place where all other parts of the protocol come together: It listens on a
///  UdpSocket, dispatching incoming messages to their channels, and it runs the worker task
///  that sends and retransmits queued messages.
///
/// One endpoint serves one local port, with any number of channels to peers on it.
pub struct EndPoint {
    config: Arc<CoapConfig>,
    receive_socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    registry: ChannelRegistry,
    send_queue: Arc<SendQueue>,
    server_handler: Option<Arc<dyn ServerHandler>>,
    closed: AtomicBool,
}

impl EndPoint {
    /// Binds the endpoint's socket. With a server handler the endpoint accepts requests from
    ///  unknown peers, without one it only speaks to peers it connected to itself.
    pub async fn new(server_handler: Option<Arc<dyn ServerHandler>>, config: Arc<CoapConfig>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound receive socket to {:?}", receive_socket.as_ref().local_addr()?);

        let ids = Arc::new(IdGenerator::new());
        let send_queue = Arc::new(SendQueue::new());
        let registry = ChannelRegistry::new(config.clone(), ids, send_queue.clone());

        Ok(EndPoint {
            config,
            receive_socket: receive_socket.clone(),
            send_socket: Arc::new(receive_socket),
            registry,
            send_queue,
            server_handler,
            closed: AtomicBool::new(false),
        })
    }

    /// a client-only endpoint that cannot accept requests
    pub async fn client_only(config: Arc<CoapConfig>) -> anyhow::Result<EndPoint> {
        Self::new(None, config).await
    }

    /// an endpoint that listens for requests, handing them to the given handler
    pub async fn server(server_handler: Arc<dyn ServerHandler>, config: Arc<CoapConfig>) -> anyhow::Result<EndPoint> {
        Self::new(Some(server_handler), config).await
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.receive_socket.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Opens the client channel to a peer, or returns the existing one.
    pub async fn connect(&self, peer_addr: SocketAddr, handler: Arc<dyn ClientHandler>) -> anyhow::Result<Arc<Channel>> {
        if self.is_closed() {
            bail!("endpoint is closed");
        }
        self.registry.get_or_create_client(peer_addr, handler).await
    }

    /// Closes and removes the channel to a peer. Messages it has queued are discarded when
    ///  they come up for sending.
    pub async fn close_channel(&self, peer_addr: SocketAddr) {
        if let Some(channel) = self.registry.remove(peer_addr).await {
            channel.close();
        }
    }

    /// Closes the endpoint: all channels are closed and the worker task winds down.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for channel in self.registry.all().await {
            channel.close();
        }
        self.send_queue.wake();
    }

    /// Spawns the endpoint's worker task: the only reader of the socket and the only
    ///  consumer of the send queue, so all per-channel mutation funnels through it.
    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let end_point = self.clone();
        tokio::spawn(async move { end_point.run().await })
    }

    async fn run(&self) {
        info!("starting endpoint worker on {:?}", self.self_addr());

        let mut recv_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut last_sweep = Instant::now();

        while !self.is_closed() {
            let now = Instant::now();
            let wakeup = match self.send_queue.next_due().await {
                Some(due) => due.min(now + self.config.tick_interval),
                None => now + self.config.tick_interval,
            };

            select! {
                recv = self.receive_socket.recv_from(&mut recv_buf) => {
                    match recv {
                        Ok((len, from)) => self.on_datagram(from, &recv_buf[..len]).await,
                        Err(e) => error!("socket error: {}", e),
                    }
                }
                _ = sleep_until(wakeup) => {}
                _ = self.send_queue.wait_for_change() => {}
            }

            self.drain_send_queue().await;

            let now = Instant::now();
            if now.duration_since(last_sweep) >= self.config.tick_interval {
                for channel in self.registry.all().await {
                    channel.sweep(now).await;
                }
                last_sweep = now;
            }
        }

        info!("endpoint worker on {:?} shutting down", self.self_addr());
    }

    async fn on_datagram(&self, from: SocketAddr, data: &[u8]) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

        // NB: the span guard must not be held across an await
        let msg = {
            let _entered = span.enter();

            trace!("received a {} byte datagram from {:?}", data.len(), from);

            let mut parse_buf = data;
            match Message::deser(&mut parse_buf) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("received unparsable datagram from {:?}, dropping: {}", from, e);
                    return;
                }
            }
        };

        match self.registry.resolve(from).await {
            Some(channel) => channel.on_inbound_message(msg).instrument(span).await,
            None => self.on_unknown_peer(from, msg).instrument(span).await,
        }
    }

    /// First contact from an unknown peer. A request may open a server channel if the
    ///  application accepts it, everything else is rejected statelessly: RST for
    ///  confirmable messages, silence for the rest.
    async fn on_unknown_peer(&self, from: SocketAddr, msg: Message) {
        if msg.code().is_request() {
            if let Some(server_handler) = &self.server_handler {
                if server_handler.on_accept(&msg).await {
                    let channel = self.registry.register_server(from, server_handler.clone()).await;
                    channel.on_inbound_message(msg).await;
                    return;
                }
                debug!("request from unknown peer {:?} was not accepted, rejecting", from);
            }
            else {
                debug!("request from {:?}, but this endpoint does not serve requests", from);
            }
        }
        else {
            debug!("{:?} from unknown peer {:?}, rejecting", msg.packet_type(), from);
        }

        if msg.is_confirmable() {
            self.send_reset(from, msg.message_id()).await;
        }
    }

    /// sends RST directly, without per-channel state for the unknown peer
    async fn send_reset(&self, to: SocketAddr, message_id: MessageId) {
        let rst = Message::reset(message_id);
        let mut buf = BytesMut::with_capacity(rst.serialized_len());
        rst.ser(&mut buf);
        self.send_socket.do_send_packet(to, &buf).await;
    }

    async fn drain_send_queue(&self) {
        let now = Instant::now();
        while let Some(entry) = self.send_queue.pop_due(now).await {
            self.process_due_entry(entry).await;
        }
    }

    /// Sends one due queue entry. Confirmable messages are requeued with a doubled timeout
    ///  until they are confirmed or run out of retransmissions, everything else goes out
    ///  exactly once.
    async fn process_due_entry(&self, mut entry: QueuedMessage) {
        if entry.channel.is_closed() {
            debug!("dropping queued {:?} {} to the closed channel {:?}", entry.packet_type, entry.message_id, entry.channel.peer_addr());
            return;
        }

        match &mut entry.retransmit {
            Some(retransmit) => {
                if retransmit.confirmed.load(Ordering::Acquire) {
                    trace!("{:?} {} was confirmed, retiring it", entry.packet_type, entry.message_id);
                    return;
                }
                if retransmit.attempt > self.config.max_retransmit {
                    entry.channel.on_transmission_expired(entry.message_id).await;
                    return;
                }
                if retransmit.attempt > 0 {
                    debug!("retransmitting {:?} {} to {:?} (attempt {})", entry.packet_type, entry.message_id, entry.channel.peer_addr(), retransmit.attempt);
                }

                self.send_socket.do_send_packet(entry.channel.peer_addr(), &entry.datagram).await;

                if retransmit.attempt > 0 {
                    retransmit.timeout *= 2;
                }
                retransmit.attempt += 1;
                entry.due = Instant::now() + retransmit.timeout;
                self.send_queue.enqueue(entry).await;
            }
            None => {
                self.send_socket.do_send_packet(entry.channel.peer_addr(), &entry.datagram).await;
            }
        }
    }
}
