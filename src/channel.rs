use std::cmp::min;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use anyhow::bail;
use bytes::BytesMut;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};
use crate::block::{BlockAssembly, BlockIngestion, BlockOption, BlockSize, BlockSource};
use crate::codes::{MediaType, MessageCode, Method, PacketType, ResponseStatus};
use crate::config::CoapConfig;
use crate::handler::{ClientHandler, ServerHandler};
use crate::message::{Message, MAX_PAYLOAD_SIZE};
use crate::message_id::MessageId;
use crate::options::OptionNumber;
use crate::registry::IdGenerator;
use crate::send_queue::{QueuedMessage, RetransmitState, SendQueue};

/// Fixed role of a channel, decided when the channel is created: a client channel sends
///  requests and receives responses, a server channel the other way round.
pub enum ChannelRole {
    Client(Arc<dyn ClientHandler>),
    Server(Arc<dyn ServerHandler>),
}

/// The at most one blockwise transfer a channel has in flight.
enum BlockContext {
    /// an inbound payload being reassembled, block by block
    Assembling(BlockAssembly),
    /// an outbound response payload served in blocks, the peer requests each block
    ServingResponse { template: Message, source: BlockSource },
    /// an outbound request payload pushed in blocks, the peer confirms each block with
    ///  a Continue response
    SendingRequest { template: Message, source: BlockSource },
}

/// A sent ACK / RST, kept for replay when the peer retransmits the message it answers.
struct CachedReply {
    packet_type: PacketType,
    datagram: Vec<u8>,
    expires: Instant,
}

struct ChannelInner {
    /// inbound CON / NON message ids with the expiry of their duplicate detection window
    seen_messages: FxHashMap<MessageId, Instant>,
    /// inbound ACK / RST message ids, duplicates within the window are suppressed
    seen_replies: FxHashMap<MessageId, Instant>,
    reply_cache: FxHashMap<MessageId, CachedReply>,
    /// confirmation flags of in-flight confirmable messages, shared with the send queue
    outstanding: FxHashMap<MessageId, Arc<AtomicBool>>,
    last_request: Option<Message>,
    last_response: Option<Message>,
    block_context: Option<BlockContext>,
}

/// callback work computed while the channel lock is held, invoked after it is released
enum Callback {
    None,
    Response(Message),
    Request(Message),
    ConnectionFailed { not_reachable: bool, reset_by_peer: bool },
    Reset(MessageId),
    SeparateResponseFailed,
}

/// A request / response channel to one peer.
///
/// All mutable state lives behind a single lock, and handler callbacks are invoked only
///  after the lock is released, so handlers may call back into the channel.
pub struct Channel {
    peer_addr: SocketAddr,
    role: ChannelRole,
    config: Arc<CoapConfig>,
    ids: Arc<IdGenerator>,
    send_queue: Arc<SendQueue>,
    closed: AtomicBool,
    inner: RwLock<ChannelInner>,
}

impl Channel {
    pub fn new(
        peer_addr: SocketAddr,
        role: ChannelRole,
        config: Arc<CoapConfig>,
        ids: Arc<IdGenerator>,
        send_queue: Arc<SendQueue>,
    ) -> Channel {
        Channel {
            peer_addr,
            role,
            config,
            ids,
            send_queue,
            closed: AtomicBool::new(false),
            inner: RwLock::new(ChannelInner {
                seen_messages: FxHashMap::default(),
                seen_replies: FxHashMap::default(),
                reply_cache: FxHashMap::default(),
                outstanding: FxHashMap::default(),
                last_request: None,
                last_response: None,
                block_context: None,
            }),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, ChannelRole::Client(_))
    }

    pub fn is_server(&self) -> bool {
        matches!(self.role, ChannelRole::Server(_))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the channel closed: sends fail, queued messages are discarded when they come
    ///  up, inbound traffic is dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// the last request this channel sent (client role) or delivered (server role)
    pub async fn last_request(&self) -> Option<Message> {
        self.inner.read().await.last_request.clone()
    }

    /// the last response this channel delivered (client role) or sent (server role)
    pub async fn last_response(&self) -> Option<Message> {
        self.inner.read().await.last_response.clone()
    }

    /// a new request with a fresh message id and token, confirmable if `reliable`
    pub fn create_request(&self, reliable: bool, method: Method) -> anyhow::Result<Message> {
        if !self.is_client() {
            bail!("only client channels send requests");
        }
        let packet_type = if reliable { PacketType::Con } else { PacketType::Non };
        let mut request = Message::request(packet_type, method, self.ids.next_message_id());
        request.set_token(self.ids.next_token())?;
        Ok(request)
    }

    /// The matching response for a request: piggybacked on the ACK of a confirmable request,
    ///  a fresh NON otherwise. The request's token is echoed.
    pub fn create_response(&self, request: &Message, status: ResponseStatus, media_type: Option<MediaType>) -> anyhow::Result<Message> {
        if !self.is_server() {
            bail!("only server channels send responses");
        }
        if !request.code().is_request() {
            bail!("responses answer requests, not {:?}", request.code());
        }

        let mut response = match request.packet_type() {
            PacketType::Con => Message::response(PacketType::Ack, status, request.message_id()),
            _ => Message::response(PacketType::Non, status, self.ids.next_message_id()),
        };
        if let Some(token) = request.token() {
            response.set_token(token.to_vec())?;
        }
        if let Some(media_type) = media_type {
            response.set_media_type(media_type)?;
        }
        Ok(response)
    }

    /// Detaches the response from the request's exchange, for answers that take longer than
    ///  the peer's retransmission patience: the confirmable request is acknowledged right
    ///  away with an empty ACK, and the returned response is a fresh confirmable exchange
    ///  of its own, correlated by the request's token.
    pub async fn create_separate_response(self: &Arc<Self>, request: &Message, status: ResponseStatus) -> anyhow::Result<Message> {
        if !self.is_server() {
            bail!("only server channels send responses");
        }

        if request.packet_type() == PacketType::Con {
            let mut inner = self.inner.write().await;
            self.enqueue(&mut inner, Message::empty_ack(request.message_id())).await?;
        }

        let mut response = Message::response(PacketType::Con, status, self.ids.next_message_id());
        if let Some(token) = request.token() {
            response.set_token(token.to_vec())?;
        }
        Ok(response)
    }

    pub async fn send_separate_response(self: &Arc<Self>, response: Message) -> anyhow::Result<()> {
        self.send_message(response).await
    }

    /// A notification for an observed resource: a response outside the request / response
    ///  lockstep, correlated to the observe request by its token and ordered by the
    ///  sequence number in its Observe option.
    pub fn create_notification(&self, request: &Message, status: ResponseStatus, sequence_number: u32, reliable: bool) -> anyhow::Result<Message> {
        if !self.is_server() {
            bail!("only server channels send notifications");
        }
        let packet_type = if reliable { PacketType::Con } else { PacketType::Non };
        let mut notification = Message::response(packet_type, status, self.ids.next_message_id());
        if let Some(token) = request.token() {
            notification.set_token(token.to_vec())?;
        }
        notification.set_observe(sequence_number)?;
        Ok(notification)
    }

    pub async fn send_notification(self: &Arc<Self>, notification: Message) -> anyhow::Result<()> {
        self.send_message(notification).await
    }

    /// Hands a message to the send queue. Payloads too large for a single message are
    ///  turned into a block transfer here.
    pub async fn send_message(self: &Arc<Self>, msg: Message) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("channel to {} is closed", self.peer_addr);
        }

        let mut inner = self.inner.write().await;
        let outgoing = self.fragment_if_needed(&mut inner, msg)?;
        self.enqueue(&mut inner, outgoing).await
    }

    fn fragment_if_needed(&self, inner: &mut ChannelInner, msg: Message) -> anyhow::Result<Message> {
        if msg.code().is_response() {
            // a Block2 option on the request proposes blockwise transfer of the response,
            //  and the smaller of the proposed and the configured block size wins
            let proposal = match &inner.last_request {
                Some(request) => request.block2().unwrap_or(None),
                None => None,
            };
            let block_size = match proposal {
                Some(block) => min(self.config.default_block_size, block.size),
                None => self.config.default_block_size,
            };

            let needs_blocks = msg.payload().len() > MAX_PAYLOAD_SIZE
                || (proposal.is_some() && msg.payload().len() > block_size.size());
            if needs_blocks {
                return self.start_serving_response(inner, msg, block_size);
            }
        }
        else if msg.code().is_request() && msg.payload().len() > MAX_PAYLOAD_SIZE {
            if !msg.is_confirmable() {
                bail!("a {} byte payload needs a block transfer, which requires a confirmable request", msg.payload().len());
            }
            return self.start_sending_request(inner, msg);
        }
        Ok(msg)
    }

    fn start_serving_response(&self, inner: &mut ChannelInner, msg: Message, block_size: BlockSize) -> anyhow::Result<Message> {
        debug!("serving a {} byte response to {} in blocks of {}", msg.payload().len(), self.peer_addr, block_size);

        let source = BlockSource::new(block_size, msg.payload().to_vec());
        let (block, data) = source.block(0)
            .expect("this is a bug: a block source always has a first block");

        let mut template = msg;
        let mut first = template.clone();
        template.set_payload(Vec::new());

        first.set_block2(block)?;
        first.set_payload(data);

        inner.block_context = Some(BlockContext::ServingResponse { template, source });
        Ok(first)
    }

    fn start_sending_request(&self, inner: &mut ChannelInner, msg: Message) -> anyhow::Result<Message> {
        let mut source = BlockSource::new(self.config.default_block_size, msg.payload().to_vec());
        let (block, data) = source.block(0)
            .expect("this is a bug: a block source always has a first block");
        source.advance();

        let mut template = msg;
        let mut first = template.clone();
        template.set_payload(Vec::new());

        first.set_block1(block)?;
        first.set_payload(data);

        debug!("sending request to {} in blocks of {}", self.peer_addr, self.config.default_block_size);
        inner.block_context = Some(BlockContext::SendingRequest { template, source });
        Ok(first)
    }

    /// serializes a message, does the channel's send bookkeeping and queues the datagram
    async fn enqueue(self: &Arc<Self>, inner: &mut ChannelInner, msg: Message) -> anyhow::Result<()> {
        msg.validate_for_send()?;

        let mut buf = BytesMut::with_capacity(msg.serialized_len());
        msg.ser(&mut buf);
        let datagram = buf.to_vec();

        let now = Instant::now();

        if matches!(msg.packet_type(), PacketType::Ack | PacketType::Rst) {
            inner.reply_cache.insert(msg.message_id(), CachedReply {
                packet_type: msg.packet_type(),
                datagram: datagram.clone(),
                expires: now + self.config.reply_cache_window,
            });
        }

        if msg.code().is_request() {
            inner.last_request = Some(msg.clone());
        }
        else if msg.code().is_response() && self.is_server() {
            inner.last_response = Some(msg.clone());
        }

        let retransmit = if msg.is_confirmable() {
            let confirmed = Arc::new(AtomicBool::new(false));
            inner.outstanding.insert(msg.message_id(), confirmed.clone());
            Some(RetransmitState {
                attempt: 0,
                timeout: self.initial_timeout(),
                confirmed,
            })
        }
        else {
            None
        };

        self.send_queue.enqueue(QueuedMessage::new(
            now,
            self.clone(),
            datagram,
            msg.message_id(),
            msg.packet_type(),
            retransmit,
        )).await;
        Ok(())
    }

    /// queues a message the channel built itself, logging instead of propagating failures
    async fn enqueue_or_log(self: &Arc<Self>, inner: &mut ChannelInner, msg: anyhow::Result<Message>) {
        match msg {
            Ok(msg) => {
                if let Err(e) = self.enqueue(inner, msg).await {
                    warn!("failed to queue message to {}: {}", self.peer_addr, e);
                }
            }
            Err(e) => warn!("failed to build reply to {}: {}", self.peer_addr, e),
        }
    }

    fn initial_timeout(&self) -> std::time::Duration {
        let spread: f64 = rand::rng().random_range(0.0 .. 1.0);
        let factor = 1.0 + spread * (self.config.ack_random_factor - 1.0);
        self.config.ack_timeout.mul_f64(factor)
    }

    /// a reply to a request, echoing its exchange: ACK with the request's id for CON,
    ///  a fresh NON otherwise, the request's token either way
    fn status_reply(&self, request: &Message, status: ResponseStatus) -> anyhow::Result<Message> {
        let mut reply = match request.packet_type() {
            PacketType::Con => Message::response(PacketType::Ack, status, request.message_id()),
            _ => Message::response(PacketType::Non, status, self.ids.next_message_id()),
        };
        if let Some(token) = request.token() {
            reply.set_token(token.to_vec())?;
        }
        Ok(reply)
    }

    /// Entry point for all inbound traffic of this channel, called from the endpoint's
    ///  worker task.
    pub async fn on_inbound_message(self: &Arc<Self>, msg: Message) {
        if self.is_closed() {
            debug!("message from {} on a closed channel, dropping", self.peer_addr);
            return;
        }

        match msg.packet_type() {
            PacketType::Con | PacketType::Non => self.on_inbound_con_non(msg).await,
            PacketType::Ack => self.on_inbound_ack(msg).await,
            PacketType::Rst => self.on_inbound_rst(msg).await,
        }
    }

    async fn on_inbound_con_non(self: &Arc<Self>, msg: Message) {
        let now = Instant::now();
        let callback;
        {
            let mut inner = self.inner.write().await;

            if inner.seen_messages.contains_key(&msg.message_id()) {
                debug!("duplicate message {} from {}", msg.message_id(), self.peer_addr);
                if let Some(cached) = inner.reply_cache.get(&msg.message_id()) {
                    // the peer missed our reply, send the identical bytes again
                    let replay = QueuedMessage::new(
                        now,
                        self.clone(),
                        cached.datagram.clone(),
                        msg.message_id(),
                        cached.packet_type,
                        None,
                    );
                    self.send_queue.enqueue(replay).await;
                }
                return;
            }
            inner.seen_messages.insert(msg.message_id(), now + self.config.dedup_window);

            callback = if msg.code().is_request() {
                self.handle_request(&mut inner, msg).await
            }
            else if msg.code().is_response() {
                self.handle_separate_response(&mut inner, msg).await
            }
            else {
                // an empty CON is a liveness probe and provokes RST, an empty NON is dropped
                if msg.is_confirmable() {
                    self.enqueue_or_log(&mut inner, Ok(Message::reset(msg.message_id()))).await;
                }
                Callback::None
            };
        }
        self.invoke(callback).await;
    }

    async fn handle_request(self: &Arc<Self>, inner: &mut ChannelInner, msg: Message) -> Callback {
        if !self.is_server() {
            debug!("request from {} on a client channel, rejecting", self.peer_addr);
            if msg.is_confirmable() {
                self.enqueue_or_log(inner, Ok(Message::reset(msg.message_id()))).await;
            }
            return Callback::None;
        }

        // Block1: the peer uploads its request payload in blocks
        match msg.block1() {
            Ok(Some(block)) => return self.handle_request_block1(inner, msg, block).await,
            Ok(None) => {}
            Err(e) => {
                debug!("unusable Block1 option from {}: {}, dropping", self.peer_addr, e);
                return Callback::None;
            }
        }

        // Block2: either the peer fetches the next block of a response in transfer, or a
        //  fresh request proposes a block size, which the response path honors
        match msg.block2() {
            Ok(Some(block)) => {
                let serving = matches!(inner.block_context, Some(BlockContext::ServingResponse { .. }));
                if serving || block.num > 0 {
                    return self.handle_block_fetch(inner, msg, block).await;
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!("unusable Block2 option from {}: {}, dropping", self.peer_addr, e);
                return Callback::None;
            }
        }

        inner.last_request = Some(msg.clone());
        Callback::Request(msg)
    }

    async fn handle_request_block1(self: &Arc<Self>, inner: &mut ChannelInner, msg: Message, block: BlockOption) -> Callback {
        if block.num == 0 {
            // a new transfer displaces whatever context was active; the uploader picks the size
            inner.block_context = Some(BlockContext::Assembling(
                BlockAssembly::new(block.size, self.config.max_transfer_size)));
        }
        let assembly = match &mut inner.block_context {
            Some(BlockContext::Assembling(assembly)) => assembly,
            _ => {
                debug!("request block {} from {} without a transfer, dropping", block.num, self.peer_addr);
                return Callback::None;
            }
        };

        let ingestion = assembly.on_block(block, msg.payload());
        let block_size = assembly.block_size();

        match ingestion {
            BlockIngestion::Accepted => {
                // each accepted non-final block of a confirmable upload is answered with
                //  Continue so the peer sends the next one
                if msg.is_confirmable() {
                    let echo = BlockOption { num: block.num, more: true, size: block_size };
                    let reply = self.status_reply(&msg, ResponseStatus::Continue)
                        .and_then(|mut reply| {
                            reply.set_block1(echo)?;
                            Ok(reply)
                        });
                    self.enqueue_or_log(inner, reply).await;
                }
                Callback::None
            }
            BlockIngestion::Complete(payload) => {
                inner.block_context = None;
                let mut complete = msg;
                complete.options_mut().remove(OptionNumber::Block1);
                complete.set_payload(payload);
                inner.last_request = Some(complete.clone());
                Callback::Request(complete)
            }
            BlockIngestion::Ignored => {
                debug!("request block {} from {} does not fit the transfer, ignoring", block.num, self.peer_addr);
                Callback::None
            }
            BlockIngestion::Overflow => {
                warn!("request transfer from {} exceeds {} bytes, rejecting", self.peer_addr, self.config.max_transfer_size);
                inner.block_context = None;
                let reply = self.status_reply(&msg, ResponseStatus::RequestEntityTooLarge);
                self.enqueue_or_log(inner, reply).await;
                Callback::None
            }
        }
    }

    async fn handle_block_fetch(self: &Arc<Self>, inner: &mut ChannelInner, msg: Message, block: BlockOption) -> Callback {
        let mut reply: Option<(anyhow::Result<Message>, bool)> = None;
        if let Some(BlockContext::ServingResponse { template, source }) = &inner.block_context {
            if let Some((served, data)) = source.block(block.num) {
                reply = Some((self.block_response(template, &msg, served, data), !served.more));
            }
        }

        match reply {
            Some((built, last)) => {
                self.enqueue_or_log(inner, built).await;
                if last {
                    inner.block_context = None;
                }
            }
            None => {
                debug!("block fetch {} from {} outside a transfer, rejecting", block.num, self.peer_addr);
                let reply = self.status_reply(&msg, ResponseStatus::BadRequest);
                self.enqueue_or_log(inner, reply).await;
            }
        }
        Callback::None
    }

    /// one block of a response in transfer, addressed to the request that fetched it
    fn block_response(&self, template: &Message, request: &Message, block: BlockOption, data: Vec<u8>) -> anyhow::Result<Message> {
        let status = match template.code() {
            MessageCode::Response(status) => status,
            code => bail!("blockwise serving expects a response template, found {:?}", code),
        };

        let mut reply = self.status_reply(request, status)?;
        if let Some(media_type) = template.media_type()? {
            reply.set_media_type(media_type)?;
        }
        reply.set_block2(block)?;
        reply.set_payload(data);
        Ok(reply)
    }

    /// a response that arrives as its own CON / NON exchange rather than piggybacked
    async fn handle_separate_response(self: &Arc<Self>, inner: &mut ChannelInner, msg: Message) -> Callback {
        if !self.is_client() {
            debug!("response from {} on a server channel, rejecting", self.peer_addr);
            if msg.is_confirmable() {
                self.enqueue_or_log(inner, Ok(Message::reset(msg.message_id()))).await;
            }
            return Callback::None;
        }

        let matches_token = inner.last_request.as_ref()
            .map(|request| request.token() == msg.token())
            .unwrap_or(false);
        if !matches_token {
            debug!("response from {} with unknown token, rejecting", self.peer_addr);
            if msg.is_confirmable() {
                self.enqueue_or_log(inner, Ok(Message::reset(msg.message_id()))).await;
            }
            return Callback::None;
        }

        if msg.is_confirmable() {
            self.enqueue_or_log(inner, Ok(Message::empty_ack(msg.message_id()))).await;
        }

        self.handle_response_content(inner, msg).await
    }

    /// response handling shared between separate and piggybacked responses
    async fn handle_response_content(self: &Arc<Self>, inner: &mut ChannelInner, msg: Message) -> Callback {
        let block2 = match msg.block2() {
            Ok(block2) => block2,
            Err(e) => {
                debug!("unusable Block2 option from {}: {}, dropping", self.peer_addr, e);
                return Callback::None;
            }
        };

        if let Some(block) = block2 {
            return self.handle_response_block(inner, msg, block).await;
        }

        // a plain response concludes the exchange, including any pending block transfer
        inner.block_context = None;
        inner.last_response = Some(msg.clone());
        Callback::Response(msg)
    }

    async fn handle_response_block(self: &Arc<Self>, inner: &mut ChannelInner, msg: Message, block: BlockOption) -> Callback {
        if block.num == 0 {
            inner.block_context = Some(BlockContext::Assembling(
                BlockAssembly::new(block.size, self.config.max_transfer_size)));
        }
        let assembly = match &mut inner.block_context {
            Some(BlockContext::Assembling(assembly)) => assembly,
            _ => {
                debug!("response block {} from {} without a transfer, dropping", block.num, self.peer_addr);
                return Callback::None;
            }
        };

        let ingestion = assembly.on_block(block, msg.payload());
        let next = BlockOption {
            num: assembly.next_block_num(),
            more: false,
            size: assembly.block_size(),
        };

        match ingestion {
            BlockIngestion::Accepted => {
                // fetch the next block with a fresh exchange under the same token
                let built = self.next_block_request(inner, next);
                self.enqueue_or_log(inner, built).await;
                Callback::None
            }
            BlockIngestion::Complete(payload) => {
                inner.block_context = None;
                let mut complete = msg;
                complete.options_mut().remove(OptionNumber::Block2);
                complete.set_payload(payload);
                inner.last_response = Some(complete.clone());
                Callback::Response(complete)
            }
            BlockIngestion::Ignored => {
                debug!("response block {} from {} does not fit the transfer, ignoring", block.num, self.peer_addr);
                Callback::None
            }
            BlockIngestion::Overflow => {
                warn!("response transfer from {} exceeds {} bytes, abandoning", self.peer_addr, self.config.max_transfer_size);
                inner.block_context = None;
                Callback::None
            }
        }
    }

    fn next_block_request(&self, inner: &ChannelInner, next: BlockOption) -> anyhow::Result<Message> {
        let mut request = match &inner.last_request {
            Some(request) => request.clone(),
            None => bail!("no request to continue the transfer from"),
        };
        request.set_message_id(self.ids.next_message_id());
        request.set_block2(next)?;
        Ok(request)
    }

    async fn on_inbound_ack(self: &Arc<Self>, msg: Message) {
        let now = Instant::now();
        let mut callback = Callback::None;
        {
            let mut inner = self.inner.write().await;

            if inner.seen_replies.contains_key(&msg.message_id()) {
                debug!("duplicate ACK {} from {}, suppressed", msg.message_id(), self.peer_addr);
                return;
            }
            inner.seen_replies.insert(msg.message_id(), now + self.config.ack_dedup_window);

            match inner.outstanding.remove(&msg.message_id()) {
                Some(confirmed) => confirmed.store(true, Ordering::Release),
                None => {
                    debug!("ACK {} from {} does not match an in-flight message, dropping", msg.message_id(), self.peer_addr);
                    return;
                }
            }

            if msg.code().is_response() {
                callback = if self.is_client() {
                    self.handle_piggybacked_response(&mut inner, msg).await
                }
                else {
                    debug!("piggybacked response from {} on a server channel, dropping", self.peer_addr);
                    Callback::None
                };
            }
            // an empty ACK just confirms, a separate response may follow
        }
        self.invoke(callback).await;
    }

    async fn handle_piggybacked_response(self: &Arc<Self>, inner: &mut ChannelInner, msg: Message) -> Callback {
        let matches_token = inner.last_request.as_ref()
            .map(|request| request.token() == msg.token())
            .unwrap_or(false);
        if !matches_token {
            debug!("response {} from {} with unknown token, dropping", msg.message_id(), self.peer_addr);
            return Callback::None;
        }

        // Continue acknowledges one block of an outbound request transfer
        if msg.code() == MessageCode::Response(ResponseStatus::Continue) {
            return self.handle_upload_continue(inner).await;
        }

        self.handle_response_content(inner, msg).await
    }

    async fn handle_upload_continue(self: &Arc<Self>, inner: &mut ChannelInner) -> Callback {
        let mut next = None;
        match &mut inner.block_context {
            Some(BlockContext::SendingRequest { template, source }) => {
                if let Some((block, data)) = source.block(source.next_block_num()) {
                    source.advance();
                    next = Some((template.clone(), block, data));
                }
            }
            _ => debug!("Continue from {} without an upload in progress, dropping", self.peer_addr),
        }

        if let Some((template, block, data)) = next {
            let built = self.upload_block_request(template, block, data);
            self.enqueue_or_log(inner, built).await;
        }
        Callback::None
    }

    fn upload_block_request(&self, mut template: Message, block: BlockOption, data: Vec<u8>) -> anyhow::Result<Message> {
        template.set_message_id(self.ids.next_message_id());
        template.set_block1(block)?;
        template.set_payload(data);
        Ok(template)
    }

    async fn on_inbound_rst(self: &Arc<Self>, msg: Message) {
        let now = Instant::now();
        let callback;
        {
            let mut inner = self.inner.write().await;

            if inner.seen_replies.contains_key(&msg.message_id()) {
                debug!("duplicate RST {} from {}, suppressed", msg.message_id(), self.peer_addr);
                return;
            }
            inner.seen_replies.insert(msg.message_id(), now + self.config.ack_dedup_window);

            if let Some(confirmed) = inner.outstanding.remove(&msg.message_id()) {
                confirmed.store(true, Ordering::Release);
            }
            // the peer gave up on the exchange, any transfer with it is dead
            inner.block_context = None;

            callback = match &self.role {
                ChannelRole::Client(_) => Callback::ConnectionFailed { not_reachable: false, reset_by_peer: true },
                ChannelRole::Server(_) => Callback::Reset(msg.message_id()),
            };
        }
        self.invoke(callback).await;
    }

    /// Called by the worker when a confirmable message ran out of retransmissions.
    pub async fn on_transmission_expired(self: &Arc<Self>, message_id: MessageId) {
        warn!("message {} to {} ran out of retransmissions", message_id, self.peer_addr);
        let callback;
        {
            let mut inner = self.inner.write().await;
            inner.outstanding.remove(&message_id);
            inner.block_context = None;

            callback = match &self.role {
                ChannelRole::Client(_) => Callback::ConnectionFailed { not_reachable: true, reset_by_peer: false },
                ChannelRole::Server(_) => Callback::SeparateResponseFailed,
            };
        }
        self.invoke(callback).await;
    }

    /// drops expired duplicate detection and reply cache entries
    pub async fn sweep(&self, now: Instant) {
        let mut inner = self.inner.write().await;
        inner.seen_messages.retain(|_, expiry| *expiry > now);
        inner.seen_replies.retain(|_, expiry| *expiry > now);
        inner.reply_cache.retain(|_, cached| cached.expires > now);
    }

    async fn invoke(self: &Arc<Self>, callback: Callback) {
        match callback {
            Callback::None => {}
            Callback::Response(msg) => {
                if let ChannelRole::Client(handler) = &self.role {
                    handler.on_response(self.clone(), msg).await;
                }
            }
            Callback::Request(msg) => {
                if let ChannelRole::Server(handler) = &self.role {
                    handler.on_request(self.clone(), msg).await;
                }
            }
            Callback::ConnectionFailed { not_reachable, reset_by_peer } => {
                if let ChannelRole::Client(handler) = &self.role {
                    handler.on_connection_failed(self.clone(), not_reachable, reset_by_peer).await;
                }
            }
            Callback::Reset(message_id) => {
                if let ChannelRole::Server(handler) = &self.role {
                    handler.on_reset(self.clone(), message_id).await;
                }
            }
            Callback::SeparateResponseFailed => {
                if let ChannelRole::Server(handler) = &self.role {
                    handler.on_separate_response_failed(self.clone()).await;
                }
            }
        }
    }
}
