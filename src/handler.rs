use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::channel::Channel;
use crate::message::Message;
use crate::message_id::MessageId;

/// Callback interface through which a client application receives traffic for a channel it
///  opened via [crate::end_point::EndPoint::connect].
///
/// Implementations are called from the endpoint's worker task and should hand off real work
///  quickly to keep the endpoint responsive.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientHandler: 'static + Send + Sync {
    /// A response to this channel's last request arrived, either piggybacked on the ACK or
    ///  as a separate response. Blockwise responses are reassembled before this is called.
    async fn on_response(&self, channel: Arc<Channel>, response: Message);

    /// The channel's last exchange failed. `not_reachable` is set when a confirmable message
    ///  ran out of retransmissions, `reset_by_peer` when the peer answered with RST.
    async fn on_connection_failed(&self, channel: Arc<Channel>, not_reachable: bool, reset_by_peer: bool);
}

/// Callback interface through which a server application receives requests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerHandler: 'static + Send + Sync {
    /// Decides whether a request from a previously unknown peer gets a channel. Returning
    ///  false rejects the request, and confirmable requests are answered with RST.
    async fn on_accept(&self, request: &Message) -> bool;

    /// A request arrived on an accepted channel. Blockwise requests are reassembled before
    ///  this is called.
    async fn on_request(&self, channel: Arc<Channel>, request: Message);

    /// the peer rejected a message of this channel with RST
    async fn on_reset(&self, channel: Arc<Channel>, message_id: MessageId);

    /// a separate response ran out of retransmissions
    async fn on_separate_response_failed(&self, channel: Arc<Channel>);
}
