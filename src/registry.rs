use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use anyhow::bail;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;
use crate::channel::{Channel, ChannelRole};
use crate::config::CoapConfig;
use crate::handler::{ClientHandler, ServerHandler};
use crate::message_id::MessageId;
use crate::send_queue::SendQueue;

/// Source of message ids and tokens for all channels of an endpoint.
///
/// Message ids are drawn from a single counter that starts at a random offset and wraps
///  around at the end of the 16 bit range. Local uniqueness while a message can still be
///  retransmitted comes from the width of the range, reuse is not actively prevented.
pub struct IdGenerator {
    next_message_id: AtomicU16,
    next_token: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> IdGenerator {
        let mut rng = rand::rng();
        IdGenerator {
            next_message_id: AtomicU16::new(rng.random()),
            next_token: AtomicU32::new(rng.random()),
        }
    }

    /// deterministic counter starting points, for tests
    pub fn starting_at(message_id: u16, token: u32) -> IdGenerator {
        IdGenerator {
            next_message_id: AtomicU16::new(message_id),
            next_token: AtomicU32::new(token),
        }
    }

    pub fn next_message_id(&self) -> MessageId {
        MessageId::from_raw(self.next_message_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_token(&self) -> Vec<u8> {
        self.next_token.fetch_add(1, Ordering::Relaxed)
            .to_be_bytes()
            .to_vec()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        IdGenerator::new()
    }
}

/// The channels of an endpoint, keyed by peer address. There is at most one channel per peer,
///  and its role (client or server) is fixed when it is created.
pub struct ChannelRegistry {
    config: Arc<CoapConfig>,
    ids: Arc<IdGenerator>,
    send_queue: Arc<SendQueue>,
    channels: RwLock<FxHashMap<SocketAddr, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new(config: Arc<CoapConfig>, ids: Arc<IdGenerator>, send_queue: Arc<SendQueue>) -> ChannelRegistry {
        ChannelRegistry {
            config,
            ids,
            send_queue,
            channels: RwLock::new(FxHashMap::default()),
        }
    }

    /// Returns the client channel for a peer, creating it if necessary. Fails if the peer
    ///  already has a channel in the server role.
    pub async fn get_or_create_client(&self, peer_addr: SocketAddr, handler: Arc<dyn ClientHandler>) -> anyhow::Result<Arc<Channel>> {
        let mut channels = self.channels.write().await;
        if let Some(existing) = channels.get(&peer_addr) {
            if existing.is_server() {
                bail!("peer {} already has a channel in the server role", peer_addr);
            }
            return Ok(existing.clone());
        }

        debug!("creating client channel for peer {}", peer_addr);
        let channel = Arc::new(Channel::new(
            peer_addr,
            ChannelRole::Client(handler),
            self.config.clone(),
            self.ids.clone(),
            self.send_queue.clone(),
        ));
        channels.insert(peer_addr, channel.clone());
        Ok(channel)
    }

    /// Registers a server channel for a peer whose request was accepted. If a channel for
    ///  the peer exists by now, that one wins regardless of its role.
    pub async fn register_server(&self, peer_addr: SocketAddr, handler: Arc<dyn ServerHandler>) -> Arc<Channel> {
        let mut channels = self.channels.write().await;
        if let Some(existing) = channels.get(&peer_addr) {
            return existing.clone();
        }

        debug!("creating server channel for peer {}", peer_addr);
        let channel = Arc::new(Channel::new(
            peer_addr,
            ChannelRole::Server(handler),
            self.config.clone(),
            self.ids.clone(),
            self.send_queue.clone(),
        ));
        channels.insert(peer_addr, channel.clone());
        channel
    }

    pub async fn resolve(&self, peer_addr: SocketAddr) -> Option<Arc<Channel>> {
        self.channels.read().await
            .get(&peer_addr)
            .cloned()
    }

    pub async fn remove(&self, peer_addr: SocketAddr) -> Option<Arc<Channel>> {
        self.channels.write().await
            .remove(&peer_addr)
    }

    pub async fn all(&self) -> Vec<Arc<Channel>> {
        self.channels.read().await
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Builder;
    use rstest::rstest;
    use crate::handler::{MockClientHandler, MockServerHandler};

    #[rstest]
    fn test_message_id_full_cycle() {
        let ids = IdGenerator::starting_at(0, 0);
        for expected in 0..=u16::MAX {
            assert_eq!(ids.next_message_id(), MessageId::from_raw(expected));
        }
        // the counter wraps around to the beginning of the range
        assert_eq!(ids.next_message_id(), MessageId::from_raw(0));
        assert_eq!(ids.next_message_id(), MessageId::from_raw(1));
    }

    #[rstest]
    fn test_message_id_wrap_at_max() {
        let ids = IdGenerator::starting_at(0xfffe, 0);
        assert_eq!(ids.next_message_id(), MessageId::from_raw(0xfffe));
        assert_eq!(ids.next_message_id(), MessageId::from_raw(0xffff));
        assert_eq!(ids.next_message_id(), MessageId::from_raw(0));
    }

    #[rstest]
    fn test_tokens() {
        let ids = IdGenerator::starting_at(0, 0x01020304);
        assert_eq!(ids.next_token(), vec![1, 2, 3, 4]);
        assert_eq!(ids.next_token(), vec![1, 2, 3, 5]);
    }

    fn test_registry() -> ChannelRegistry {
        let addr: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        ChannelRegistry::new(
            Arc::new(CoapConfig::default_for(addr)),
            Arc::new(IdGenerator::starting_at(1, 1)),
            Arc::new(SendQueue::new()),
        )
    }

    #[rstest]
    fn test_client_channel_reuse() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let registry = test_registry();
            let peer: SocketAddr = "127.0.0.2:5683".parse().unwrap();

            let first = registry.get_or_create_client(peer, Arc::new(MockClientHandler::new())).await.unwrap();
            let second = registry.get_or_create_client(peer, Arc::new(MockClientHandler::new())).await.unwrap();
            assert!(Arc::ptr_eq(&first, &second));

            assert!(Arc::ptr_eq(&registry.resolve(peer).await.unwrap(), &first));
            assert!(registry.resolve("127.0.0.3:5683".parse().unwrap()).await.is_none());
        });
    }

    #[rstest]
    fn test_role_conflict() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let registry = test_registry();
            let peer: SocketAddr = "127.0.0.2:5683".parse().unwrap();

            let server = registry.register_server(peer, Arc::new(MockServerHandler::new())).await;
            assert!(server.is_server());

            assert!(registry.get_or_create_client(peer, Arc::new(MockClientHandler::new())).await.is_err());

            // an existing channel wins over a new server registration
            let again = registry.register_server(peer, Arc::new(MockServerHandler::new())).await;
            assert!(Arc::ptr_eq(&server, &again));
        });
    }

    #[rstest]
    fn test_remove() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let registry = test_registry();
            let peer: SocketAddr = "127.0.0.2:5683".parse().unwrap();

            let channel = registry.get_or_create_client(peer, Arc::new(MockClientHandler::new())).await.unwrap();
            assert!(Arc::ptr_eq(&registry.remove(peer).await.unwrap(), &channel));
            assert!(registry.resolve(peer).await.is_none());
            assert_eq!(registry.all().await.len(), 0);
        });
    }
}
