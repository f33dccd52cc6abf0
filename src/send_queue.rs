use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use crate::channel::Channel;
use crate::codes::PacketType;
use crate::message_id::MessageId;

/// Retransmission bookkeeping for a queued confirmable message.
pub struct RetransmitState {
    /// number of times the message was already sent
    pub attempt: u32,
    /// the timeout that is applied after the next send, doubling with every retransmission
    pub timeout: Duration,
    /// set when a matching ACK / RST arrived, which retires the queue entry
    pub confirmed: Arc<AtomicBool>,
}

/// A serialized message waiting in the send queue. Ordering is by due time, with a sequence
///  number as tie breaker so that entries with equal due times keep insertion order.
pub struct QueuedMessage {
    pub due: Instant,
    seq: u64,
    pub channel: Arc<Channel>,
    pub datagram: Vec<u8>,
    pub message_id: MessageId,
    pub packet_type: PacketType,
    pub retransmit: Option<RetransmitState>,
}

impl QueuedMessage {
    pub fn new(
        due: Instant,
        channel: Arc<Channel>,
        datagram: Vec<u8>,
        message_id: MessageId,
        packet_type: PacketType,
        retransmit: Option<RetransmitState>,
    ) -> QueuedMessage {
        QueuedMessage {
            due,
            seq: 0,
            channel,
            datagram,
            message_id,
            packet_type,
            retransmit,
        }
    }
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due)
            .then(self.seq.cmp(&other.seq))
    }
}

/// The send queue of an endpoint: all outbound messages of all channels, ordered by the time
///  they are (next) due. The worker task is the only consumer; channels produce entries and
///  wake the worker through [SendQueue::enqueue].
pub struct SendQueue {
    queue: Mutex<BinaryHeap<Reverse<QueuedMessage>>>,
    notify: Notify,
    seq: AtomicU64,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub async fn enqueue(&self, mut entry: QueuedMessage) {
        entry.seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        {
            let mut queue = self.queue.lock().await;
            queue.push(Reverse(entry));
        }
        self.notify.notify_one();
    }

    /// the due time of the earliest entry, if any
    pub async fn next_due(&self) -> Option<Instant> {
        self.queue.lock().await
            .peek()
            .map(|Reverse(entry)| entry.due)
    }

    /// removes and returns the earliest entry if it is due at `now`
    pub async fn pop_due(&self, now: Instant) -> Option<QueuedMessage> {
        let mut queue = self.queue.lock().await;
        let is_due = match queue.peek() {
            Some(Reverse(entry)) => entry.due <= now,
            None => false,
        };
        if is_due {
            queue.pop().map(|Reverse(entry)| entry)
        }
        else {
            None
        }
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Completes when the queue may have changed. Callers must re-check the queue afterwards,
    ///  a completed wait is only a hint.
    pub async fn wait_for_change(&self) {
        self.notify.notified().await
    }

    /// wakes the worker without enqueueing anything, e.g. on shutdown
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::runtime::Builder;
    use rstest::rstest;
    use crate::channel::{Channel, ChannelRole};
    use crate::config::CoapConfig;
    use crate::handler::MockClientHandler;
    use crate::registry::IdGenerator;

    fn test_channel(queue: &Arc<SendQueue>) -> Arc<Channel> {
        let addr: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        Arc::new(Channel::new(
            addr,
            ChannelRole::Client(Arc::new(MockClientHandler::new())),
            Arc::new(CoapConfig::default_for(addr)),
            Arc::new(IdGenerator::starting_at(1, 1)),
            queue.clone(),
        ))
    }

    fn entry(queue: &Arc<SendQueue>, due: Instant, marker: u8) -> QueuedMessage {
        QueuedMessage::new(
            due,
            test_channel(queue),
            vec![marker],
            MessageId::from_raw(marker as u16),
            PacketType::Con,
            None,
        )
    }

    #[rstest]
    fn test_ordering_by_due_time() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let queue = Arc::new(SendQueue::new());
            let now = Instant::now();

            queue.enqueue(entry(&queue, now + Duration::from_millis(500), 2)).await;
            queue.enqueue(entry(&queue, now, 1)).await;
            queue.enqueue(entry(&queue, now + Duration::from_secs(2), 3)).await;

            assert_eq!(queue.next_due().await, Some(now));

            assert_eq!(queue.pop_due(now).await.unwrap().datagram, vec![1]);
            assert!(queue.pop_due(now).await.is_none());

            let later = now + Duration::from_secs(1);
            assert_eq!(queue.pop_due(later).await.unwrap().datagram, vec![2]);
            assert!(queue.pop_due(later).await.is_none());
            assert_eq!(queue.len().await, 1);
        });
    }

    #[rstest]
    fn test_equal_due_times_keep_insertion_order() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let queue = Arc::new(SendQueue::new());
            let now = Instant::now();

            for marker in 1..=4u8 {
                queue.enqueue(entry(&queue, now, marker)).await;
            }
            for marker in 1..=4u8 {
                assert_eq!(queue.pop_due(now).await.unwrap().datagram, vec![marker]);
            }
        });
    }

    #[rstest]
    fn test_enqueue_wakes_waiter() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let queue = Arc::new(SendQueue::new());

            let waiter = {
                let queue = queue.clone();
                tokio::spawn(async move {
                    queue.wait_for_change().await;
                })
            };
            tokio::task::yield_now().await;

            queue.enqueue(entry(&queue, Instant::now(), 1)).await;
            tokio::time::timeout(Duration::from_secs(1), waiter).await
                .expect("waiter was not woken")
                .unwrap();
        });
    }
}
