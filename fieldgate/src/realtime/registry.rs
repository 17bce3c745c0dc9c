//! Live streaming subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Lifecycle of a subscriber: `Open -> Closing -> Closed`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriberState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl SubscriberState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SubscriberState::Open,
            1 => SubscriberState::Closing,
            _ => SubscriberState::Closed,
        }
    }
}

/// Registry entry for one connection.
#[derive(Debug)]
pub struct SubscriberHandle {
    id: u64,
    outbound: mpsc::Sender<Arc<str>>,
    state: AtomicU8,
}

impl SubscriberHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SubscriberState {
        SubscriberState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Queue a message without waiting. Fails when the buffer is full or the
    /// connection is gone.
    fn try_send(&self, message: &Arc<str>) -> bool {
        self.state() == SubscriberState::Open && self.outbound.try_send(message.clone()).is_ok()
    }

    /// Move `Open -> Closing`. Returns `false` if the subscriber was not open.
    fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                SubscriberState::Open as u8,
                SubscriberState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn mark_closed(&self) {
        self.state
            .store(SubscriberState::Closed as u8, Ordering::Release);
    }
}

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// Connected subscribers, keyed by id.
///
/// Broadcasts work on a snapshot, so registration and removal never wait
/// for a broadcast in progress.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Arc<SubscriberHandle>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber with an outbound buffer of `buffer` messages.
    pub fn register(&self, buffer: usize) -> (Arc<SubscriberHandle>, mpsc::Receiver<Arc<str>>) {
        let (outbound, rx) = mpsc::channel(buffer.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(SubscriberHandle {
            id,
            outbound,
            state: AtomicU8::new(SubscriberState::Open as u8),
        });

        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.insert(id, handle.clone());
            subscribers.len()
        };
        info!(subscriber = id, count, "Subscriber connected");

        (handle, rx)
    }

    /// Remove a subscriber. Its outbound channel closes once the last
    /// snapshot holding it is gone.
    pub fn remove(&self, id: u64) {
        let removed = self.subscribers.lock().remove(&id);
        if let Some(handle) = removed {
            handle.begin_close();
            handle.mark_closed();
            debug!(subscriber = id, "Subscriber removed");
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<SubscriberHandle>> {
        self.subscribers.lock().values().cloned().collect()
    }

    /// Send `message` to every open subscriber without waiting.
    ///
    /// Subscribers whose send fails are marked `Closing` during the pass and
    /// removed after it.
    pub fn broadcast(&self, message: Arc<str>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for subscriber in self.snapshot() {
            if subscriber.try_send(&message) {
                report.delivered += 1;
            } else if subscriber.begin_close() {
                failed.push(subscriber.id());
            }
        }

        if !failed.is_empty() {
            for id in &failed {
                info!(subscriber = id, "Evicting subscriber that stopped reading");
                self.remove(*id);
            }
            report.evicted = failed.len();
        }

        report
    }

    /// Close every subscriber.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.subscribers.lock().drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.begin_close();
            handle.mark_closed();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Closed all subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_reaches_open_subscribers() {
        let registry = SubscriberRegistry::new();
        let (_a, mut rx_a) = registry.register(4);
        let (_b, mut rx_b) = registry.register(4);

        let report = registry.broadcast(Arc::from("hello"));

        assert_eq!(report.delivered, 2);
        assert_eq!(&*rx_a.try_recv().unwrap(), "hello");
        assert_eq!(&*rx_b.try_recv().unwrap(), "hello");
    }

    #[test]
    fn test_slow_subscriber_is_evicted_without_blocking_others() {
        let registry = SubscriberRegistry::new();
        let (slow, _rx_slow) = registry.register(2);
        let (_fast, mut rx_fast) = registry.register(2);

        for i in 0..5 {
            registry.broadcast(Arc::from(i.to_string()));
            // The fast subscriber keeps draining.
            assert!(rx_fast.try_recv().is_ok());
        }

        assert_eq!(slow.state(), SubscriberState::Closed);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_disconnected_subscriber_is_removed() {
        let registry = SubscriberRegistry::new();
        let (handle, rx) = registry.register(4);
        drop(rx);

        let report = registry.broadcast(Arc::from("x"));

        assert_eq!(report.evicted, 1);
        assert_eq!(handle.state(), SubscriberState::Closed);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_closed_subscriber_stays_closed() {
        let registry = SubscriberRegistry::new();
        let (handle, _rx) = registry.register(4);

        registry.remove(handle.id());
        assert_eq!(handle.state(), SubscriberState::Closed);
        assert!(!handle.begin_close());
        assert!(!handle.try_send(&Arc::from("late")));
    }

    #[tokio::test]
    async fn test_close_all_ends_outbound_streams() {
        let registry = SubscriberRegistry::new();
        let (handle, mut rx) = registry.register(4);
        drop(handle);

        registry.close_all();

        assert!(registry.is_empty());
        assert!(rx.recv().await.is_none());
    }
}
