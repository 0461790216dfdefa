//! Multi-subscriber event fan-out.
//!
//! One producer, many independent consumers. Every subscriber owns an
//! unbounded queue, so a slow consumer buffers instead of losing scene
//! updates and never stalls `notify()` or the other subscribers.
//!
//! ```text
//!                 ┌──────────────► Subscription A ──► cleanup A (once)
//! notify(event) ──┼──────────────► Subscription B ──► cleanup B (once)
//!                 └──────────────► Subscription C ──► cleanup C (once)
//! ```
//!
//! Dropping a `Subscription` (or calling `unsubscribe`) removes it from the
//! channel and runs its cleanup callback exactly once, after the channel
//! lock has been released so the callback may itself call `notify()`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// Statistics for monitoring channel health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub deliveries: u64,
    pub active_subscribers: usize,
}

/// Atomic stats so `notify()` only takes the subscriber-map lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
}

struct Shared<T> {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<T>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    stats: AtomicBroadcastStats,
}

/// A broadcast channel. Cloning yields another handle to the same channel.
pub struct BroadcastChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BroadcastChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Default for BroadcastChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> BroadcastChannel<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                stats: AtomicBroadcastStats {
                    messages_sent: AtomicU64::new(0),
                    deliveries: AtomicU64::new(0),
                },
            }),
        }
    }

    /// Subscribe to every event notified from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        self.register(None)
    }

    /// Subscribe and register a callback that runs once when the
    /// subscription is closed, whoever closes it.
    pub fn subscribe_with_cleanup<F>(&self, cleanup: F) -> Subscription<T>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(Some(Box::new(cleanup)))
    }

    fn register(&self, cleanup: Option<Cleanup>) -> Subscription<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        // A closed channel hands out subscriptions that end immediately.
        // `closed` is read under the map lock so `close()` cannot slip in
        // between the check and the insert.
        let mut subscribers = self.shared.subscribers.lock();
        if !self.shared.closed.load(Ordering::Acquire) {
            subscribers.insert(id, sender);
        }
        drop(subscribers);

        Subscription {
            id,
            receiver,
            channel: Arc::downgrade(&self.shared),
            cleanup,
        }
    }

    /// Deliver `event` to every current subscriber, in call order.
    ///
    /// Never blocks on consumers. Returns the number of subscribers reached.
    pub fn notify(&self, event: T) -> usize {
        let subscribers = self.shared.subscribers.lock();
        let delivered = subscribers
            .values()
            .filter(|sender| sender.send(event.clone()).is_ok())
            .count();
        drop(subscribers);

        self.shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.shared
            .stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// End every subscription stream. Buffered events are still delivered
    /// and each subscription's cleanup still runs when it is dropped.
    pub fn close(&self) {
        let mut subscribers = self.shared.subscribers.lock();
        self.shared.closed.store(true, Ordering::Release);
        subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.shared.stats.messages_sent.load(Ordering::Relaxed),
            deliveries: self.shared.stats.deliveries.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }
}

/// One consumer's handle on a [`BroadcastChannel`].
pub struct Subscription<T> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<T>,
    channel: Weak<Shared<T>>,
    cleanup: Option<Cleanup>,
}

impl<T> Subscription<T> {
    /// Wait for the next event. `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Take a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Explicitly leave the channel. Same as dropping the handle.
    pub fn unsubscribe(self) {}
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.channel.upgrade() {
            shared.subscribers.lock().remove(&self.id);
        }
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let channel = BroadcastChannel::new();
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();
        let mut c = channel.subscribe();

        assert_eq!(channel.notify(7u32), 3);

        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
        assert_eq!(c.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_delivery_preserves_call_order() {
        let channel = BroadcastChannel::new();
        let sub = channel.subscribe();

        for i in 0..100u32 {
            channel.notify(i);
        }
        channel.close();

        let received: Vec<u32> = sub.collect().await;
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_slow_consumer_buffers_without_loss() {
        let channel = BroadcastChannel::new();
        let mut slow = channel.subscribe();
        let mut fast = channel.subscribe();

        for i in 0..10_000u32 {
            channel.notify(i);
            assert_eq!(fast.try_recv(), Some(i));
        }

        let mut count = 0;
        while slow.try_recv().is_some() {
            count += 1;
        }
        assert_eq!(count, 10_000);
    }

    #[tokio::test]
    async fn test_subscriber_sees_only_later_events() {
        let channel = BroadcastChannel::new();
        channel.notify(1u32);
        let mut sub = channel.subscribe();
        channel.notify(2u32);
        assert_eq!(sub.try_recv(), Some(2));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_unsubscribe_does_not_affect_others() {
        let channel = BroadcastChannel::new();
        let a = channel.subscribe();
        let mut b = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);

        a.unsubscribe();
        assert_eq!(channel.subscriber_count(), 1);

        assert_eq!(channel.notify(5u32), 1);
        assert_eq!(b.recv().await, Some(5));
    }

    #[tokio::test]
    async fn test_cleanup_runs_once_on_drop() {
        let channel = BroadcastChannel::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let sub = channel.subscribe_with_cleanup(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_runs_once_after_close() {
        let channel = BroadcastChannel::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut sub = channel.subscribe_with_cleanup(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        channel.notify(1);
        channel.close();

        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_may_notify_same_channel() {
        let channel = BroadcastChannel::new();
        let mut observer = channel.subscribe();

        let notifier = channel.clone();
        let leaving = channel.subscribe_with_cleanup(move || {
            notifier.notify("left");
        });
        drop(leaving);

        assert_eq!(observer.recv().await, Some("left"));
    }

    #[tokio::test]
    async fn test_subscribe_after_close_ends_immediately() {
        let channel = BroadcastChannel::<u32>::new();
        channel.close();
        assert!(channel.is_closed());

        let mut sub = channel.subscribe();
        assert_eq!(channel.notify(1), 0);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_subscribe_racing_close_never_registers() {
        for _ in 0..20 {
            let channel = BroadcastChannel::<u32>::new();
            let start = Arc::new(std::sync::Barrier::new(5));

            let threads: Vec<_> = (0..4)
                .map(|_| {
                    let channel = channel.clone();
                    let start = start.clone();
                    std::thread::spawn(move || {
                        start.wait();
                        (0..200).map(|_| channel.subscribe()).collect::<Vec<_>>()
                    })
                })
                .collect();
            start.wait();
            channel.close();

            let subs: Vec<_> = threads
                .into_iter()
                .flat_map(|thread| thread.join().unwrap())
                .collect();
            assert_eq!(channel.subscriber_count(), 0);
            assert_eq!(channel.notify(1), 0);
            for mut sub in subs {
                assert_eq!(sub.recv().await, None);
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_drop_and_notify() {
        let channel = BroadcastChannel::<u64>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let counter = calls.clone();
            let sub = channel.subscribe_with_cleanup(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            handles.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                drop(sub);
            }));
        }

        let producer = channel.clone();
        let notifier = tokio::spawn(async move {
            for i in 0..1_000 {
                producer.notify(i);
                if i % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });

        for handle in handles {
            handle.await.unwrap();
        }
        notifier.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 32);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let channel = BroadcastChannel::new();
        let _a = channel.subscribe();
        let _b = channel.subscribe();

        channel.notify(1u8);
        channel.notify(2u8);

        let stats = channel.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.deliveries, 4);
        assert_eq!(stats.active_subscribers, 2);
    }
}
