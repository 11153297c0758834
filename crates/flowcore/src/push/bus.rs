use super::PushMessage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// What to discard when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room. Keeps a lagging UI on
    /// the most recent progress.
    #[default]
    DropOldest,
    /// Refuse the incoming message.
    DropNewest,
}

/// Fan-out of push messages to live subscribers.
///
/// Every subscriber owns a bounded queue. Publishing appends to each queue
/// and never waits, so a stalled subscriber cannot hold up the engine or the
/// other subscribers.
#[derive(Clone)]
pub struct PushBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    capacity: usize,
    policy: OverflowPolicy,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Arc<Queue>>>,
}

struct Queue {
    id: u64,
    session_id: Option<String>,
    buffer: Mutex<VecDeque<PushMessage>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Queue {
    fn push(&self, message: PushMessage, capacity: usize, policy: OverflowPolicy) {
        {
            let mut buffer = lock(&self.buffer);
            if buffer.len() >= capacity {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    "Push subscriber {} full, dropping ({:?}, {} dropped so far)",
                    self.id,
                    policy,
                    dropped
                );
                match policy {
                    OverflowPolicy::DropOldest => {
                        buffer.pop_front();
                    }
                    OverflowPolicy::DropNewest => return,
                }
            }
            buffer.push_back(message);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

impl PushBus {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                policy,
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Receive every broadcast message.
    pub fn subscribe(&self) -> Subscription {
        self.add_subscriber(None)
    }

    /// Receive broadcast messages plus those targeted at `session_id`.
    pub fn subscribe_session(&self, session_id: impl Into<String>) -> Subscription {
        self.add_subscriber(Some(session_id.into()))
    }

    fn add_subscriber(&self, session_id: Option<String>) -> Subscription {
        let queue = Arc::new(Queue {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            session_id,
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        lock(&self.inner.subscribers).push(queue.clone());
        tracing::debug!("Push subscriber {} attached", queue.id);
        Subscription { queue }
    }

    pub fn publish(&self, message: PushMessage) {
        self.dispatch(None, message);
    }

    /// Deliver to one UI session. Subscribers without a session see it too.
    pub fn publish_to(&self, session_id: &str, message: PushMessage) {
        self.dispatch(Some(session_id), message);
    }

    fn dispatch(&self, target: Option<&str>, message: PushMessage) {
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.retain(|queue| !queue.closed.load(Ordering::Acquire));
        for queue in subscribers.iter() {
            if let (Some(target), Some(session)) = (target, queue.session_id.as_deref()) {
                if target != session {
                    continue;
                }
            }
            queue.push(message.clone(), self.inner.capacity, self.inner.policy);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers)
            .iter()
            .filter(|queue| !queue.closed.load(Ordering::Acquire))
            .count()
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        for queue in lock(&self.subscribers).iter() {
            queue.close();
        }
    }
}

/// Receiving end of a [`PushBus`] subscription.
pub struct Subscription {
    queue: Arc<Queue>,
}

impl Subscription {
    /// Next message in publication order. `None` once the bus is gone and the
    /// queue has drained.
    pub async fn recv(&mut self) -> Option<PushMessage> {
        loop {
            if let Some(message) = self.try_recv() {
                return Some(message);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<PushMessage> {
        lock(&self.queue.buffer).pop_front()
    }

    /// Messages discarded for this subscriber because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.queue.session_id.as_deref()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::{ConsoleMessage, TestWebhook};
    use uuid::Uuid;

    fn console(n: usize) -> PushMessage {
        PushMessage::SendConsoleMessage(ConsoleMessage {
            source: "test".to_string(),
            message: n.to_string(),
        })
    }

    fn drain(sub: &mut Subscription) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(PushMessage::SendConsoleMessage(m)) = sub.try_recv() {
            out.push(m.message);
        }
        out
    }

    #[test]
    fn drop_oldest_keeps_the_newest_messages() {
        let bus = PushBus::new(3, OverflowPolicy::DropOldest);
        let mut slow = bus.subscribe();
        for n in 0..5 {
            bus.publish(console(n));
        }
        assert_eq!(drain(&mut slow), vec!["2", "3", "4"]);
        assert_eq!(slow.dropped(), 2);
    }

    #[test]
    fn drop_newest_keeps_the_oldest_messages() {
        let bus = PushBus::new(3, OverflowPolicy::DropNewest);
        let mut slow = bus.subscribe();
        for n in 0..5 {
            bus.publish(console(n));
        }
        assert_eq!(drain(&mut slow), vec!["0", "1", "2"]);
        assert_eq!(slow.dropped(), 2);
    }

    #[test]
    fn a_full_subscriber_does_not_affect_others() {
        let bus = PushBus::new(2, OverflowPolicy::DropOldest);
        let mut stalled = bus.subscribe();
        let mut active = bus.subscribe();
        for n in 0..4 {
            bus.publish(console(n));
            assert_eq!(drain(&mut active), vec![n.to_string()]);
        }
        assert_eq!(drain(&mut stalled), vec!["2", "3"]);
    }

    #[test]
    fn targeted_messages_reach_only_their_session() {
        let bus = PushBus::new(8, OverflowPolicy::DropOldest);
        let mut mine = bus.subscribe_session("a");
        let mut theirs = bus.subscribe_session("b");
        let mut observer = bus.subscribe();

        let msg = PushMessage::TestWebhookReceived(TestWebhook {
            execution_id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
        });
        bus.publish_to("a", msg.clone());

        assert_eq!(mine.try_recv(), Some(msg.clone()));
        assert_eq!(theirs.try_recv(), None);
        assert_eq!(observer.try_recv(), Some(msg));
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let bus = PushBus::new(4, OverflowPolicy::DropOldest);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        bus.publish(console(0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn recv_wakes_on_publish_and_ends_with_the_bus() {
        let bus = PushBus::new(4, OverflowPolicy::DropOldest);
        let mut sub = bus.subscribe();

        let publisher = bus.clone();
        let handle = tokio::spawn(async move {
            publisher.publish(console(7));
        });
        let received = sub.recv().await;
        handle.await.unwrap();
        assert_eq!(received, Some(console(7)));

        drop(bus);
        assert_eq!(sub.recv().await, None);
    }
}
