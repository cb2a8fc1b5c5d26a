//! In-process publish/subscribe keyed by per-user topics.
//!
//! Every connected user holds exactly one subscription on `user:<id>:msgs`, no
//! matter how many conversations they are in. Delivering into a conversation
//! therefore costs one publish per member.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    task::{Context, Poll},
};

use futures_util::Stream;
use tokio::sync::mpsc;

pub type Payload = Arc<str>;

pub fn user_topic(user_id: i64) -> String {
    format!("user:{user_id}:msgs")
}

#[derive(Default)]
pub struct FanoutBus {
    topics: Mutex<HashMap<String, HashMap<u64, mpsc::UnboundedSender<Payload>>>>,
    next_id: AtomicU64,
}

impl FanoutBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns how many live subscribers received the payload.
    pub fn publish(&self, topic: &str, payload: Payload) -> usize {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = topics.get_mut(topic) else {
            return 0;
        };

        subscribers.retain(|_, tx| tx.send(payload.clone()).is_ok());
        let delivered = subscribers.len();
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        delivered
    }

    pub fn subscribe(self: &Arc<Self>, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_owned())
            .or_default()
            .insert(id, tx);

        Subscription {
            bus: Arc::clone(self),
            topic: topic.to_owned(),
            id,
            rx,
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, HashMap::len)
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// Unbounded stream of payloads for one topic; unsubscribes when dropped.
pub struct Subscription {
    bus: Arc<FanoutBus>,
    topic: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Payload>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Payload;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Payload>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.topic, self.id);
    }
}
