//! In-process broadcast of result and log events to subscribed observers.
//!
//! Best-effort fan-out: each subscriber gets a channel of capacity one,
//! and a subscriber that cannot keep up (or has gone away) is dropped on
//! the next broadcast. Publishers never block on observers.

use crate::constants::EVENT_BUFFER_SIZE;
use crate::models::Event;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::debug;

pub type SubscriberId = u64;

#[derive(Clone)]
pub struct EventHub {
    subscribers: Arc<RwLock<HashMap<SubscriberId, mpsc::Sender<Event>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(id, tx);
        debug!("subscriber {} attached ({} total)", id, subscribers.len());
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: SubscriberId) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.remove(&id);
        debug!("subscriber {} detached ({} total)", id, subscribers.len());
    }

    /// Delivers the event to every live subscriber. Subscribers whose
    /// channel is full or closed are disconnected.
    pub async fn broadcast(&self, event: Event) {
        let dead: Vec<SubscriberId> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .filter(|(_, tx)| tx.try_send(event.clone()).is_err())
                .map(|(id, _)| *id)
                .collect()
        };
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
                debug!("subscriber {} dropped as unresponsive", id);
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
