//! Fan-out hub broadcasting live bucket payloads to websocket subscribers.
//!
//! Every subscriber gets its own bounded queue. `broadcast` uses `try_send`:
//! when a subscriber's queue is full the new message is dropped for that
//! subscriber only, so a slow consumer can never block the aggregator.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

pub struct FanoutSubscriber {
    pub id: u64,
    pub receiver: mpsc::Receiver<String>,
}

pub struct FanoutHub {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl FanoutHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(64),
        }
    }

    pub fn subscribe(&self) -> FanoutSubscriber {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().expect("hub lock poisoned").insert(id, tx);
        debug!("Hub subscriber {} attached", id);
        FanoutSubscriber { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.lock().expect("hub lock poisoned").remove(&id).is_some() {
            debug!("Hub subscriber {} detached", id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("hub lock poisoned").len()
    }

    /// Serialize once, enqueue everywhere. Never blocks the caller.
    pub fn broadcast(&self, payload: &Value) {
        let message = payload.to_string();
        let mut disconnected = Vec::new();
        {
            let subscribers = self.subscribers.lock().expect("hub lock poisoned");
            for (id, tx) in subscribers.iter() {
                match tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Hub subscriber {} queue full, dropping message", id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        disconnected.push(*id);
                    }
                }
            }
        }
        for id in disconnected {
            self.unsubscribe(id);
        }
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
