//! Job bus: per-agent ordered queues with a blocking pop.
//!
//! Jobs are fanned out as serialized payloads to each agent's queue and
//! delivered in push order within a queue. There is no cross-queue
//! ordering and delivery is at-least-once; the aggregation layer owns
//! deduplication.

use crate::models::TaskJob;
use crate::{ProbeMeshError, Result};
use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

struct BusInner {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    notify: Notify,
}

#[derive(Clone)]
pub struct JobBus {
    inner: Arc<BusInner>,
}

impl JobBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                queues: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Pushes the serialized job to the tail of each key's queue. Pushes
    /// are independent; a failure aborts the remainder without rolling
    /// back keys already pushed.
    pub async fn fan_out(&self, keys: &[String], job: &TaskJob) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        let mut queues = self.inner.queues.lock().await;
        let mut aborted = None;
        for key in keys {
            if key.is_empty() {
                aborted = Some(ProbeMeshError::Bus {
                    message: "empty queue key in fan-out".to_string(),
                });
                break;
            }
            queues
                .entry(key.clone())
                .or_default()
                .push_back(payload.clone());
            debug!("fan-out task {} to queue {}", job.task_id, key);
        }
        drop(queues);
        // Wake waiters even on abort; keys pushed before the failure stay
        // pushed.
        self.inner.notify.notify_waiters();
        match aborted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Blocks until any of the listed keys has an element, then pops and
    /// returns `(key, payload)`. Keys are checked in the order given.
    pub async fn blocking_pop(&self, keys: &[String]) -> (String, String) {
        loop {
            // Register for wakeups before checking so a push between the
            // check and the await is not lost.
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            {
                let mut queues = self.inner.queues.lock().await;
                for key in keys {
                    if let Some(payload) = queues.get_mut(key).and_then(|q| q.pop_front()) {
                        return (key.clone(), payload);
                    }
                }
            }
            notified.await;
        }
    }

    /// Queue depth for a key; absent keys are empty.
    pub async fn len(&self, key: &str) -> usize {
        let queues = self.inner.queues.lock().await;
        queues.get(key).map(|q| q.len()).unwrap_or(0)
    }
}

impl Default for JobBus {
    fn default() -> Self {
        Self::new()
    }
}
