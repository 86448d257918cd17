//! EventBus: in-process fan-out of task events.
//!
//! Every subscriber owns an unbounded queue, so `publish` never waits on a
//! slow consumer. Publishing happens from a single router task, which keeps
//! the per-task order identical for all subscribers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{SubscriptionId, TaskEvent};
use crate::ports::IdGenerator;

type Subscribers = Vec<(SubscriptionId, mpsc::UnboundedSender<TaskEvent>)>;

/// A live subscription: its id plus the receiving end of its queue.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<TaskEvent>,
}

impl Subscription {
    /// Next event, or `None` once unsubscribed (after draining what was queued).
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
    ids: Arc<dyn IdGenerator>,
}

impl EventBus {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            ids,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.ids.generate_subscription_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push((id, tx));
        debug!(subscription = %id, "subscribed");
        Subscription { id, rx }
    }

    /// Stop delivering to `id`. Events already queued stay readable.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        let removed = subscribers.len() != before;
        if removed {
            debug!(subscription = %id, "unsubscribed");
        }
        removed
    }

    /// Deliver `event` to every subscriber, in registration order.
    ///
    /// Subscribers whose receiver was dropped are pruned.
    pub fn publish(&self, event: TaskEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|(id, tx)| {
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                debug!(subscription = %id, "dropping closed subscriber");
            }
            delivered
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}
