use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::protocol::{EventFilter, TaskEvent};

/// A filtered broadcast bus built on top of flume channels.
///
/// Every subscriber owns a queue of at most `queue_cap` undelivered events
/// (`0` means unbounded). Publishing never blocks: a subscriber whose queue
/// is full is removed from the bus and flagged as truncated, so a slow
/// consumer can never stall the task that produces the events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    queue_cap: usize,
}

struct BusInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    id: u64,
    filter: EventFilter,
    tx: flume::Sender<TaskEvent>,
    truncated: Arc<AtomicBool>,
}

impl EventBus {
    /// Create a bus with unbounded subscriber queues.
    pub fn new() -> Self {
        Self::with_queue_cap(0)
    }

    pub fn with_queue_cap(queue_cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 1,
                subscribers: Vec::new(),
            })),
            queue_cap,
        }
    }

    pub fn queue_cap(&self) -> usize {
        self.queue_cap
    }

    /// Register a subscriber. It receives every matching event published
    /// from this point forward.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (tx, rx) = if self.queue_cap == 0 {
            flume::unbounded()
        } else {
            flume::bounded(self.queue_cap)
        };
        let truncated = Arc::new(AtomicBool::new(false));

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            filter,
            tx,
            truncated: Arc::clone(&truncated),
        });
        tracing::debug!(subscription = id, "subscriber added");

        Subscription {
            id,
            rx,
            truncated,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: u64) -> bool {
        remove_subscriber(&self.inner, id)
    }

    /// Deliver `event` to every matching subscriber.
    ///
    /// Subscribers whose receiver was dropped are pruned. Subscribers whose
    /// queue is full are dropped and marked truncated.
    pub fn publish(&self, event: TaskEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.retain(|sub| {
            if !sub.filter.matches(&event) {
                return !sub.tx.is_disconnected();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    sub.truncated.store(true, Ordering::SeqCst);
                    tracing::warn!(
                        subscription = sub.id,
                        task_id = %event.task_id(),
                        "subscriber queue full, live stream truncated"
                    );
                    false
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
    }

    /// Return the number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_subscriber(inner: &Mutex<BusInner>, id: u64) -> bool {
    let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
    let before = inner.subscribers.len();
    inner.subscribers.retain(|s| s.id != id);
    before != inner.subscribers.len()
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// The receiving side of a bus registration. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: flume::Receiver<TaskEvent>,
    truncated: Arc<AtomicBool>,
    bus: Weak<Mutex<BusInner>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. `None` once the subscription has been removed
    /// from the bus and its queue is drained.
    pub async fn recv(&self) -> Option<TaskEvent> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<TaskEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<TaskEvent> {
        self.rx.drain().collect()
    }

    /// `true` if the bus dropped this subscriber because its queue overflowed.
    pub fn is_truncated(&self) -> bool {
        self.truncated.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            remove_subscriber(&inner, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("queued", &self.rx.len())
            .field("truncated", &self.is_truncated())
            .finish()
    }
}
