use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lantern_control_plane::StatusEvent;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

pub type SubscriptionId = u64;

/// Identifies one subscription for `unsubscribe`. Cheap to clone and valid
/// after the subscription is gone.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionHandle {
    pub device_id: String,
    pub id: SubscriptionId,
}

struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::Sender<StatusEvent>,
    dropped: Arc<AtomicU64>,
}

/// Per-device fan-out of status events. Publishing never waits on a
/// subscriber: a full queue loses that event for that subscriber only.
pub struct StatusBroadcaster {
    queue_capacity: usize,
    next_id: AtomicU64,
    total_dropped: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl StatusBroadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            next_id: AtomicU64::new(1),
            total_dropped: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(self: &Arc<Self>, device_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers
            .lock()
            .entry(device_id.to_string())
            .or_default()
            .push(Subscriber {
                id,
                sender,
                dropped: dropped.clone(),
            });
        debug!(device_id, subscription_id = id, "status subscription opened");
        Subscription {
            handle: SubscriptionHandle {
                device_id: device_id.to_string(),
                id,
            },
            receiver,
            dropped,
            broadcaster: Arc::downgrade(self),
        }
    }

    /// Returns `true` if the subscription was still registered.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(&handle.device_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|subscriber| subscriber.id != handle.id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(&handle.device_id);
        }
        if removed {
            debug!(
                device_id = %handle.device_id,
                subscription_id = handle.id,
                "status subscription closed"
            );
        }
        removed
    }

    /// Deliver `event` to every subscriber of its device. Returns how many
    /// subscribers accepted it.
    pub fn publish(&self, event: &StatusEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(&event.device_id) else {
            return 0;
        };
        let mut delivered = 0;
        list.retain(|subscriber| match subscriber.sender.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                self.total_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    device_id = %event.device_id,
                    subscription_id = subscriber.id,
                    phase = %event.phase,
                    "subscriber queue full; dropping status event"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if list.is_empty() {
            subscribers.remove(&event.device_id);
        }
        delivered
    }

    pub fn subscriber_count(&self, device_id: &str) -> usize {
        self.subscribers
            .lock()
            .get(device_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }
}

/// Receiving end of one subscription, owned by the connection that opened it.
/// Dropping it unsubscribes.
pub struct Subscription {
    handle: SubscriptionHandle,
    receiver: mpsc::Receiver<StatusEvent>,
    dropped: Arc<AtomicU64>,
    broadcaster: Weak<StatusBroadcaster>,
}

impl Subscription {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn device_id(&self) -> &str {
        &self.handle.device_id
    }

    /// Events this subscriber lost to a full queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(&self) -> bool {
        self.broadcaster
            .upgrade()
            .map(|broadcaster| broadcaster.unsubscribe(&self.handle))
            .unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
