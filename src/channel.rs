//! Broadcast channel for detection batches.
//!
//! Every subscription owns a bounded queue and sees every batch published
//! after it subscribed. What happens when a queue is full is chosen per
//! subscription:
//!
//! - [`OverflowPolicy::DropOldest`]: evict the oldest queued batch and count
//!   it in [`Subscription::dropped`]. The producer never waits.
//! - [`OverflowPolicy::BlockProducer`]: `publish` waits until the subscriber
//!   reads, unsubscribes, or the channel closes. Nothing is lost.
//!
//! Batches are shared as `Arc<DetectionBatch>`; a subscriber consuming its
//! copy never affects another subscriber's queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::detect::DetectionBatch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    BlockProducer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvError {
    Timeout,
    /// Channel closed and this subscription's queue is empty.
    Closed,
}

impl std::fmt::Display for RecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvError::Timeout => f.write_str("timed out waiting for a detection batch"),
            RecvError::Closed => f.write_str("result channel closed"),
        }
    }
}

impl std::error::Error for RecvError {}

struct SlotState {
    queue: VecDeque<Arc<DetectionBatch>>,
    dropped: u64,
    closed: bool,
    detached: bool,
}

struct Slot {
    id: u64,
    name: String,
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<SlotState>,
    readable: Condvar,
    writable: Condvar,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue per policy. Returns false when the subscriber is gone.
    fn offer(&self, batch: Arc<DetectionBatch>) -> bool {
        let mut state = self.lock();
        if state.detached || state.closed {
            return false;
        }
        if state.queue.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    state.queue.pop_front();
                    state.dropped += 1;
                }
                OverflowPolicy::BlockProducer => {
                    while state.queue.len() >= self.capacity && !state.detached && !state.closed {
                        state = self
                            .writable
                            .wait(state)
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                    }
                    if state.detached || state.closed {
                        return false;
                    }
                }
            }
        }
        state.queue.push_back(batch);
        drop(state);
        self.readable.notify_one();
        true
    }

    fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

struct Shared {
    slots: Mutex<Vec<Arc<Slot>>>,
    closed: AtomicBool,
    published: AtomicU64,
    next_id: AtomicU64,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, Vec<Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Producer handle. Clones publish into the same set of subscriptions.
#[derive(Clone)]
pub struct ResultChannel {
    shared: Arc<Shared>,
}

impl ResultChannel {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                published: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a consumer with its own queue of `capacity` batches (min 1).
    pub fn subscribe(&self, name: &str, capacity: usize, policy: OverflowPolicy) -> Subscription {
        let slot = Arc::new(Slot {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            capacity: capacity.max(1),
            policy,
            state: Mutex::new(SlotState {
                queue: VecDeque::with_capacity(capacity.max(1)),
                dropped: 0,
                closed: self.is_closed(),
                detached: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        });
        let mut slots = self.shared.slots();
        // Re-check under the lock so a concurrent close cannot miss this slot.
        if self.is_closed() {
            slot.lock().closed = true;
        } else {
            slots.push(Arc::clone(&slot));
        }
        drop(slots);
        log::debug!(
            "result channel: '{}' subscribed (capacity {}, {:?})",
            slot.name,
            slot.capacity,
            slot.policy
        );
        Subscription {
            slot,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Deliver `batch` to every current subscription.
    ///
    /// May block on `BlockProducer` subscriptions. Returns how many
    /// subscriptions accepted the batch; 0 after `close`.
    pub fn publish(&self, batch: DetectionBatch) -> usize {
        if self.is_closed() {
            return 0;
        }
        let batch = Arc::new(batch);
        let slots: Vec<Arc<Slot>> = self.shared.slots().clone();
        let delivered = slots
            .iter()
            .filter(|slot| slot.offer(Arc::clone(&batch)))
            .count();
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Stop accepting batches. Subscribers drain what is queued, then see `Closed`.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let slots: Vec<Arc<Slot>> = self.shared.slots().clone();
        for slot in slots {
            slot.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.slots().len()
    }

    pub fn has_blocking_subscribers(&self) -> bool {
        self.shared
            .slots()
            .iter()
            .any(|slot| slot.policy == OverflowPolicy::BlockProducer)
    }

    /// Batches published since creation.
    pub fn published(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }
}

impl Default for ResultChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer handle. Dropping it unsubscribes and releases a blocked producer.
pub struct Subscription {
    slot: Arc<Slot>,
    shared: Arc<Shared>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.slot.policy
    }

    /// Block until a batch arrives. `None` once closed and drained.
    pub fn recv(&self) -> Option<Arc<DetectionBatch>> {
        let mut state = self.slot.lock();
        loop {
            if let Some(batch) = state.queue.pop_front() {
                drop(state);
                self.slot.writable.notify_one();
                return Some(batch);
            }
            if state.closed {
                return None;
            }
            state = self
                .slot
                .readable
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Arc<DetectionBatch>, RecvError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.lock();
        loop {
            if let Some(batch) = state.queue.pop_front() {
                drop(state);
                self.slot.writable.notify_one();
                return Ok(batch);
            }
            if state.closed {
                return Err(RecvError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RecvError::Timeout);
            }
            state = self
                .slot
                .readable
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    pub fn try_recv(&self) -> Option<Arc<DetectionBatch>> {
        let batch = self.slot.lock().queue.pop_front();
        if batch.is_some() {
            self.slot.writable.notify_one();
        }
        batch
    }

    /// Take everything currently queued.
    pub fn drain(&self) -> Vec<Arc<DetectionBatch>> {
        let drained: Vec<_> = self.slot.lock().queue.drain(..).collect();
        self.slot.writable.notify_all();
        drained
    }

    pub fn len(&self) -> usize {
        self.slot.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batches evicted by the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.slot.lock().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        {
            let mut state = self.slot.lock();
            state.detached = true;
            state.queue.clear();
        }
        self.slot.writable.notify_all();
        self.shared.slots().retain(|slot| slot.id != self.slot.id);
        log::debug!("result channel: '{}' unsubscribed", self.slot.name);
    }
}
