//! Typed worker-to-UI events.
//!
//! Workers (sweep engine, data logger) never touch UI state. They publish events through
//! an [`EventDistributor`], and every front-end subscribes with its own bounded queue.

use crate::data_logger::LogEvent;
use crate::sweep::SweepEvent;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Default per-subscriber queue length.
pub const DEFAULT_CAPACITY: usize = 256;

struct Subscriber<T> {
    sender: mpsc::Sender<T>,
    dropped: u64,
}

/// Broadcasts values to any number of bounded `mpsc` subscribers without backpressure.
///
/// Sends use `try_send`: an event for a subscriber whose queue is full is dropped and
/// counted, so a stalled front-end never blocks the worker publishing the event. A
/// subscriber whose receiver was dropped is removed on the next broadcast.
pub struct EventDistributor<T: Clone> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
    capacity: usize,
}

impl<T: Clone> Default for EventDistributor<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T: Clone> std::fmt::Debug for EventDistributor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDistributor")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl<T: Clone> EventDistributor<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// New subscriber queue.
    pub async fn subscribe(&self) -> mpsc::Receiver<T> {
        let (sender, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .await
            .push(Subscriber { sender, dropped: 0 });
        rx
    }

    /// Offer `event` to every subscriber. Never waits for room in a queue.
    pub async fn broadcast(&self, event: T) {
        let mut subscribers = self.subscribers.lock().await;

        subscribers.retain_mut(|sub| match sub.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if sub.dropped == 0 {
                    warn!(
                        capacity = self.capacity,
                        "Event subscriber is not draining; dropping events"
                    );
                }
                sub.dropped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(dropped = sub.dropped, "Event subscriber disconnected");
                false
            }
        });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Events dropped so far because a live subscriber's queue was full.
    pub async fn dropped_count(&self) -> u64 {
        self.subscribers.lock().await.iter().map(|s| s.dropped).sum()
    }
}

/// Everything a front-end may receive from a bench session.
#[derive(Debug, Clone)]
pub enum BenchEvent {
    Sweep(SweepEvent),
    Log(LogEvent),
}
