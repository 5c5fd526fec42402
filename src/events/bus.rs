use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::warn;

use super::Event;

/// Which workflows a subscriber wants to hear about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    workflows: Option<HashSet<String>>,
}

impl SubscriptionFilter {
    /// Every workflow.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn workflows<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            workflows: Some(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.workflows
            .as_ref()
            .is_none_or(|ids| ids.contains(&event.workflow_id))
    }

    /// The explicit workflow set, if any.
    pub fn ids(&self) -> Option<&HashSet<String>> {
        self.workflows.as_ref()
    }
}

/// Live fan-out of accepted events.
///
/// Each subscriber owns a bounded ring of `capacity` events holding only the
/// workflows its filter selects, so traffic from other workflows never
/// evicts its events. A subscriber that falls behind loses its oldest queued
/// events; the publisher never waits. Subscribers see events published after
/// they attach, nothing earlier.
#[derive(Clone)]
pub struct EventBus {
    capacity: usize,
    subscribers: Arc<Mutex<Option<Vec<Slot>>>>,
}

struct Slot {
    filter: SubscriptionFilter,
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Push an event to every attached subscriber whose filter matches.
    pub fn publish(&self, event: Event) {
        let Ok(mut guard) = self.subscribers.lock() else {
            return;
        };
        if let Some(slots) = guard.as_mut() {
            slots.retain(|slot| slot.tx.receiver_count() > 0);
            for slot in slots.iter().filter(|slot| slot.filter.matches(&event)) {
                // A full ring overwrites its oldest entry.
                let _ = slot.tx.send(event.clone());
            }
        }
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let rx = self.subscribers.lock().ok().and_then(|mut guard| {
            guard.as_mut().map(|slots| {
                let (tx, rx) = broadcast::channel(self.capacity);
                slots.push(Slot {
                    filter: filter.clone(),
                    tx,
                });
                rx
            })
        });
        Subscription {
            rx,
            filter,
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .ok()
            .and_then(|guard| {
                guard.as_ref().map(|slots| {
                    slots
                        .iter()
                        .filter(|slot| slot.tx.receiver_count() > 0)
                        .count()
                })
            })
            .unwrap_or(0)
    }

    /// Close the bus. Subscribers drain what they have queued, then end.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.subscribers.lock() {
            guard.take();
        }
    }
}

/// One subscriber's view of the bus.
pub struct Subscription {
    rx: Option<broadcast::Receiver<Event>>,
    filter: SubscriptionFilter,
    dropped: u64,
}

impl Subscription {
    /// Next matching event, or `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<Event> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(dropped = n, "subscriber lagging, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.dropped += n,
                Err(_) => return None,
            }
        }
    }

    /// Events lost to lag since this subscription attached.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }
}
