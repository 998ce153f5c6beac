//! Synchronous publish/subscribe signals for host notifications.
//!
//! Every host entity (cell model, cell view, cell list, notebook) exposes its
//! notifications as a [`Signal`]. Subscribers connect a slot and get back a
//! [`SlotId`] they must hand back to [`Signal::disconnect`]; nothing is cleaned
//! up implicitly. [`Signal::connect_scoped`] is the exception, returning a guard
//! that disconnects on drop, for waits that may be abandoned mid-flight.
//!
//! Emission snapshots the slot list first, so a slot may connect or disconnect
//! (itself or others) while the signal is being emitted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock;

/// Handle identifying one connected slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A list of slots invoked, in connection order, on every emission.
pub struct Signal<T> {
    slots: Mutex<Vec<(SlotId, Slot<T>)>>,
    next_id: AtomicU64,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Connect a slot. It stays connected until [`disconnect`](Self::disconnect).
    pub fn connect<F>(&self, slot: F) -> SlotId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SlotId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.slots).push((id, Arc::new(slot)));
        id
    }

    /// Connect a slot for as long as the returned guard lives.
    pub fn connect_scoped<F>(&self, slot: F) -> Subscription<'_, T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Subscription {
            signal: self,
            id: self.connect(slot),
        }
    }

    /// Disconnect a slot. Returns false if it was not connected.
    pub fn disconnect(&self, id: SlotId) -> bool {
        let mut slots = lock(&self.slots);
        let before = slots.len();
        slots.retain(|(slot_id, _)| *slot_id != id);
        slots.len() != before
    }

    pub fn disconnect_all(&self) {
        lock(&self.slots).clear();
    }

    pub fn is_connected(&self, id: SlotId) -> bool {
        lock(&self.slots).iter().any(|(slot_id, _)| *slot_id == id)
    }

    /// Number of connected slots.
    pub fn slot_count(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Invoke every slot connected at the time of the call.
    pub fn emit(&self, args: &T) {
        let snapshot: Vec<Slot<T>> = lock(&self.slots)
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        for slot in snapshot {
            slot(args);
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("slots", &self.slot_count())
            .finish()
    }
}

/// Guard returned by [`Signal::connect_scoped`].
#[must_use = "the slot is disconnected as soon as the subscription is dropped"]
pub struct Subscription<'a, T> {
    signal: &'a Signal<T>,
    id: SlotId,
}

impl<T> Subscription<'_, T> {
    pub fn id(&self) -> SlotId {
        self.id
    }
}

impl<T> Drop for Subscription<'_, T> {
    fn drop(&mut self) {
        self.signal.disconnect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_connected_slots_in_order() {
        let signal = Signal::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen);
        signal.connect(move |v| s1.lock().unwrap().push(("first", *v)));
        let s2 = Arc::clone(&seen);
        signal.connect(move |v| s2.lock().unwrap().push(("second", *v)));

        signal.emit(&7);

        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_disconnect_stops_delivery() {
        let signal = Signal::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        signal.emit(&());
        assert!(signal.disconnect(id));
        assert!(!signal.disconnect(id));
        signal.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.slot_count(), 0);
    }

    #[test]
    fn test_slot_can_disconnect_itself_during_emit() {
        let signal = Arc::new(Signal::<()>::new());
        let count = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(Mutex::new(None));

        let sig = Arc::clone(&signal);
        let c = Arc::clone(&count);
        let own = Arc::clone(&own_id);
        let id = signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *own.lock().unwrap() {
                sig.disconnect(id);
            }
        });
        *own_id.lock().unwrap() = Some(id);

        signal.emit(&());
        signal.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scoped_subscription_disconnects_on_drop() {
        let signal = Signal::<()>::new();
        {
            let sub = signal.connect_scoped(|_| {});
            assert!(signal.is_connected(sub.id()));
            assert_eq!(signal.slot_count(), 1);
        }
        assert_eq!(signal.slot_count(), 0);
    }
}
