//! Callback tables for state-machine notifications.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// A registered event callback.
///
/// Identity is the `Arc` allocation: registering a clone of the same `Arc`
/// twice is a duplicate.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListenerError {
    #[error("listener is already registered")]
    AlreadyRegistered,
}

/// Set of listeners notified with snapshot-then-notify semantics.
///
/// `notify` copies the current set before invoking anything, so a listener
/// may add or remove listeners (itself included) from inside its callback.
pub struct ListenerRegistry<E> {
    listeners: Mutex<Vec<Listener<E>>>,
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<E> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Registering the same listener twice is rejected.
    pub fn add(&self, listener: &Listener<E>) -> Result<(), ListenerError> {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|l| Arc::ptr_eq(l, listener)) {
            return Err(ListenerError::AlreadyRegistered);
        }
        listeners.push(Arc::clone(listener));
        Ok(())
    }

    /// Unregister a listener. Returns whether it was registered.
    pub fn remove(&self, listener: &Listener<E>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    pub fn notify(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self.listeners.lock().clone();
        for listener in snapshot {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ListenerRegistry::<u32>::new();
        let listener: Listener<u32> = Arc::new(|_| {});
        registry.add(&listener).unwrap();
        assert_eq!(registry.add(&listener), Err(ListenerError::AlreadyRegistered));
        assert_eq!(registry.len(), 1);

        let other: Listener<u32> = Arc::new(|_| {});
        registry.add(&other).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn listener_may_unregister_itself_mid_notify() {
        let registry = Arc::new(ListenerRegistry::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let slot: Arc<Mutex<Option<Listener<u32>>>> = Arc::new(Mutex::new(None));
        let listener: Listener<u32> = {
            let registry = Arc::clone(&registry);
            let calls = Arc::clone(&calls);
            let slot = Arc::clone(&slot);
            Arc::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = slot.lock().take() {
                    assert!(registry.remove(&me));
                }
            })
        };
        *slot.lock() = Some(Arc::clone(&listener));
        registry.add(&listener).unwrap();

        registry.notify(&1);
        registry.notify(&2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }
}
