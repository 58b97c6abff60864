use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

pub type KeyListener = Arc<dyn Fn() + Send + Sync + 'static>;

/// Source of raw key-press events, injected into the tracker so it never
/// attaches to global input state itself.
pub trait InputActivityMonitor: Send + Sync {
    fn subscribe(&self, on_key_event: KeyListener) -> Subscription;
}

/// Detaches a listener when `unsubscribe` is called or the value is dropped.
/// Detaching twice is harmless.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Subscription {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.run_detach();
    }

    fn run_detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_detach();
    }
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    listeners: HashMap<u64, KeyListener>,
}

/// In-process key-event fan-out. Whatever reads the keyboard calls
/// [`KeyEventHub::emit_key_press`]; subscribers are invoked synchronously.
///
/// Listeners run while the hub lock is held, so they must not subscribe or
/// unsubscribe from inside the callback. Once `unsubscribe` returns, that
/// listener is never invoked again.
#[derive(Clone, Default)]
pub struct KeyEventHub {
    inner: Arc<Mutex<HubInner>>,
    total: Arc<AtomicU64>,
}

impl KeyEventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one key press to every subscriber; returns how many received it.
    pub fn emit_key_press(&self) -> usize {
        self.total.fetch_add(1, Ordering::Relaxed);
        let guard = lock(&self.inner);
        for listener in guard.listeners.values() {
            listener();
        }
        guard.listeners.len()
    }

    /// Every key press seen since the hub was created, listeners or not.
    pub fn total_key_presses(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }
}

impl InputActivityMonitor for KeyEventHub {
    fn subscribe(&self, on_key_event: KeyListener) -> Subscription {
        let id = {
            let mut guard = lock(&self.inner);
            let id = guard.next_id;
            guard.next_id = guard.next_id.wrapping_add(1);
            guard.listeners.insert(id, on_key_event);
            id
        };

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                lock(&inner).listeners.remove(&id);
            }
        })
    }
}

fn lock(inner: &Mutex<HubInner>) -> MutexGuard<'_, HubInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_listener(counter: &Arc<AtomicU64>) -> KeyListener {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn delivers_to_every_subscriber() {
        let hub = KeyEventHub::new();
        let a = Arc::new(AtomicU64::new(0));
        let b = Arc::new(AtomicU64::new(0));
        let _sub_a = hub.subscribe(counter_listener(&a));
        let _sub_b = hub.subscribe(counter_listener(&b));

        assert_eq!(hub.emit_key_press(), 2);
        hub.emit_key_press();

        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hub = KeyEventHub::new();
        let count = Arc::new(AtomicU64::new(0));
        let sub = hub.subscribe(counter_listener(&count));

        hub.emit_key_press();
        sub.unsubscribe();
        hub.emit_key_press();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn dropping_subscription_detaches() {
        let hub = KeyEventHub::new();
        {
            let _sub = hub.subscribe(Arc::new(|| {}));
            assert_eq!(hub.listener_count(), 1);
        }
        assert_eq!(hub.listener_count(), 0);
        assert_eq!(hub.emit_key_press(), 0);
    }

    #[test]
    fn total_keeps_counting_across_subscriptions() {
        let hub = KeyEventHub::new();
        hub.emit_key_press();

        let sub = hub.subscribe(Arc::new(|| {}));
        hub.emit_key_press();
        hub.emit_key_press();
        sub.unsubscribe();
        hub.emit_key_press();

        assert_eq!(hub.total_key_presses(), 4);
        assert_eq!(hub.clone().total_key_presses(), 4);
    }

    #[test]
    fn subscription_outliving_hub_is_harmless() {
        let hub = KeyEventHub::new();
        let sub = hub.subscribe(Arc::new(|| {}));
        drop(hub);
        sub.unsubscribe();
    }
}
