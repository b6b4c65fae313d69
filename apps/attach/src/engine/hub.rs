use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct HubState<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
    closed: bool,
}

/// Typed listener registry. Emission after `close` is a no-op.
pub struct EventHub<T> {
    state: Arc<Mutex<HubState<T>>>,
}

impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                next_id: 0,
                listeners: Vec::new(),
                closed: false,
            })),
        }
    }
}

impl<T: 'static> EventHub<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            return Subscription::noop();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push((id, Arc::new(listener)));

        let weak: Weak<Mutex<HubState<T>>> = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                state.lock().listeners.retain(|(existing, _)| *existing != id);
            }
        })
    }

    /// Calls every listener outside the lock, so listeners may subscribe or
    /// dispose while being notified.
    pub fn emit(&self, value: &T) {
        let listeners: Vec<Listener<T>> = {
            let state = self.state.lock();
            if state.closed {
                return;
            }
            state.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(value);
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.listeners.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by every `on_*` registration. Disposing or dropping it
/// unregisters the listener.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn dispose(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
