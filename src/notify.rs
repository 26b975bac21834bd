//! Multi-subscriber notification lists for connection and model events

use std::sync::Mutex;

/// A list of subscribers notified with a borrowed event.
///
/// Subscribers are registered explicitly and never removed; the lists live
/// as long as the session or model that owns them.
pub struct Notifier<E> {
    subscribers: Mutex<Vec<Box<dyn Fn(&E) + Send + Sync>>>,
}

impl<E> Default for Notifier<E> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<E> Notifier<E> {
    /// Register a subscriber
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut subs = match self.subscribers.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        subs.push(Box::new(f));
    }

    /// Invoke every subscriber with `event`
    pub fn notify(&self, event: &E) {
        let subs = match self.subscribers.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        for sub in subs.iter() {
            sub(event);
        }
    }
}

impl<E> std::fmt::Debug for Notifier<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = match self.subscribers.lock() {
            Ok(s) => s.len(),
            Err(p) => p.into_inner().len(),
        };
        f.debug_struct("Notifier").field("subscribers", &n).finish()
    }
}
