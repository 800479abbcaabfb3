// ABOUTME: Topic-keyed callback registry used by the pack store and the read cache for change notification.
// ABOUTME: Subscriptions unregister on drop, and a panicking listener never stops the others from running.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Topics<E> {
    next_id: u64,
    by_topic: HashMap<String, Vec<(u64, Listener<E>)>>,
}

fn lock<E>(topics: &Mutex<Topics<E>>) -> MutexGuard<'_, Topics<E>> {
    topics.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A set of listeners grouped by topic (a pack namespace, a cache key).
pub struct ListenerRegistry<E> {
    topics: Arc<Mutex<Topics<E>>>,
}

impl<E: 'static> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(Topics {
                next_id: 0,
                by_topic: HashMap::new(),
            })),
        }
    }

    /// Register `listener` for `topic`. The listener stays registered until
    /// the returned subscription is dropped or unsubscribed.
    pub fn subscribe<F>(&self, topic: &str, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut topics = lock(&self.topics);
            let id = topics.next_id;
            topics.next_id += 1;
            topics
                .by_topic
                .entry(topic.to_string())
                .or_default()
                .push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<Topics<E>>> = Arc::downgrade(&self.topics);
        let topic = topic.to_string();
        Subscription {
            cancel: Some(Box::new(move || {
                let Some(topics) = weak.upgrade() else {
                    return;
                };
                let mut topics = lock(&topics);
                if let Some(listeners) = topics.by_topic.get_mut(&topic) {
                    listeners.retain(|(listener_id, _)| *listener_id != id);
                    if listeners.is_empty() {
                        topics.by_topic.remove(&topic);
                    }
                }
            })),
        }
    }

    /// Invoke every listener registered for `topic` with `event`.
    /// Returns how many listeners ran to completion.
    pub fn notify(&self, topic: &str, event: &E) -> usize {
        // Snapshot under the lock, call outside it so listeners may subscribe
        // or unsubscribe re-entrantly.
        let listeners: Vec<Listener<E>> = {
            let topics = lock(&self.topics);
            match topics.by_topic.get(topic) {
                Some(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return 0,
            }
        };

        let mut completed = 0;
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => completed += 1,
                Err(_) => tracing::warn!("listener for {:?} panicked; continuing", topic),
            }
        }
        completed
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        lock(&self.topics)
            .by_topic
            .get(topic)
            .map_or(0, Vec::len)
    }
}

/// Handle returned by `subscribe`. Dropping it unregisters the listener.
#[must_use = "dropping a Subscription immediately unregisters its listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the listener registered for as long as the registry lives.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
