// ABOUTME: Online/offline signal backed by a tokio watch channel.
// ABOUTME: Readable synchronously and subscribable for transitions; clones share the same signal.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared connectivity flag. Whoever observes the network (a probe, a
/// platform hook, a test) calls `set_online`; everyone else reads or
/// subscribes.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(online)),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the current state. Returns true when this was a transition;
    /// subscribers are only woken on transitions.
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    /// Receiver that wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_online_reports_transitions_only() {
        let signal = Connectivity::new(false);
        assert!(!signal.is_online());
        assert!(signal.set_online(true));
        assert!(!signal.set_online(true));
        assert!(signal.is_online());
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let signal = Connectivity::new(false);
        let mut rx = signal.subscribe();
        let writer = signal.clone();

        writer.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        // No transition, so nothing new to observe.
        writer.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }
}
