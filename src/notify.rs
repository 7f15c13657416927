use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::models::StatusEvent;

pub type Handler = Arc<dyn Fn(&StatusEvent) + Send + Sync>;

/// In-process publish/subscribe keyed by job token. Events reach only the
/// handlers registered at the moment of `emit`; nothing is buffered.
/// A final event also retires every subscription for its token, so a
/// subscriber sees at most one.
#[derive(Default)]
pub struct NotificationBus {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(self: &Arc<Self>, token: &str, handler: F) -> Subscription
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .entry(token.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            bus: Arc::downgrade(self),
            token: token.to_string(),
            id,
        }
    }

    /// Subscription that forwards events into a channel, for consumers that
    /// want to `await` them.
    pub fn subscribe_channel(
        self: &Arc<Self>,
        token: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(token, move |event| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    /// Delivers `event` synchronously; returns the number of handlers called.
    pub fn emit(&self, token: &str, event: &StatusEvent) -> usize {
        let handlers: Vec<Handler> = {
            let mut subscribers = self.subscribers.lock();
            if event.is_final {
                subscribers
                    .remove(token)
                    .map(|list| list.into_iter().map(|(_, handler)| handler).collect())
                    .unwrap_or_default()
            } else {
                subscribers
                    .get(token)
                    .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
                    .unwrap_or_default()
            }
        };

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self, token: &str) -> usize {
        self.subscribers
            .lock()
            .get(token)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn remove(&self, token: &str, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(list) = subscribers.get_mut(token) {
            list.retain(|(existing, _)| *existing != id);
            if list.is_empty() {
                subscribers.remove(token);
            }
        }
    }
}

/// Handle returned by [`NotificationBus::subscribe`]; dropping it
/// unsubscribes.
pub struct Subscription {
    bus: Weak<NotificationBus>,
    token: String,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.token, self.id);
        }
    }
}
