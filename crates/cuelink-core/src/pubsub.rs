//! Synchronous observer lists.
//!
//! Handlers are invoked inline on the emitting task, in registration order.
//! A handler may subscribe or unsubscribe from inside a callback; the change
//! takes effect from the next emit.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::envelope::kind;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

/// A list of handlers for one event type.
pub struct Subscribers<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut reg = self.inner.lock();
            let id = reg.next_id;
            reg.next_id += 1;
            reg.handlers.push((id, Arc::new(handler)));
            id
        };
        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().handlers.retain(|(h, _)| *h != id);
            }
        })
    }

    /// Deliver `event` to every handler registered at the time of the call.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Handler<T>> = self
            .inner
            .lock()
            .handlers
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().handlers.clear();
    }
}

/// Token returned by `subscribe`. Call [`Subscription::unsubscribe`] to stop
/// receiving events; dropping the token leaves the handler registered.
#[must_use = "keep the subscription to unsubscribe later"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A token that unsubscribes nothing.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
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

/// Handlers keyed by topic string, plus the `*` wildcard.
pub struct Topics<T> {
    topics: Arc<Mutex<HashMap<String, Subscribers<T>>>>,
}

impl<T> Clone for Topics<T> {
    fn clone(&self) -> Self {
        Self {
            topics: Arc::clone(&self.topics),
        }
    }
}

impl<T> Default for Topics<T> {
    fn default() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: 'static> Topics<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        topic: &str,
        handler: impl Fn(&T) + Send + Sync + 'static,
    ) -> Subscription {
        let subs = self
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .clone();
        subs.subscribe(handler)
    }

    /// Handlers for `topic` run first, then wildcard handlers.
    pub fn dispatch(&self, topic: &str, event: &T) {
        let (typed, wildcard) = {
            let topics = self.topics.lock();
            (
                topics.get(topic).cloned(),
                topics.get(kind::WILDCARD).cloned(),
            )
        };
        if let Some(subs) = typed {
            subs.emit(event);
        }
        if topic != kind::WILDCARD {
            if let Some(subs) = wildcard {
                subs.emit(event);
            }
        }
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Subscribers::len)
    }

    pub fn clear(&self) {
        self.topics.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_in_registration_order() {
        let subs = Subscribers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&seen);
        let b = Arc::clone(&seen);
        let _s1 = subs.subscribe(move |v| a.lock().push(("a", *v)));
        let _s2 = subs.subscribe(move |v| b.lock().push(("b", *v)));

        subs.emit(&7);
        assert_eq!(*seen.lock(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn unsubscribe_removes_only_that_handler() {
        let subs = Subscribers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&seen);
        let b = Arc::clone(&seen);
        let first = subs.subscribe(move |v| a.lock().push(*v));
        let _second = subs.subscribe(move |v| b.lock().push(*v * 10));

        first.unsubscribe();
        subs.emit(&2);
        assert_eq!(*seen.lock(), vec![20]);
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn dropping_token_keeps_handler() {
        let subs = Subscribers::<u32>::new();
        drop(subs.subscribe(|_| {}));
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn unsubscribe_after_owner_dropped_is_harmless() {
        let subs = Subscribers::<u32>::new();
        let token = subs.subscribe(|_| {});
        drop(subs);
        token.unsubscribe();
    }

    #[test]
    fn handler_may_subscribe_during_emit() {
        let subs = Subscribers::<u32>::new();
        let inner = subs.clone();
        let _s = subs.subscribe(move |_| {
            let _ = inner.subscribe(|_| {});
        });
        subs.emit(&1);
        assert_eq!(subs.len(), 2);
    }

    #[test]
    fn topics_dispatch_typed_then_wildcard() {
        let topics = Topics::<String>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&seen);
        let b = Arc::clone(&seen);
        let c = Arc::clone(&seen);
        let _w = topics.subscribe("*", move |e| a.lock().push(format!("*:{e}")));
        let _h = topics.subscribe("heartbeat", move |e| b.lock().push(format!("hb:{e}")));
        let _m = topics.subscribe("metadata.update", move |e| c.lock().push(format!("md:{e}")));

        topics.dispatch("heartbeat", &"x".to_string());
        topics.dispatch("unknown.kind", &"y".to_string());
        assert_eq!(*seen.lock(), vec!["hb:x", "*:x", "*:y"]);
        assert_eq!(topics.handler_count("heartbeat"), 1);
        assert_eq!(topics.handler_count("nothing"), 0);
    }
}
