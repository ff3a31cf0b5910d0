use derive_more::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Returned by [`Event::subscribe`], used to unsubscribe
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
pub struct EventToken(u64);

pub type EventHandler<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// A list of subscribers to one kind of event
pub struct Event<A> {
    next_token: AtomicU64,
    handlers: Mutex<Vec<(EventToken, EventHandler<A>)>>,
}

impl<A> Default for Event<A> {
    fn default() -> Self {
        Self {
            next_token: AtomicU64::new(0),
            handlers: Mutex::new(vec![]),
        }
    }
}

impl<A> Event<A> {
    pub fn subscribe(&self, handler: impl Fn(&A) + Send + Sync + 'static) -> EventToken {
        let token = EventToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.handlers
            .lock()
            .expect("Locking failed")
            .push((token, Arc::new(handler)));
        token
    }

    /// Returns `false` if `token` was not subscribed
    pub fn unsubscribe(&self, token: EventToken) -> bool {
        let mut handlers = self.handlers.lock().expect("Locking failed");
        let len_before = handlers.len();
        handlers.retain(|(t, _)| *t != token);
        handlers.len() != len_before
    }

    pub fn has_subscribers(&self) -> bool {
        !self.handlers.lock().expect("Locking failed").is_empty()
    }

    /// Call all the subscribers, in order of subscribing
    ///
    /// Handlers are called without holding the lock, so they can
    /// (un)subscribe.
    pub fn raise(&self, args: &A) {
        let handlers: Vec<_> = self
            .handlers
            .lock()
            .expect("Locking failed")
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for handler in handlers {
            handler(args);
        }
    }
}

#[test]
fn raise_calls_subscribers_in_order() {
    let event = Event::<u32>::default();
    let seen = Arc::new(Mutex::new(vec![]));

    let first = event.subscribe({
        let seen = seen.clone();
        move |v| seen.lock().unwrap().push(("first", *v))
    });
    event.subscribe({
        let seen = seen.clone();
        move |v| seen.lock().unwrap().push(("second", *v))
    });

    event.raise(&1);
    assert!(event.unsubscribe(first));
    assert!(!event.unsubscribe(first));
    event.raise(&2);

    assert_eq!(
        *seen.lock().unwrap(),
        [("first", 1), ("second", 1), ("second", 2)]
    );
}
