use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;

/// A published occurrence: string topic plus a JSON payload, the shape
/// scripts are documented against.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl ToString, payload: Value) -> Self {
        Self {
            name: name.to_string(),
            payload,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type SyncHandler = Arc<dyn Fn(&Event) -> Result<(), Error> + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

struct Registration {
    id: Subscription,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, Vec<Registration>>,
    next_id: u64,
    dispatching: usize,
    deferred_unsubscribes: Vec<Subscription>,
}

/// In-process publish/subscribe fabric. Sync subscribers run inline in
/// registration order; async subscribers are handed to the runtime and
/// never awaited by the publisher. A failing subscriber is logged and
/// the fan-out continues.
#[derive(Default)]
pub struct Bus {
    inner: Mutex<Inner>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.register(event, Handler::Sync(Arc::new(handler)))
    }

    pub fn subscribe_async<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(Event) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.register(event, Handler::Async(Arc::new(handler)))
    }

    fn register(&self, event: &str, handler: Handler) -> Subscription {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = Subscription(inner.next_id);
        inner
            .topics
            .entry(event.to_string())
            .or_default()
            .push(Registration { id, handler });
        id
    }

    /// Removal during an active dispatch is deferred until the current
    /// fan-out finishes.
    pub fn unsubscribe(&self, id: Subscription) {
        let mut inner = self.lock();
        if inner.dispatching > 0 {
            inner.deferred_unsubscribes.push(id);
        } else {
            remove_subscription(&mut inner, id);
        }
    }

    pub fn publish(&self, event: Event) {
        let handlers = {
            let mut inner = self.lock();
            inner.dispatching += 1;
            inner
                .topics
                .get(&event.name)
                .map(|registrations| {
                    registrations
                        .iter()
                        .map(|r| r.handler.clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };

        for handler in handlers {
            match handler {
                Handler::Sync(f) => {
                    if let Err(e) = f(&event) {
                        log::error!("subscriber for {:?} failed: {e}", event.name);
                    }
                }
                Handler::Async(f) => {
                    let future = f(event.clone());
                    match tokio::runtime::Handle::try_current() {
                        Ok(handle) => {
                            handle.spawn(future);
                        }
                        Err(_) => log::warn!(
                            "no runtime available to deliver async event {:?}",
                            event.name
                        ),
                    }
                }
            }
        }

        let mut inner = self.lock();
        inner.dispatching -= 1;
        if inner.dispatching == 0 {
            for id in std::mem::take(&mut inner.deferred_unsubscribes) {
                remove_subscription(&mut inner, id);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn remove_subscription(inner: &mut Inner, id: Subscription) {
    for registrations in inner.topics.values_mut() {
        registrations.retain(|r| r.id != id);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Error(pub String);
