//! Client lifecycle callbacks

use std::future::Future;
use std::ops::BitOr;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::trace;

use crate::client::Client;

/// A client lifecycle event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    /// The lease renewal task finished on its own
    LeaseRenewalDone,
    /// The client was removed from the cache
    CacheRemoved,
}

impl ClientEvent {
    const fn bit(self) -> u8 {
        match self {
            ClientEvent::LeaseRenewalDone => 1 << 0,
            ClientEvent::CacheRemoved => 1 << 1,
        }
    }
}

/// A set of [`ClientEvent`]s
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ClientEvents(u8);

impl ClientEvents {
    /// No events
    pub const NONE: ClientEvents = ClientEvents(0);
    /// Every event
    pub const ALL: ClientEvents =
        ClientEvents(ClientEvent::LeaseRenewalDone.bit() | ClientEvent::CacheRemoved.bit());

    /// Whether `event` is in the set
    pub fn contains(self, event: ClientEvent) -> bool {
        self.0 & event.bit() != 0
    }

    /// Whether the sets share an event
    pub fn intersects(self, other: ClientEvents) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether the set is empty
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<ClientEvent> for ClientEvents {
    fn from(event: ClientEvent) -> Self {
        ClientEvents(event.bit())
    }
}

impl BitOr for ClientEvents {
    type Output = ClientEvents;
    fn bitor(self, rhs: ClientEvents) -> ClientEvents {
        ClientEvents(self.0 | rhs.0)
    }
}

impl BitOr for ClientEvent {
    type Output = ClientEvents;
    fn bitor(self, rhs: ClientEvent) -> ClientEvents {
        ClientEvents::from(self) | ClientEvents::from(rhs)
    }
}

impl BitOr<ClientEvent> for ClientEvents {
    type Output = ClientEvents;
    fn bitor(self, rhs: ClientEvent) -> ClientEvents {
        self | ClientEvents::from(rhs)
    }
}

/// Callback invoked with the affected client
pub type ClientCallback = Arc<dyn Fn(Arc<Client>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A callback and the events it subscribes to
#[derive(Clone)]
pub struct ClientCallbackHandler {
    /// Events that trigger the callback
    pub on: ClientEvents,
    /// The callback
    pub callback: ClientCallback,
}

impl ClientCallbackHandler {
    /// Subscribe an async function to `on`
    pub fn new<E, F, Fut>(on: E, callback: F) -> Self
    where
        E: Into<ClientEvents>,
        F: Fn(Arc<Client>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            on: on.into(),
            callback: Arc::new(move |client: Arc<Client>| callback(client).boxed()),
        }
    }
}

impl std::fmt::Debug for ClientCallbackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCallbackHandler").field("on", &self.on).finish()
    }
}

/// Registered callback handlers
#[derive(Default)]
pub struct ClientCallbackRegistry {
    handlers: RwLock<Vec<ClientCallbackHandler>>,
}

impl ClientCallbackRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler
    pub fn register(&self, handler: ClientCallbackHandler) {
        self.handlers.write().push(handler);
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Invoke every handler subscribed to any of `events`
    ///
    /// With `wait` the handlers run concurrently and this returns once all
    /// have finished. Otherwise they are spawned onto the runtime.
    pub async fn dispatch(&self, client: &Arc<Client>, events: ClientEvents, wait: bool) {
        let matching: Vec<ClientCallback> = self
            .handlers
            .read()
            .iter()
            .filter(|h| h.on.intersects(events))
            .map(|h| h.callback.clone())
            .collect();
        if matching.is_empty() {
            return;
        }
        trace!(
            cache_key = %client.cache_key(),
            ?events,
            handlers = matching.len(),
            wait,
            "Calling client callbacks"
        );

        let futures = matching.into_iter().map(|cb| cb(client.clone()));
        if wait {
            join_all(futures).await;
        } else {
            for fut in futures {
                tokio::spawn(fut);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::offline_client;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn event_sets() {
        let both = ClientEvent::LeaseRenewalDone | ClientEvent::CacheRemoved;
        assert_eq!(both, ClientEvents::ALL);
        assert!(both.contains(ClientEvent::CacheRemoved));
        assert!(ClientEvents::from(ClientEvent::CacheRemoved).intersects(both));
        assert!(!ClientEvents::from(ClientEvent::CacheRemoved)
            .intersects(ClientEvent::LeaseRenewalDone.into()));
        assert!(ClientEvents::NONE.is_empty());
        assert_eq!(
            ClientEvents::NONE | ClientEvent::CacheRemoved,
            ClientEvent::CacheRemoved.into()
        );
    }

    #[tokio::test]
    async fn dispatch_filters_by_event() {
        let registry = ClientCallbackRegistry::new();
        let renewal_calls = Arc::new(AtomicUsize::new(0));
        let removal_calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let counter = renewal_calls.clone();
            registry.register(ClientCallbackHandler::new(ClientEvent::LeaseRenewalDone, move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        let counter = removal_calls.clone();
        registry.register(ClientCallbackHandler::new(ClientEvent::CacheRemoved, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        assert_eq!(registry.len(), 3);

        let client = Arc::new(offline_client(Duration::from_secs(60), true).await);
        registry
            .dispatch(&client, ClientEvent::LeaseRenewalDone.into(), true)
            .await;
        assert_eq!(renewal_calls.load(Ordering::SeqCst), 2);
        assert_eq!(removal_calls.load(Ordering::SeqCst), 0);

        registry.dispatch(&client, ClientEvents::ALL, true).await;
        assert_eq!(renewal_calls.load(Ordering::SeqCst), 4);
        assert_eq!(removal_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_without_wait_does_not_block() {
        let registry = ClientCallbackRegistry::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = release.clone();
        let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));
        registry.register(ClientCallbackHandler::new(ClientEvent::CacheRemoved, move |_| {
            let gate = gate.clone();
            let tx = tx.clone();
            async move {
                gate.notified().await;
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        }));

        let client = Arc::new(offline_client(Duration::from_secs(60), true).await);
        // would hang if dispatch awaited the handler
        registry
            .dispatch(&client, ClientEvent::CacheRemoved.into(), false)
            .await;
        release.notify_one();
        rx.await.unwrap();
    }
}
