use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::Notify;
use crate::{service::InfoHandle, TorrentId};

// Bound on how long a consumer will wait for a service to register.
pub const AWAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {

    #[error("info service already registered for torrent {0}")]
    Collision(TorrentId),

    #[error("timed out waiting for info service for torrent {0}")]
    AwaitTimeout(TorrentId),
}

/* Process-wide map from torrent id to its info service handle. Handed around
by value; clones share the same underlying map. Exactly one service may be
registered per torrent, a collision is a startup error for the second one.
Consumers that race service startup use await_service, which blocks up to the
configured bound for the registration to appear. */

#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    inner: Arc<Inner>,
    timeout: Duration,
}

#[derive(Debug)]
struct Inner {
    services: Mutex<HashMap<TorrentId, InfoHandle>>,
    registered: Notify,
}

impl ServiceRegistry {

    pub fn new() -> Self {
        Self::with_timeout(AWAIT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                services: Mutex::new(HashMap::new()),
                registered: Notify::new(),
            }),
            timeout,
        }
    }

    pub fn register(&self, id: TorrentId, handle: InfoHandle) -> Result<(), RegistryError> {
        let mut services = self.inner.services.lock().expect("registry lock poisoned");
        if services.contains_key(&id) {
            return Err(RegistryError::Collision(id));
        }
        services.insert(id, handle);
        drop(services);

        self.inner.registered.notify_waiters();
        tracing::info!("registered info service for torrent {}", id);
        Ok(())
    }

    pub fn deregister(&self, id: TorrentId) -> Option<InfoHandle> {
        let handle = self.inner.services.lock().expect("registry lock poisoned").remove(&id);
        if handle.is_some() {
            tracing::info!("deregistered info service for torrent {}", id);
        }
        handle
    }

    pub fn lookup(&self, id: TorrentId) -> Option<InfoHandle> {
        self.inner.services.lock().expect("registry lock poisoned").get(&id).cloned()
    }

    // Waits for a service to appear, up to the configured bound. The notified
    // future is created before the map is checked so a registration landing
    // in between is not missed.
    pub async fn await_service(&self, id: TorrentId) -> Result<InfoHandle, RegistryError> {
        let wait = async {
            loop {
                let registered = self.inner.registered.notified();
                if let Some(handle) = self.lookup(id) {
                    return handle;
                }
                registered.await;
            }
        };
        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| RegistryError::AwaitTimeout(id))
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::RwLock;
    use crate::{pieces::PieceSet, service::{spawn, TorrentInfo}};

    fn spawn_service() -> InfoHandle {
        let info = TorrentInfo::from_parts(4, vec![("a".to_string(), 8)], vec![1, 2, 3]);
        let valid = Arc::new(RwLock::new(PieceSet::new(2)));
        let (_handle, info_handle) = spawn(info, valid);
        info_handle
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ServiceRegistry::new();
        assert!(registry.lookup(1).is_none());

        registry.register(1, spawn_service()).unwrap();
        let handle = registry.lookup(1).unwrap();
        assert_eq!(handle.num_pieces().await.unwrap(), 2);

        assert!(registry.deregister(1).is_some());
        assert!(registry.lookup(1).is_none());
        assert!(registry.deregister(1).is_none());
    }

    #[tokio::test]
    async fn test_collision() {
        let registry = ServiceRegistry::new();
        registry.register(7, spawn_service()).unwrap();
        let err = registry.register(7, spawn_service()).unwrap_err();
        assert!(matches!(err, RegistryError::Collision(7)));
    }

    #[tokio::test]
    async fn test_await_wakes_on_registration() {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();

        let registry = ServiceRegistry::with_timeout(Duration::from_secs(5));
        let waiter = registry.clone();
        let task = tokio::spawn(async move { waiter.await_service(3).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.register(3, spawn_service()).unwrap();

        let handle = task.await.unwrap().unwrap();
        assert_eq!(handle.piece_size().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_await_times_out() {
        let registry = ServiceRegistry::with_timeout(Duration::from_millis(30));
        let err = registry.await_service(9).await.unwrap_err();
        assert!(matches!(err, RegistryError::AwaitTimeout(9)));
    }

    #[tokio::test]
    async fn test_await_returns_existing() {
        let registry = ServiceRegistry::with_timeout(Duration::from_millis(30));
        registry.register(2, spawn_service()).unwrap();
        assert!(registry.await_service(2).await.is_ok());
    }
}
