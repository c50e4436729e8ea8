use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub type RelayId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    TcpHttp,
    TcpHttps,
    Udp,
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelayKind::TcpHttp => "tcp/http",
            RelayKind::TcpHttps => "tcp/https",
            RelayKind::Udp => "udp",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Pending,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayInfo {
    pub id: RelayId,
    pub client: SocketAddr,
    /// The SOCKS target as the client asked for it.
    pub target: String,
    pub kind: RelayKind,
    pub state: RelayState,
    /// Local end of the splice towards an internal listener.
    pub loopback: Option<SocketAddr>,
}

struct Entry {
    info: RelayInfo,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    relays: HashMap<RelayId, Entry>,
    closed: bool,
}

/// Live relays of one service instance.
#[derive(Default)]
pub struct RelayRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    log: bool,
}

impl RelayRegistry {
    /// `log` enables the lifecycle lines on the `socks` target.
    pub fn new(log: bool) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registrations after [`RelayRegistry::close_all`] are born cancelled.
    pub fn register(self: &Arc<Self>, client: SocketAddr, target: String, kind: RelayKind) -> RelayHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let info = RelayInfo {
            id,
            client,
            target,
            kind,
            state: RelayState::Pending,
            loopback: None,
        };

        {
            let mut inner = self.lock();
            if inner.closed {
                cancel.cancel();
            } else {
                inner.relays.insert(
                    id,
                    Entry {
                        info: info.clone(),
                        cancel: cancel.clone(),
                    },
                );
            }
        }

        RelayHandle {
            registry: self.clone(),
            info,
            cancel,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn relays(&self) -> Vec<RelayInfo> {
        let mut relays: Vec<_> = self.lock().relays.values().map(|e| e.info.clone()).collect();
        relays.sort_by_key(|info| info.id);
        relays
    }

    pub fn client_for_loopback(&self, loopback: SocketAddr) -> Option<SocketAddr> {
        self.lock()
            .relays
            .values()
            .find(|e| e.info.loopback == Some(loopback))
            .map(|e| e.info.client)
    }

    /// Cancel and forget every relay; returns how many there were.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.relays.drain().map(|(_, entry)| entry).collect()
        };

        for entry in &drained {
            entry.cancel.cancel();
        }
        drained.len()
    }

    fn update(&self, id: RelayId, f: impl FnOnce(&mut RelayInfo)) {
        if let Some(entry) = self.lock().relays.get_mut(&id) {
            f(&mut entry.info);
        }
    }

    fn unregister(&self, id: RelayId) {
        self.lock().relays.remove(&id);
    }
}

/// Ownership of one registry entry; dropping it is the relay's `closed` signal.
pub struct RelayHandle {
    registry: Arc<RelayRegistry>,
    info: RelayInfo,
    cancel: CancellationToken,
}

impl RelayHandle {
    pub fn id(&self) -> RelayId {
        self.info.id
    }

    pub fn info(&self) -> &RelayInfo {
        &self.info
    }

    pub fn set_kind(&mut self, kind: RelayKind) {
        self.info.kind = kind;
        self.registry.update(self.info.id, |info| info.kind = kind);
    }

    /// Recorded before dialing so the listener can attribute the connection on accept.
    pub fn set_loopback(&mut self, loopback: SocketAddr) {
        self.info.loopback = Some(loopback);
        self.registry.update(self.info.id, |info| info.loopback = Some(loopback));
    }

    pub fn connected(&mut self) {
        self.info.state = RelayState::Connected;
        self.registry.update(self.info.id, |info| info.state = RelayState::Connected);

        if self.registry.log {
            info!(target: "socks", "relay #{} {} {} -> {} connected", self.info.id, self.info.kind, self.info.client, self.info.target);
        }
    }

    /// Non-fatal: the relay keeps running.
    pub fn proxy_error(&self, err: &dyn fmt::Display) {
        if self.registry.log {
            warn!(target: "socks", "relay #{} {} -> {}: {err}", self.info.id, self.info.client, self.info.target);
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.info.state = RelayState::Closed;
        self.registry.unregister(self.info.id);

        if self.registry.log {
            info!(target: "socks", "relay #{} {} {} -> {} closed", self.info.id, self.info.kind, self.info.client, self.info.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn test_handles_unregister_on_drop() {
        let registry = Arc::new(RelayRegistry::new(false));
        let first = registry.register(client(), "example.com:80".into(), RelayKind::TcpHttp);
        let second = registry.register(client(), "example.com:443".into(), RelayKind::TcpHttps);

        assert_ne!(first.id(), second.id());
        assert_eq!(registry.len(), 2);

        drop(first);
        let relays = registry.relays();
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].target, "example.com:443");
        assert_eq!(relays[0].state, RelayState::Pending);
    }

    #[test]
    fn test_connected_state_and_loopback_lookup() {
        let registry = Arc::new(RelayRegistry::new(false));
        let mut handle = registry.register(client(), "example.com:80".into(), RelayKind::TcpHttp);
        let loopback: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        handle.set_loopback(loopback);
        handle.connected();
        assert_eq!(registry.relays()[0].state, RelayState::Connected);
        assert_eq!(registry.client_for_loopback(loopback), Some(client()));
        assert_eq!(registry.client_for_loopback("127.0.0.1:1".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn test_close_all_cancels_everything() {
        let registry = Arc::new(RelayRegistry::new(false));
        let tcp = registry.register(client(), "a:1".into(), RelayKind::TcpHttp);
        let udp = registry.register(client(), "0.0.0.0:0".into(), RelayKind::Udp);

        assert_eq!(registry.close_all(), 2);
        assert!(registry.is_empty());
        tcp.cancelled().await;
        assert!(udp.is_cancelled());

        let late = registry.register(client(), "b:2".into(), RelayKind::TcpHttp);
        assert!(late.is_cancelled());
        assert!(registry.is_empty());
        assert_eq!(registry.close_all(), 0);
    }
}
