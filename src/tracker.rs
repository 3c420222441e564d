//! Connection tracking.
//!
//! One [`ConnHandle`] per accepted client, held in a table keyed by
//! connection id. The reaper reads activity stamps and stages from the
//! handles and requests closure through their notify, never touching the
//! sockets themselves. The active count and the table are updated under the
//! same lock so they can never drift apart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Where a connection is in its lifecycle.
///
/// `Socks5Connect` doubles as the client-request stage and the upstream
/// CONNECT stage, matching the single shared progression of the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnStage {
    Initial = 0,
    Socks5Auth = 1,
    Socks5AuthResponse = 2,
    Socks5Connect = 3,
    Socks4Connect = 4,
    HttpConnect = 5,
    ProxyConnect = 6,
    ProxyConnected = 7,
    Error = 8,
}

impl ConnStage {
    fn from_u8(v: u8) -> ConnStage {
        match v {
            1 => ConnStage::Socks5Auth,
            2 => ConnStage::Socks5AuthResponse,
            3 => ConnStage::Socks5Connect,
            4 => ConnStage::Socks4Connect,
            5 => ConnStage::HttpConnect,
            6 => ConnStage::ProxyConnect,
            7 => ConnStage::ProxyConnected,
            8 => ConnStage::Error,
            _ => ConnStage::Initial,
        }
    }
}

/// Shared per-connection state: stage, activity stamp, close signal, and
/// the key of the upstream currently charged for this connection.
pub struct ConnHandle {
    pub id: u64,
    epoch: Instant,
    stage: AtomicU8,
    last_activity_ms: AtomicU64,
    close: Notify,
    proxy_key: Mutex<Option<String>>,
}

impl ConnHandle {
    fn new(id: u64, epoch: Instant) -> Self {
        let handle = ConnHandle {
            id,
            epoch,
            stage: AtomicU8::new(ConnStage::Initial as u8),
            last_activity_ms: AtomicU64::new(0),
            close: Notify::new(),
            proxy_key: Mutex::new(None),
        };
        handle.touch();
        handle
    }

    pub fn stage(&self) -> ConnStage {
        ConnStage::from_u8(self.stage.load(Ordering::Relaxed))
    }

    pub fn set_stage(&self, stage: ConnStage) {
        self.stage.store(stage as u8, Ordering::Relaxed);
    }

    /// Refresh the activity stamp.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// How long this connection has been idle.
    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Ask the owning task to tear the connection down. A permit is stored,
    /// so a close requested before the task reaches its select is not lost.
    pub fn request_close(&self) {
        self.close.notify_one();
    }

    /// Resolves when closure has been requested.
    pub async fn closed(&self) {
        self.close.notified().await;
    }

    pub fn set_proxy_key(&self, key: Option<String>) {
        *self.proxy_key.lock().unwrap() = key;
    }

    pub fn proxy_key(&self) -> Option<String> {
        self.proxy_key.lock().unwrap().clone()
    }

    pub fn take_proxy_key(&self) -> Option<String> {
        self.proxy_key.lock().unwrap().take()
    }
}

impl std::fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnHandle")
            .field("id", &self.id)
            .field("stage", &self.stage())
            .finish()
    }
}

/// Table of live connections.
pub struct ConnTracker {
    epoch: Instant,
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, Arc<ConnHandle>>>,
    active: AtomicUsize,
}

impl ConnTracker {
    pub fn new() -> Self {
        ConnTracker {
            epoch: Instant::now(),
            next_id: AtomicU64::new(1),
            conns: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
        }
    }

    /// Register a new connection and return its handle.
    pub fn register(&self) -> Arc<ConnHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ConnHandle::new(id, self.epoch));
        let mut conns = self.conns.lock().unwrap();
        conns.insert(id, Arc::clone(&handle));
        self.active.store(conns.len(), Ordering::Relaxed);
        handle
    }

    /// Drop a connection from the table.
    pub fn remove(&self, id: u64) {
        let mut conns = self.conns.lock().unwrap();
        conns.remove(&id);
        self.active.store(conns.len(), Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Snapshot of all live handles, for the reaper.
    pub fn snapshot(&self) -> Vec<Arc<ConnHandle>> {
        self.conns.lock().unwrap().values().cloned().collect()
    }

    /// Request closure of every live connection.
    pub fn close_all(&self) {
        for handle in self.snapshot() {
            handle.request_close();
        }
    }

    /// Forget every connection. Used on service stop, after the reactor is
    /// gone and no task can unregister itself anymore.
    pub fn clear(&self) {
        let mut conns = self.conns.lock().unwrap();
        conns.clear();
        self.active.store(0, Ordering::Relaxed);
    }
}

impl Default for ConnTracker {
    fn default() -> Self {
        Self::new()
    }
}
