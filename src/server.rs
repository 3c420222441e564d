//! The proxy rotate service.
//!
//! One dedicated reactor thread owns a current-thread scheduler and with it
//! every socket and every piece of connection state: the accept loop, the
//! per-connection tasks, the idle reaper, and the health checker all run
//! there cooperatively. The host talks to the service from its own threads
//! through the shared state: settings updates, stats reads, and the
//! start/stop switches.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::time::sleep;

use crate::config::{SelectionMode, Settings};
use crate::conn;
use crate::events::EventSink;
use crate::health;
use crate::registry::ProxyRegistry;
use crate::sockopt;
use crate::tracker::{ConnStage, ConnTracker};

/// Accept backlog for connection surges.
pub const ACCEPT_BACKLOG: u32 = 1000;
/// Time between reaper sweeps.
pub const REAP_INTERVAL: Duration = Duration::from_secs(30);
/// Established tunnels idle this long are closed to force rotation.
pub const MODERATE_IDLE: Duration = Duration::from_secs(10);
/// How long start waits for the reactor thread to come up.
const START_TIMEOUT: Duration = Duration::from_secs(5);
/// How long stop waits for the reactor thread to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Service-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("bind localhost:{port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("service runtime: {0}")]
    Runtime(#[from] io::Error),
    #[error("reactor thread did not start within {0:?}")]
    StartTimeout(Duration),
}

/// State shared between the host-facing service handle and the reactor.
pub struct ServiceState {
    pub settings: RwLock<Settings>,
    pub registry: Arc<ProxyRegistry>,
    pub tracker: Arc<ConnTracker>,
    pub events: Arc<EventSink>,
    pub running: AtomicBool,
    pub shutdown: watch::Sender<bool>,
}

impl ServiceState {
    pub fn new(registry: Arc<ProxyRegistry>, events: Arc<EventSink>, settings: Settings) -> Self {
        ServiceState {
            settings: RwLock::new(settings),
            registry,
            tracker: Arc::new(ConnTracker::new()),
            events,
            running: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
        }
    }
}

struct ReactorHandle {
    thread: thread::JoinHandle<()>,
    done: crossbeam_channel::Receiver<()>,
}

/// The local SOCKS endpoint with upstream rotation.
pub struct ProxyRotateService {
    state: Arc<ServiceState>,
    reactor: Mutex<Option<ReactorHandle>>,
    local_port: AtomicU16,
}

impl ProxyRotateService {
    pub fn new(registry: Arc<ProxyRegistry>, events: Arc<EventSink>) -> Self {
        Self::with_settings(registry, events, Settings::default())
    }

    pub fn with_settings(
        registry: Arc<ProxyRegistry>,
        events: Arc<EventSink>,
        settings: Settings,
    ) -> Self {
        events.set_logging(settings.logging);
        ProxyRotateService {
            state: Arc::new(ServiceState::new(registry, events, settings)),
            reactor: Mutex::new(None),
            local_port: AtomicU16::new(0),
        }
    }

    /// Start listening on `localhost:port` (0 picks an ephemeral port).
    /// Starting an already-running service is a no-op.
    pub fn start(&self, port: u16) -> Result<(), ServiceError> {
        if self.state.running.swap(true, Ordering::SeqCst) {
            self.state.events.info("Service is already running");
            return Ok(());
        }
        self.state.shutdown.send_replace(false);

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let state = Arc::clone(&self.state);

        let thread = thread::Builder::new()
            .name("proxy-rotate-reactor".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(ServiceError::Runtime(e)));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match bind(port).await {
                        Ok(l) => l,
                        Err(source) => {
                            let _ = ready_tx.send(Err(ServiceError::Bind { port, source }));
                            return;
                        }
                    };
                    let local = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                    let _ = ready_tx.send(Ok(local));
                    reactor_main(state, listener).await;
                });
                let _ = done_tx.send(());
            })
            .map_err(ServiceError::Runtime)?;

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(local)) => {
                self.local_port.store(local, Ordering::SeqCst);
                *self.reactor.lock().unwrap() = Some(ReactorHandle { thread, done: done_rx });
                self.state
                    .events
                    .info(&format!("Proxy rotate service started on localhost:{local}"));
                Ok(())
            }
            Ok(Err(e)) => {
                self.state.running.store(false, Ordering::SeqCst);
                let _ = thread.join();
                self.state
                    .events
                    .error(&format!("Error starting service: {e}"));
                Err(e)
            }
            Err(_) => {
                self.state.running.store(false, Ordering::SeqCst);
                Err(ServiceError::StartTimeout(START_TIMEOUT))
            }
        }
    }

    /// Stop the service: close the listener and every connection, then wait
    /// up to five seconds for the reactor thread before abandoning it.
    /// Stopping a stopped service is a no-op.
    pub fn stop(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            self.state.events.info("Service is not running");
            return;
        }
        self.state.events.info("Proxy rotate service stopping");

        self.state.shutdown.send_replace(true);
        self.state.tracker.close_all();

        if let Some(handle) = self.reactor.lock().unwrap().take() {
            match handle.done.recv_timeout(STOP_TIMEOUT) {
                Ok(()) => {
                    let _ = handle.thread.join();
                }
                Err(_) => {
                    // Hard shutdown: the thread is abandoned with its sockets.
                    self.state
                        .events
                        .error("Reactor thread did not acknowledge stop in time");
                }
            }
        }

        self.state.tracker.clear();
        self.state.registry.reset_counters();
        self.local_port.store(0, Ordering::SeqCst);
        self.state.events.info("Proxy rotate service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Actual bound port, 0 when stopped.
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.state.tracker.active_connections()
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.state.registry
    }

    /// One-line connection statistics for the host UI.
    pub fn stats(&self) -> String {
        if !self.is_running() {
            return "Service not running".to_string();
        }

        let mut stats = format!(
            "Active connections: {}",
            self.state.tracker.active_connections()
        );

        let per_proxy = self.state.registry.connections_snapshot();
        if !per_proxy.is_empty() {
            let mut using = 0usize;
            let mut busiest: Option<(String, usize)> = None;
            for (key, count) in per_proxy {
                if count > 0 {
                    using += 1;
                    if busiest.as_ref().map_or(true, |(_, max)| count > *max) {
                        busiest = Some((key, count));
                    }
                }
            }
            stats.push_str(&format!(" | Using {using} proxies"));
            if let Some((key, max)) = busiest {
                if max > 2 {
                    stats.push_str(&format!(", busiest: {key}({max})"));
                }
            }
        }

        stats
    }

    /// Update the numeric tunables. Logged only when something changed.
    pub fn set_settings(
        &self,
        buffer_size: usize,
        idle_timeout_secs: u64,
        max_connections_per_proxy: usize,
    ) {
        let changed = {
            let mut settings = self.state.settings.write().unwrap();
            let changed = settings.buffer_size != buffer_size
                || settings.idle_timeout_secs != idle_timeout_secs
                || settings.max_connections_per_proxy != max_connections_per_proxy;
            settings.buffer_size = buffer_size;
            settings.idle_timeout_secs = idle_timeout_secs;
            settings.max_connections_per_proxy = max_connections_per_proxy;
            changed
        };
        if changed {
            self.state.events.info(&format!(
                "Settings updated: buffer_size={buffer_size}, idle_timeout_secs={idle_timeout_secs}, max_connections_per_proxy={max_connections_per_proxy}"
            ));
        }
    }

    pub fn set_logging_enabled(&self, enabled: bool) {
        self.state.settings.write().unwrap().logging = enabled;
        self.state.events.set_logging(enabled);
        self.state
            .events
            .info(if enabled { "Logging enabled" } else { "Logging disabled" });
    }

    pub fn set_selection_mode(&self, mode: SelectionMode) {
        let changed = {
            let mut settings = self.state.settings.write().unwrap();
            let changed = settings.selection_mode != mode;
            settings.selection_mode = mode;
            changed
        };
        if changed {
            self.state
                .events
                .info(&format!("Proxy selection mode set to {mode:?}"));
        }
    }

    pub fn set_bypass_enabled(&self, enabled: bool) {
        self.state.settings.write().unwrap().bypass.enabled = enabled;
        self.state.events.info(&format!(
            "Bypass for collaborator domains {}",
            if enabled { "enabled" } else { "disabled" }
        ));
    }

    pub fn add_bypass_domain(&self, domain: &str) {
        if self.state.settings.write().unwrap().bypass.add(domain) {
            self.state
                .events
                .info(&format!("Added bypass domain: {domain}"));
        }
    }

    pub fn remove_bypass_domain(&self, domain: &str) {
        if self.state.settings.write().unwrap().bypass.remove(domain) {
            self.state
                .events
                .info(&format!("Removed bypass domain: {domain}"));
        }
    }

    pub fn clear_bypass_domains(&self) {
        self.state.settings.write().unwrap().bypass.clear();
        self.state.events.info("All bypass domains cleared");
    }

    /// Restore every setting to its default.
    pub fn reset_to_defaults(&self) {
        let defaults = Settings::default();
        self.state.events.set_logging(defaults.logging);
        *self.state.settings.write().unwrap() = defaults;
        self.state.events.info("All settings reset to defaults");
    }

    pub fn settings(&self) -> Settings {
        self.state.settings.read().unwrap().clone()
    }
}

impl Drop for ProxyRotateService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the accept socket on the loopback interface.
async fn bind(port: u16) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from(([127, 0, 0, 1], port)))?;
    socket.listen(ACCEPT_BACKLOG)
}

/// The accept loop. Runs on the reactor thread until shutdown.
async fn reactor_main(state: Arc<ServiceState>, listener: TcpListener) {
    let mut shutdown = state.shutdown.subscribe();

    tokio::spawn(reaper_loop(Arc::clone(&state), state.shutdown.subscribe()));
    tokio::spawn(health::run(
        Arc::clone(&state.registry),
        Arc::clone(&state.events),
        state.shutdown.subscribe(),
    ));

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok((stream, _)) => {
                        let _ = stream.set_nodelay(true);
                        let _ = sockopt::set_keepalive(&stream, true);
                        let handle = state.tracker.register();
                        state.events.info("New client connection accepted");
                        tokio::spawn(conn::handle_client(Arc::clone(&state), stream, handle));
                    }
                    Err(e) => {
                        if !state.running.load(Ordering::SeqCst) {
                            break;
                        }
                        state.events.error(&format!("Accept failed: {e}"));
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    state.tracker.close_all();
    // Let connection tasks observe their close requests before the
    // runtime is torn down with them.
    sleep(Duration::from_millis(100)).await;
}

/// Periodic idle sweep.
async fn reaper_loop(state: Arc<ServiceState>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = sleep(REAP_INTERVAL) => {}
            _ = shutdown.changed() => return,
        }
        let idle_timeout = state.settings.read().unwrap().idle_timeout();
        reap_idle_connections(&state, idle_timeout, MODERATE_IDLE);
    }
}

/// Close connections idle past `idle_timeout`, and established tunnels
/// idle past `moderate_idle` so the next request rotates to a different
/// upstream. Returns how many closes were requested.
fn reap_idle_connections(
    state: &ServiceState,
    idle_timeout: Duration,
    moderate_idle: Duration,
) -> usize {
    let mut closed = 0;
    for handle in state.tracker.snapshot() {
        let idle = handle.idle_for();
        if idle > idle_timeout {
            state.events.info("Closing idle connection");
            handle.request_close();
            closed += 1;
        } else if idle > moderate_idle && handle.stage() == ConnStage::ProxyConnected {
            state
                .events
                .info("Closing moderately idle connection to force rotation");
            handle.request_close();
            closed += 1;
        }
    }
    if closed > 0 {
        state.events.info(&format!(
            "Closed {closed} connections to enforce proxy rotation"
        ));
    }
    closed
}
