//! Host callbacks.
//!
//! The embedding tool supplies a [`RotateEvents`] implementation; the
//! service reports through it instead of owning a log sink. Log lines are
//! gated by the runtime logging toggle, state-change notifications always
//! fire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callbacks the service invokes on the host.
///
/// All methods have no-op defaults so hosts implement only what they
/// surface.
pub trait RotateEvents: Send + Sync {
    /// Informational log line.
    fn log_info(&self, _message: &str) {}

    /// Error log line.
    fn log_error(&self, _message: &str) {}

    /// An upstream was marked inactive after repeated failures.
    fn proxy_failed(&self, _host: &str, _port: u16, _message: &str) {}

    /// A previously inactive upstream passed a health check.
    fn proxy_reactivated(&self, _host: &str, _port: u16) {}
}

/// Event sink that forwards log lines to `tracing`.
#[derive(Debug, Default)]
pub struct TracingEvents;

impl RotateEvents for TracingEvents {
    fn log_info(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn log_error(&self, message: &str) {
        tracing::error!("{message}");
    }

    fn proxy_failed(&self, host: &str, port: u16, message: &str) {
        tracing::warn!("proxy {host}:{port} failed: {message}");
    }

    fn proxy_reactivated(&self, host: &str, port: u16) {
        tracing::info!("proxy {host}:{port} reactivated");
    }
}

/// Silent sink for tests.
#[derive(Debug, Default)]
pub struct NullEvents;

impl RotateEvents for NullEvents {}

/// Shared handle wrapping the host callbacks with the logging toggle.
pub struct EventSink {
    events: Arc<dyn RotateEvents>,
    logging: AtomicBool,
}

impl EventSink {
    pub fn new(events: Arc<dyn RotateEvents>, logging: bool) -> Self {
        EventSink {
            events,
            logging: AtomicBool::new(logging),
        }
    }

    pub fn set_logging(&self, enabled: bool) {
        self.logging.store(enabled, Ordering::Relaxed);
    }

    pub fn logging_enabled(&self) -> bool {
        self.logging.load(Ordering::Relaxed)
    }

    pub fn info(&self, message: &str) {
        if self.logging_enabled() {
            self.events.log_info(message);
        }
    }

    pub fn error(&self, message: &str) {
        if self.logging_enabled() {
            self.events.log_error(message);
        }
    }

    pub fn proxy_failed(&self, host: &str, port: u16, message: &str) {
        self.events.proxy_failed(host, port, message);
    }

    pub fn proxy_reactivated(&self, host: &str, port: u16) {
        self.events.proxy_reactivated(host, port);
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("logging", &self.logging_enabled())
            .finish()
    }
}
