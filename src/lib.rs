//! proxy-rotate - local SOCKS endpoint with upstream rotation.
//!
//! This crate provides:
//! - `server`: the service itself (reactor thread, accept loop, reaper)
//! - `registry`: the rotating upstream pool with failure tracking
//! - `socks` / `upstream`: the inbound and outbound handshake codecs
//! - `events`: the host callback surface
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use proxy_rotate::{
//!     EventSink, ProxyEntry, ProxyRegistry, ProxyRotateService, TracingEvents,
//! };
//!
//! let events = Arc::new(EventSink::new(Arc::new(TracingEvents), true));
//! let registry = Arc::new(ProxyRegistry::with_entries(
//!     vec![ProxyEntry::parse("socks5://127.0.0.1:9050").unwrap()],
//!     Arc::clone(&events),
//! ));
//!
//! let service = ProxyRotateService::new(registry, events);
//! service.start(1080)?;
//! // ... clients connect to localhost:1080 ...
//! service.stop();
//! ```

pub mod address;
pub mod buffer;
pub mod bypass;
pub mod config;
pub mod conn;
pub mod entry;
pub mod events;
pub mod health;
pub mod registry;
pub mod server;
pub mod socks;
pub mod sockopt;
pub mod tracker;
pub mod upstream;

// Re-export commonly used types at crate root for convenience
pub use address::{Address, AddressError, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
pub use bypass::{BypassList, DEFAULT_BYPASS_DOMAINS};
pub use config::{ConfigError, FileConfig, SelectionMode, Settings};
pub use entry::{EntryParseError, ProxyEntry, ProxyId, ProxyProtocol};
pub use events::{EventSink, NullEvents, RotateEvents, TracingEvents};
pub use registry::{ProxyRegistry, MAX_FAILURES};
pub use server::{ProxyRotateService, ServiceError};
pub use tracker::{ConnStage, ConnTracker};
pub use upstream::UpstreamError;
