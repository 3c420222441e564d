//! Per-connection relay buffers.
//!
//! Each tunnel owns one buffer per direction. Capacity starts at the
//! configured baseline and is raised for upstream types that move large
//! handshake payloads (HTTP proxies, direct TLS traffic). Capacity only
//! ever grows; pending bytes survive every resize.

use bytes::BytesMut;

use crate::entry::ProxyProtocol;

/// Baseline capacity for SOCKS upstreams.
pub const BASELINE_CAPACITY: usize = 8 * 1024;
/// Minimum capacity for HTTP upstreams and the direct path.
pub const LARGE_CAPACITY: usize = 256 * 1024;
/// Floor for the doubling applied when an HTTP read overflows.
pub const HTTP_OVERFLOW_FLOOR: usize = 1024 * 1024;

/// One buffer per tunnel direction.
///
/// `inbound` carries client bytes toward the upstream, `outbound` carries
/// upstream bytes back to the client. The two are never aliased.
#[derive(Debug)]
pub struct RelayBuffers {
    pub inbound: BytesMut,
    pub outbound: BytesMut,
}

impl RelayBuffers {
    /// Allocate both directions at the given capacity.
    pub fn new(capacity: usize) -> Self {
        RelayBuffers {
            inbound: BytesMut::with_capacity(capacity),
            outbound: BytesMut::with_capacity(capacity),
        }
    }

    /// Allocate sized for the selected upstream type: at least the
    /// configured base, raised to [`LARGE_CAPACITY`] for HTTP and direct.
    pub fn for_protocol(base: usize, protocol: ProxyProtocol) -> Self {
        Self::new(base.max(min_capacity(protocol)))
    }

    /// Current capacity (both directions are kept in lockstep).
    pub fn capacity(&self) -> usize {
        self.inbound.capacity().min(self.outbound.capacity())
    }
}

/// Grow a buffer to at least `capacity`, keeping pending bytes. Never
/// shrinks.
pub fn ensure_capacity(buf: &mut BytesMut, capacity: usize) {
    if buf.capacity() < capacity {
        buf.reserve(capacity - buf.len());
    }
}

/// Double a buffer after an overflowing read; HTTP buffers are floored at
/// [`HTTP_OVERFLOW_FLOOR`]. The connection is torn down by the caller, so
/// this growth only sizes the final copy, never a retry.
pub fn grow_after_overflow(buf: &mut BytesMut, http: bool) {
    let mut target = buf.capacity() * 2;
    if http {
        target = target.max(HTTP_OVERFLOW_FLOOR);
    }
    ensure_capacity(buf, target);
}

/// Minimum buffer capacity for an upstream type.
pub fn min_capacity(protocol: ProxyProtocol) -> usize {
    match protocol {
        ProxyProtocol::Http | ProxyProtocol::Direct => LARGE_CAPACITY,
        ProxyProtocol::Socks5 | ProxyProtocol::Socks4 => BASELINE_CAPACITY,
    }
}
