//! Periodic upstream health checks.
//!
//! Every five minutes each listed entry gets a probe on a socket the
//! checker opens and closes itself: TCP connect, SOCKS5 no-auth greeting,
//! expect `05 00`. A passing probe clears the entry's failure history and
//! reactivates it; a failing one feeds the same counter the connection
//! path uses. Live tunnels are never touched.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use crate::entry::ProxyEntry;
use crate::events::EventSink;
use crate::registry::ProxyRegistry;

/// Time between health check sweeps.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Deadline for a single probe, connect included.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run health sweeps until shutdown. Sleeps first so fresh services do not
/// probe a list the host is still loading.
pub async fn run(
    registry: Arc<ProxyRegistry>,
    events: Arc<EventSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = sleep(HEALTH_CHECK_INTERVAL) => {}
            _ = shutdown.changed() => return,
        }

        events.info("Running periodic proxy health check");
        for entry in registry.entries() {
            if *shutdown.borrow() {
                return;
            }
            match probe(&entry).await {
                Ok(()) => registry.mark_healthy(&entry),
                Err(e) => {
                    events.error(&format!(
                        "Health check: proxy {} failed: {e}",
                        entry.key()
                    ));
                    registry.record_failure(&entry);
                }
            }
        }
    }
}

/// One probe: connect and exchange the minimal SOCKS5 greeting.
pub async fn probe(entry: &ProxyEntry) -> io::Result<()> {
    timeout(PROBE_TIMEOUT, probe_inner(entry))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "probe timed out"))?
}

async fn probe_inner(entry: &ProxyEntry) -> io::Result<()> {
    let mut stream = TcpStream::connect((entry.host.as_str(), entry.port)).await?;
    stream.write_all(&[0x05, 0x01, 0x00]).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [0x05, 0x00] {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected greeting response",
        ));
    }
    Ok(())
}
