//! Per-connection orchestration.
//!
//! Each accepted client runs one task: terminate the inbound handshake,
//! pick a path (bypass direct or a rotated upstream with a retry budget),
//! complete the upstream handshake, answer the client, then relay bytes
//! both ways until either side closes, an error occurs, or the reaper
//! requests closure.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::address::Address;
use crate::buffer::RelayBuffers;
use crate::config::Settings;
use crate::entry::ProxyEntry;
use crate::socks::{self, ClientRequest, REP_GENERAL_FAILURE};
use crate::sockopt;
use crate::server::ServiceState;
use crate::tracker::{ConnHandle, ConnStage};
use crate::upstream::{self, UpstreamError};

/// Extra upstream attempts after the first selection fails.
pub const RETRY_ATTEMPTS: u32 = 2;

/// Entry point for one accepted client socket. Always unregisters the
/// connection and releases its upstream charge on the way out.
pub(crate) async fn handle_client(
    state: Arc<ServiceState>,
    mut client: TcpStream,
    handle: Arc<ConnHandle>,
) {
    tokio::select! {
        _ = drive(&state, &mut client, &handle) => {}
        _ = handle.closed() => {
            state.events.info("Closing connection on request");
        }
    }

    if let Some(key) = handle.take_proxy_key() {
        state.registry.release(&key);
    }
    state.tracker.remove(handle.id);
}

/// Run a connection from handshake to relay completion. Protocol errors
/// are answered on the wire before this returns.
async fn drive(state: &ServiceState, client: &mut TcpStream, handle: &ConnHandle) {
    let request = match socks::read_client_request(client).await {
        Ok(req) => req,
        Err(e) => {
            state.events.error(&format!("Client handshake failed: {e}"));
            handle.set_stage(ConnStage::Error);
            return;
        }
    };

    let settings = state.settings.read().unwrap().clone();

    let outcome = dispatch(state, client, handle, &request, &settings).await;
    let (mut remote, entry, leftover) = match outcome {
        Some(tuple) => tuple,
        None => {
            handle.set_stage(ConnStage::Error);
            return;
        }
    };

    if socks::reply_success(client, request.version).await.is_err() {
        return;
    }
    handle.set_stage(ConnStage::ProxyConnected);
    handle.touch();

    let mut buffers = RelayBuffers::for_protocol(settings.buffer_size, entry.protocol);
    if !leftover.is_empty() && client.write_all(&leftover).await.is_err() {
        return;
    }

    // Transport errors past this point close both sides without ceremony.
    let _ = relay(client, &mut remote, handle, &mut buffers).await;
}

/// Resolve the path for a request: bypass-direct when the target matches,
/// otherwise the rotating pool. Returns the connected upstream socket, the
/// entry it went through, and any early tunneled bytes.
async fn dispatch(
    state: &ServiceState,
    client: &mut TcpStream,
    handle: &ConnHandle,
    request: &ClientRequest,
    settings: &Settings,
) -> Option<(TcpStream, ProxyEntry, Bytes)> {
    if settings.bypass.matches(&request.target.host) {
        state.events.info(&format!(
            "Bypassing proxy for domain: {}",
            request.target.host
        ));
        match connect_direct(&request.target, settings, handle).await {
            Ok(stream) => {
                let entry = ProxyEntry::direct(&request.target.host, request.target.port);
                return Some((stream, entry, Bytes::new()));
            }
            Err(e) => {
                // One fallback through the pool, then the normal path.
                state.events.error(&format!(
                    "Direct connection to {} failed, falling back to proxy: {e}",
                    request.target
                ));
            }
        }
    }

    connect_via_pool(state, client, handle, request, settings).await
}

/// Direct TCP to the target, tuned for TLS-heavy traffic.
async fn connect_direct(
    target: &Address,
    settings: &Settings,
    handle: &ConnHandle,
) -> io::Result<TcpStream> {
    handle.set_stage(ConnStage::ProxyConnect);
    let stream = timeout(
        settings.connect_timeout(),
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "direct connect timed out"))??;

    stream.set_nodelay(true)?;
    let _ = sockopt::set_keepalive(&stream, true);
    let _ = sockopt::set_socket_buffers(&stream, sockopt::TUNNEL_SOCKET_BUFFER);
    Ok(stream)
}

/// Select, connect, and handshake through the pool, honoring the retry
/// budget. Failures that exhaust the budget are answered to the client
/// here; `None` means the connection is done.
async fn connect_via_pool(
    state: &ServiceState,
    client: &mut TcpStream,
    handle: &ConnHandle,
    request: &ClientRequest,
    settings: &Settings,
) -> Option<(TcpStream, ProxyEntry, Bytes)> {
    let mut exclude: Option<String> = None;
    let mut attempts_left = RETRY_ATTEMPTS;

    loop {
        let entry = match state
            .registry
            .select(settings.selection_mode, exclude.as_deref())
        {
            Some(entry) => entry,
            None => {
                state.events.error("No active proxies available");
                let _ = socks::reply_failure(client, request.version, REP_GENERAL_FAILURE).await;
                return None;
            }
        };

        let key = entry.key();
        state.registry.acquire(&key);
        handle.set_proxy_key(Some(key.clone()));
        state.events.info(&format!(
            "Using proxy {} for target {}",
            entry.sanitized_url(),
            request.target
        ));

        let in_flight = state.registry.connections_for(&key);
        if in_flight > settings.max_connections_per_proxy {
            state.events.info(&format!(
                "Proxy {key} carries {in_flight} connections (soft cap {})",
                settings.max_connections_per_proxy
            ));
        }

        match connect_and_handshake(&entry, &request.target, settings, handle).await {
            Ok((stream, leftover)) => {
                state.registry.record_success(&entry);
                return Some((stream, entry, leftover));
            }
            Err(err) => {
                state.registry.release(&key);
                handle.set_proxy_key(None);
                state
                    .events
                    .error(&format!("Upstream {key} failed: {err}"));

                if err.penalizes() {
                    state.registry.record_failure(&entry);
                    if attempts_left > 0 {
                        attempts_left -= 1;
                        exclude = Some(key);
                        continue;
                    }
                }

                let _ = socks::reply_failure(client, request.version, err.client_rep()).await;
                return None;
            }
        }
    }
}

/// TCP connect to the proxy itself, then its protocol handshake.
async fn connect_and_handshake(
    entry: &ProxyEntry,
    target: &Address,
    settings: &Settings,
    handle: &ConnHandle,
) -> Result<(TcpStream, Bytes), UpstreamError> {
    handle.set_stage(ConnStage::ProxyConnect);
    let mut stream = timeout(
        settings.connect_timeout(),
        TcpStream::connect((entry.host.as_str(), entry.port)),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "proxy connect timed out"))??;

    stream.set_nodelay(true)?;
    if entry.is_http() {
        let _ = sockopt::set_socket_buffers(&stream, sockopt::TUNNEL_SOCKET_BUFFER);
    }

    let leftover = upstream::handshake(&mut stream, entry, target, handle).await?;
    Ok((stream, leftover))
}

/// Pump bytes in both directions until one side reaches EOF or errors.
/// Every transfer refreshes the activity stamp the reaper reads.
async fn relay(
    client: &mut TcpStream,
    remote: &mut TcpStream,
    handle: &ConnHandle,
    buffers: &mut RelayBuffers,
) -> io::Result<()> {
    let RelayBuffers { inbound, outbound } = buffers;
    let (mut client_r, mut client_w) = client.split();
    let (mut remote_r, mut remote_w) = remote.split();

    loop {
        tokio::select! {
            res = client_r.read_buf(inbound) => {
                if res? == 0 {
                    return Ok(());
                }
                handle.touch();
                remote_w.write_all(&inbound[..]).await?;
                inbound.clear();
            }
            res = remote_r.read_buf(outbound) => {
                if res? == 0 {
                    return Ok(());
                }
                handle.touch();
                client_w.write_all(&outbound[..]).await?;
                outbound.clear();
            }
        }
    }
}
