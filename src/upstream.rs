//! Outbound upstream handshakes.
//!
//! Speaks the proxy side of the tunnel over an already-connected socket:
//! SOCKS5 (no-auth and username/password), SOCKS4/SOCKS4A, and HTTP
//! CONNECT with optional Basic credentials. Each handshake returns any
//! bytes the upstream sent past its own terminator; those are the first
//! tunneled chunk and belong to the client.
//!
//! The outcome distinguishes liveness failures (which count against the
//! upstream and are worth a retry elsewhere) from target errors and
//! credential mismatches (which are not the upstream's fault).

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::address::{Address, AddressError, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use crate::buffer;
use crate::entry::{ProxyEntry, ProxyProtocol};
use crate::socks::{
    AUTH_NONE, AUTH_USERPASS, CMD_CONNECT, REP_CONN_REFUSED, REP_GENERAL_FAILURE,
    REP_HOST_UNREACH, REP_SUCCESS, REP_TTL_EXPIRED, SOCKS4_GRANTED, VERSION5,
};
use crate::tracker::{ConnHandle, ConnStage};

/// User-Agent sent on HTTP CONNECT requests.
pub const USER_AGENT: &str = "proxy-rotate";

/// Why an upstream handshake did not produce a tunnel.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream I/O: {0}")]
    Io(#[from] io::Error),
    #[error("upstream rejected handshake: {0}")]
    Rejected(String),
    #[error("upstream rejected credentials")]
    AuthRejected,
    #[error("target unreachable (rep 0x{0:02x})")]
    TargetUnreachable(u8),
    #[error("response overflowed handshake buffer ({0} bytes)")]
    ResponseOverflow(usize),
    #[error("upstream address: {0}")]
    Address(#[from] AddressError),
}

impl UpstreamError {
    /// Whether this failure counts against the upstream's health and is
    /// worth retrying through a different entry. Credential mismatches and
    /// target errors are configuration, not liveness; a buffer overflow is
    /// a local resource condition and closes without penalty or retry.
    pub fn penalizes(&self) -> bool {
        matches!(
            self,
            UpstreamError::Io(_) | UpstreamError::Rejected(_) | UpstreamError::Address(_)
        )
    }

    /// The SOCKS5 reply code surfaced to the client.
    pub fn client_rep(&self) -> u8 {
        match self {
            UpstreamError::TargetUnreachable(rep) => *rep,
            _ => REP_GENERAL_FAILURE,
        }
    }
}

/// Drive the handshake for `entry`'s protocol. `target` is the client's
/// requested destination; `handle` tracks the stage for the reaper.
pub async fn handshake<S>(
    stream: &mut S,
    entry: &ProxyEntry,
    target: &Address,
    handle: &ConnHandle,
) -> Result<Bytes, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match entry.protocol {
        ProxyProtocol::Socks5 => socks5_handshake(stream, entry, target, handle).await,
        ProxyProtocol::Socks4 => socks4_handshake(stream, target, handle).await,
        ProxyProtocol::Http => http_connect(stream, entry, target, handle).await,
        // Direct sockets have no intermediary to talk to.
        ProxyProtocol::Direct => Ok(Bytes::new()),
    }
}

/// SOCKS5 greeting, optional RFC 1929 subnegotiation, CONNECT exchange.
async fn socks5_handshake<S>(
    stream: &mut S,
    entry: &ProxyEntry,
    target: &Address,
    handle: &ConnHandle,
) -> Result<Bytes, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handle.set_stage(ConnStage::Socks5Auth);

    if entry.has_credentials() {
        stream
            .write_all(&[VERSION5, 0x02, AUTH_NONE, AUTH_USERPASS])
            .await?;
    } else {
        stream.write_all(&[VERSION5, 0x01, AUTH_NONE]).await?;
    }

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method[0] != VERSION5 {
        return Err(UpstreamError::Rejected(format!(
            "bad greeting version 0x{:02x}",
            method[0]
        )));
    }

    match method[1] {
        AUTH_NONE => {}
        AUTH_USERPASS if entry.has_credentials() => {
            handle.set_stage(ConnStage::Socks5AuthResponse);
            let user = entry.username.as_deref().unwrap_or_default().as_bytes();
            let pass = entry.password.as_deref().unwrap_or_default().as_bytes();
            if user.len() > 255 || pass.len() > 255 {
                return Err(UpstreamError::Rejected("credentials too long".into()));
            }

            let mut req = Vec::with_capacity(3 + user.len() + pass.len());
            req.push(0x01); // subnegotiation version
            req.push(user.len() as u8);
            req.extend_from_slice(user);
            req.push(pass.len() as u8);
            req.extend_from_slice(pass);
            stream.write_all(&req).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[0] != 0x01 {
                return Err(UpstreamError::Rejected(format!(
                    "bad auth subnegotiation version 0x{:02x}",
                    status[0]
                )));
            }
            if status[1] != 0x00 {
                return Err(UpstreamError::AuthRejected);
            }
        }
        m => {
            return Err(UpstreamError::Rejected(format!(
                "unsupported auth method 0x{:02x}",
                m
            )))
        }
    }

    handle.set_stage(ConnStage::Socks5Connect);

    let mut req = vec![VERSION5, CMD_CONNECT, 0x00];
    req.extend_from_slice(&target.encode()?);
    stream.write_all(&req).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION5 {
        return Err(UpstreamError::Rejected(format!(
            "bad reply version 0x{:02x}",
            header[0]
        )));
    }

    let rep = header[1];
    // The bind address is consumed even on failure so trailing tunneled
    // bytes stay aligned in the socket.
    discard_bound_address(stream, header[3]).await?;

    match rep {
        REP_SUCCESS => Ok(Bytes::new()),
        REP_HOST_UNREACH | REP_CONN_REFUSED | REP_TTL_EXPIRED => {
            Err(UpstreamError::TargetUnreachable(rep))
        }
        other => Err(UpstreamError::Rejected(format!(
            "connect refused with rep 0x{:02x}",
            other
        ))),
    }
}

/// Consume the BND.ADDR/BND.PORT of a SOCKS5 reply.
async fn discard_bound_address<R>(r: &mut R, atyp: u8) -> Result<(), UpstreamError>
where
    R: AsyncRead + Unpin,
{
    let len = match atyp {
        ATYP_IPV4 => 6,
        ATYP_IPV6 => 18,
        ATYP_DOMAIN => {
            let mut l = [0u8; 1];
            r.read_exact(&mut l).await?;
            l[0] as usize + 2
        }
        t => return Err(UpstreamError::Rejected(format!("bad bind atyp 0x{:02x}", t))),
    };
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(())
}

/// SOCKS4 CONNECT, or SOCKS4A when the host is not an IPv4 literal.
async fn socks4_handshake<S>(
    stream: &mut S,
    target: &Address,
    handle: &ConnHandle,
) -> Result<Bytes, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handle.set_stage(ConnStage::Socks4Connect);

    let mut req = vec![0x04, CMD_CONNECT];
    req.extend_from_slice(&target.port.to_be_bytes());

    match target.host.parse::<std::net::Ipv4Addr>() {
        Ok(ip) => {
            req.extend_from_slice(&ip.octets());
            req.push(0x00); // empty user id
        }
        Err(_) => {
            // 4A marker address, then the hostname after the user id.
            req.extend_from_slice(&[0, 0, 0, 1]);
            req.push(0x00);
            req.extend_from_slice(target.host.as_bytes());
            req.push(0x00);
        }
    }
    stream.write_all(&req).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x00 {
        return Err(UpstreamError::Rejected(format!(
            "bad reply version 0x{:02x}",
            reply[0]
        )));
    }
    if reply[1] != SOCKS4_GRANTED {
        return Err(UpstreamError::Rejected(format!(
            "request rejected with code 0x{:02x}",
            reply[1]
        )));
    }
    Ok(Bytes::new())
}

/// HTTP CONNECT with optional Basic credentials.
async fn http_connect<S>(
    stream: &mut S,
    entry: &ProxyEntry,
    target: &Address,
    handle: &ConnHandle,
) -> Result<Bytes, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handle.set_stage(ConnStage::HttpConnect);

    let authority = target.authority();
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if entry.has_credentials() {
        let creds = format!(
            "{}:{}",
            entry.username.as_deref().unwrap_or_default(),
            entry.password.as_deref().unwrap_or_default()
        );
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(creds.as_bytes())
        ));
    }
    request.push_str("Connection: keep-alive\r\n");
    request.push_str(&format!("User-Agent: {USER_AGENT}\r\n\r\n"));
    stream.write_all(request.as_bytes()).await?;

    let mut buf = BytesMut::with_capacity(buffer::min_capacity(ProxyProtocol::Http));
    loop {
        if buf.len() == buf.capacity() {
            // The header block outgrew the buffer. Grow once for the final
            // copy, then tear the connection down rather than resume a
            // half-parsed handshake.
            let received = buf.len();
            buffer::grow_after_overflow(&mut buf, true);
            return Err(UpstreamError::ResponseOverflow(received));
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(UpstreamError::Rejected(
                "connection closed during CONNECT".into(),
            ));
        }

        if let Some(line_end) = find(&buf, b"\r\n") {
            let status_line = &buf[..line_end];
            if !contains(status_line, b"200") {
                if contains(status_line, b"407") {
                    return Err(UpstreamError::AuthRejected);
                }
                let shown = String::from_utf8_lossy(&status_line[..status_line.len().min(100)]);
                return Err(UpstreamError::Rejected(format!(
                    "CONNECT failed: {shown}"
                )));
            }
            // Success needs the complete header block; partial headers
            // stay buffered until more bytes arrive.
            if let Some(header_end) = find(&buf, b"\r\n\r\n") {
                let leftover = buf.split_off(header_end + 4);
                return Ok(leftover.freeze());
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ConnTracker;
    use std::sync::Arc;
    use tokio::io::duplex;
    use tokio::net::{TcpListener, TcpStream};

    fn handle() -> Arc<ConnHandle> {
        ConnTracker::new().register()
    }

    /// Spawn a no-auth SOCKS5 upstream that answers CONNECT with `rep`,
    /// appends `trailing` right after the reply, then echoes.
    async fn mock_socks5_upstream(rep: u8, trailing: Vec<u8>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut head = [0u8; 2];
                if stream.read_exact(&mut head).await.is_err() {
                    return;
                }
                let mut methods = vec![0u8; head[1] as usize];
                let _ = stream.read_exact(&mut methods).await;
                let _ = stream.write_all(&[0x05, 0x00]).await;

                let mut req = [0u8; 4];
                if stream.read_exact(&mut req).await.is_err() {
                    return;
                }
                let addr_len = match req[3] {
                    0x01 => 6,
                    0x04 => 18,
                    _ => {
                        let mut l = [0u8; 1];
                        let _ = stream.read_exact(&mut l).await;
                        l[0] as usize + 2
                    }
                };
                let mut rest = vec![0u8; addr_len];
                let _ = stream.read_exact(&mut rest).await;

                let mut reply = vec![0x05, rep, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
                reply.extend_from_slice(&trailing);
                let _ = stream.write_all(&reply).await;

                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_socks5_no_auth_success() {
        let addr = mock_socks5_upstream(0x00, Vec::new()).await;

        let entry = ProxyEntry::new(ProxyProtocol::Socks5, "127.0.0.1", addr.port());
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let h = handle();

        let leftover = handshake(&mut stream, &entry, &Address::domain("example.com", 443), &h)
            .await
            .unwrap();
        assert!(leftover.is_empty());
        assert_eq!(h.stage(), ConnStage::Socks5Connect);
    }

    #[tokio::test]
    async fn test_socks5_userpass_success() {
        let (mut ours, mut theirs) = duplex(4096);
        let entry = ProxyEntry::new(ProxyProtocol::Socks5, "p", 1080).with_credentials("u", "p");
        let target = Address::ipv4("1.2.3.4", 443);
        let h = handle();

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            theirs.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            theirs.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = [0u8; 7]; // 01 01 'u' 01 'p'  (ver ulen u plen p)
            theirs.read_exact(&mut auth[..5]).await.unwrap();
            assert_eq!(&auth[..5], &[0x01, 0x01, b'u', 0x01, b'p']);
            theirs.write_all(&[0x01, 0x00]).await.unwrap();

            let mut req = [0u8; 10];
            theirs.read_exact(&mut req).await.unwrap();
            assert_eq!(&req[..4], &[0x05, 0x01, 0x00, 0x01]);
            theirs
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let leftover = handshake(&mut ours, &entry, &target, &h).await.unwrap();
        assert!(leftover.is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_auth_rejected_is_not_penalized() {
        let (mut ours, mut theirs) = duplex(4096);
        let entry = ProxyEntry::new(ProxyProtocol::Socks5, "p", 1080).with_credentials("u", "bad");
        let h = handle();

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            theirs.read_exact(&mut greeting).await.unwrap();
            theirs.write_all(&[0x05, 0x02]).await.unwrap();
            let mut auth = [0u8; 7];
            theirs.read_exact(&mut auth).await.unwrap();
            theirs.write_all(&[0x01, 0x01]).await.unwrap(); // denied
        });

        let err = handshake(&mut ours, &entry, &Address::ipv4("1.2.3.4", 80), &h)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::AuthRejected));
        assert!(!err.penalizes());
        assert_eq!(err.client_rep(), REP_GENERAL_FAILURE);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_target_unreachable_reps() {
        for rep in [0x04, 0x05, 0x06] {
            let addr = mock_socks5_upstream(rep, Vec::new()).await;

            let entry = ProxyEntry::new(ProxyProtocol::Socks5, "127.0.0.1", addr.port());
            let mut stream = TcpStream::connect(addr).await.unwrap();

            let err = handshake(&mut stream, &entry, &Address::ipv4("9.9.9.9", 80), &handle())
                .await
                .unwrap_err();
            assert!(matches!(err, UpstreamError::TargetUnreachable(r) if r == rep));
            assert!(!err.penalizes());
            assert_eq!(err.client_rep(), rep);
        }
    }

    #[tokio::test]
    async fn test_socks5_trailing_bytes_stay_in_socket() {
        // Upstream appends tunneled bytes right after its reply; the
        // handshake must leave them for the relay.
        let addr = mock_socks5_upstream(0x00, b"early".to_vec()).await;

        let entry = ProxyEntry::new(ProxyProtocol::Socks5, "127.0.0.1", addr.port());
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let leftover = handshake(&mut stream, &entry, &Address::ipv4("1.2.3.4", 80), &handle())
            .await
            .unwrap();
        assert!(leftover.is_empty());

        let mut early = [0u8; 5];
        stream.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"early");
    }

    #[tokio::test]
    async fn test_socks4_ipv4_request_shape() {
        let (mut ours, mut theirs) = duplex(4096);
        let h = handle();

        let server = tokio::spawn(async move {
            let mut req = [0u8; 9];
            theirs.read_exact(&mut req).await.unwrap();
            assert_eq!(req, [0x04, 0x01, 0x00, 0x50, 93, 184, 216, 34, 0x00]);
            theirs
                .write_all(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let entry = ProxyEntry::new(ProxyProtocol::Socks4, "p", 1080);
        handshake(&mut ours, &entry, &Address::ipv4("93.184.216.34", 80), &h)
            .await
            .unwrap();
        assert_eq!(h.stage(), ConnStage::Socks4Connect);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks4a_domain_request_shape() {
        let (mut ours, mut theirs) = duplex(4096);

        let server = tokio::spawn(async move {
            let mut req = vec![0u8; 9 + 11 + 1];
            theirs.read_exact(&mut req).await.unwrap();
            let mut expected = vec![0x04, 0x01, 0x00, 0x50, 0, 0, 0, 1, 0x00];
            expected.extend_from_slice(b"example.org");
            expected.push(0x00);
            assert_eq!(req, expected);
            theirs
                .write_all(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let entry = ProxyEntry::new(ProxyProtocol::Socks4, "p", 1080);
        handshake(&mut ours, &entry, &Address::domain("example.org", 80), &handle())
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks4_rejection() {
        let (mut ours, mut theirs) = duplex(4096);

        let server = tokio::spawn(async move {
            let mut req = [0u8; 9];
            theirs.read_exact(&mut req).await.unwrap();
            theirs
                .write_all(&[0x00, 0x5B, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let entry = ProxyEntry::new(ProxyProtocol::Socks4, "p", 1080);
        let err = handshake(&mut ours, &entry, &Address::ipv4("1.2.3.4", 80), &handle())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Rejected(_)));
        assert!(err.penalizes());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_connect_with_auth() {
        let (mut ours, mut theirs) = duplex(8192);
        let entry = ProxyEntry::new(ProxyProtocol::Http, "p", 3128).with_credentials("u", "p");
        let h = handle();

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = theirs.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            theirs
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            req
        });

        let leftover = handshake(&mut ours, &entry, &Address::domain("t", 443), &h)
            .await
            .unwrap();
        assert!(leftover.is_empty());
        assert_eq!(h.stage(), ConnStage::HttpConnect);

        let req = server.await.unwrap();
        assert!(req.starts_with("CONNECT t:443 HTTP/1.1\r\n"), "got: {req}");
        assert!(req.contains("Host: t:443\r\n"));
        assert!(req.contains("Proxy-Authorization: Basic dTpw\r\n"));
        assert!(req.contains("Connection: keep-alive\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_http_connect_407() {
        let (mut ours, mut theirs) = duplex(8192);
        let entry = ProxyEntry::new(ProxyProtocol::Http, "p", 3128);

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = theirs.read(&mut buf).await.unwrap();
            theirs
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let err = handshake(&mut ours, &entry, &Address::domain("t", 443), &handle())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::AuthRejected));
        assert!(!err.penalizes());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_connect_failure_status() {
        let (mut ours, mut theirs) = duplex(8192);
        let entry = ProxyEntry::new(ProxyProtocol::Http, "p", 3128);

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = theirs.read(&mut buf).await.unwrap();
            theirs
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await
                .unwrap();
        });

        let err = handshake(&mut ours, &entry, &Address::domain("t", 443), &handle())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Rejected(_)));
        assert!(err.penalizes());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_connect_split_headers_and_leftover() {
        let (mut ours, mut theirs) = duplex(8192);
        let entry = ProxyEntry::new(ProxyProtocol::Http, "p", 3128);

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = theirs.read(&mut buf).await.unwrap();
            // Headers arrive in two pieces, then tunneled bytes follow.
            theirs.write_all(b"HTTP/1.1 200 OK\r\nVia: x\r").await.unwrap();
            tokio::task::yield_now().await;
            theirs.write_all(b"\n\r\nearly-bytes").await.unwrap();
        });

        let leftover = handshake(&mut ours, &entry, &Address::domain("t", 443), &handle())
            .await
            .unwrap();
        assert_eq!(&leftover[..], b"early-bytes");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_connect_overflow_is_resource_not_liveness() {
        let (mut ours, mut theirs) = duplex(64 * 1024);
        let entry = ProxyEntry::new(ProxyProtocol::Http, "p", 3128);

        // A 200 status line followed by header bytes that never terminate
        // the block, until the write side is torn down under it.
        let server = tokio::spawn(async move {
            let mut req = vec![0u8; 4096];
            let _ = theirs.read(&mut req).await;
            if theirs.write_all(b"HTTP/1.1 200 OK\r\n").await.is_err() {
                return;
            }
            let padding = [b'a'; 1024];
            loop {
                if theirs.write_all(&padding).await.is_err() {
                    return;
                }
            }
        });

        let err = handshake(&mut ours, &entry, &Address::domain("t", 443), &handle())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::ResponseOverflow(_)));
        assert!(!err.penalizes());
        assert_eq!(err.client_rep(), REP_GENERAL_FAILURE);

        drop(ours);
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_http_connect_ipv6_authority() {
        let (mut ours, mut theirs) = duplex(8192);
        let entry = ProxyEntry::new(ProxyProtocol::Http, "p", 3128);

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = theirs.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            theirs.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            req
        });

        handshake(&mut ours, &entry, &Address::ipv6("2001:db8::1", 443), &handle())
            .await
            .unwrap();
        let req = server.await.unwrap();
        assert!(req.starts_with("CONNECT [2001:db8::1]:443 HTTP/1.1\r\n"), "got: {req}");
    }
}
