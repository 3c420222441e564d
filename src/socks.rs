//! Inbound SOCKS termination.
//!
//! Decodes the client side of SOCKS4, SOCKS4A, and SOCKS5 up to the CONNECT
//! request and emits the replies. Only CONNECT is supported; BIND and UDP
//! ASSOCIATE are rejected with the protocol's "command not supported" code.
//!
//! Parsing is incremental: every read awaits exactly the bytes the next
//! field needs, so a client trickling one byte at a time decodes the same
//! as one sending the whole request at once.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::{Address, AddressError, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

// SOCKS protocol constants.
pub const VERSION5: u8 = 0x05;
pub const VERSION4: u8 = 0x04;

pub const CMD_CONNECT: u8 = 0x01;

pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_USERPASS: u8 = 0x02;
pub const AUTH_NO_ACCEPT: u8 = 0xFF;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NETWORK_UNREACH: u8 = 0x03;
pub const REP_HOST_UNREACH: u8 = 0x04;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS4 reply codes.
pub const SOCKS4_GRANTED: u8 = 0x5A;
pub const SOCKS4_REJECTED: u8 = 0x5B;

/// Longest accepted null-terminated field (user id or 4A domain).
const MAX_NULL_FIELD: usize = 512;

/// Which SOCKS version the client spoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

/// A terminated CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub version: SocksVersion,
    pub target: Address,
}

/// Inbound protocol errors.
#[derive(Debug)]
pub enum SocksError {
    Io(io::Error),
    /// Version byte or field layout is not SOCKS4/4A/5.
    InvalidProtocol,
    /// A command other than CONNECT.
    UnsupportedCommand(u8),
    Address(AddressError),
}

impl std::fmt::Display for SocksError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocksError::Io(e) => write!(f, "socks IO error: {}", e),
            SocksError::InvalidProtocol => write!(f, "invalid protocol"),
            SocksError::UnsupportedCommand(c) => write!(f, "unsupported command: 0x{:02x}", c),
            SocksError::Address(e) => write!(f, "socks address error: {}", e),
        }
    }
}

impl std::error::Error for SocksError {}

impl From<io::Error> for SocksError {
    fn from(e: io::Error) -> Self {
        SocksError::Io(e)
    }
}

impl From<AddressError> for SocksError {
    fn from(e: AddressError) -> Self {
        SocksError::Address(e)
    }
}

/// Terminate the client handshake and return its CONNECT target.
///
/// For SOCKS5 the no-auth method reply is written before the request is
/// read; offered methods are ignored. Rejections (`CMD ≠ CONNECT`, unknown
/// address type) are answered on the wire before the error is returned.
pub async fn read_client_request<S>(stream: &mut S) -> Result<ClientRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;

    match version[0] {
        VERSION5 => read_socks5_request(stream).await,
        VERSION4 => read_socks4_request(stream).await,
        _ => Err(SocksError::InvalidProtocol),
    }
}

/// SOCKS5 greeting and request (version byte already consumed).
async fn read_socks5_request<S>(stream: &mut S) -> Result<ClientRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut n_methods = [0u8; 1];
    stream.read_exact(&mut n_methods).await?;

    let mut methods = vec![0u8; n_methods[0] as usize];
    stream.read_exact(&mut methods).await?;

    // Auth is never required of clients; always pick no-auth.
    stream.write_all(&[VERSION5, AUTH_NONE]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != VERSION5 || header[2] != 0x00 {
        return Err(SocksError::InvalidProtocol);
    }

    let cmd = header[1];
    if cmd != CMD_CONNECT {
        send_socks5_reply(stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(SocksError::UnsupportedCommand(cmd));
    }

    let target = match read_target(stream, header[3]).await {
        Ok(addr) => addr,
        Err(SocksError::Address(AddressError::InvalidType(t))) => {
            send_socks5_reply(stream, REP_ADDR_NOT_SUPPORTED).await?;
            return Err(SocksError::Address(AddressError::InvalidType(t)));
        }
        Err(e) => return Err(e),
    };

    Ok(ClientRequest {
        version: SocksVersion::V5,
        target,
    })
}

/// SOCKS4 / SOCKS4A request (version byte already consumed).
async fn read_socks4_request<S>(stream: &mut S) -> Result<ClientRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut cmd = [0u8; 1];
    stream.read_exact(&mut cmd).await?;
    if cmd[0] != CMD_CONNECT {
        send_socks4_reply(stream, SOCKS4_REJECTED).await?;
        return Err(SocksError::UnsupportedCommand(cmd[0]));
    }

    let mut buf = [0u8; 6];
    stream.read_exact(&mut buf).await?;
    let port = u16::from_be_bytes([buf[0], buf[1]]);
    let ip = [buf[2], buf[3], buf[4], buf[5]];

    // User id is unused but must be consumed.
    read_null_terminated(stream).await?;

    let target = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
        // SOCKS4A: the real hostname follows the user id.
        let domain = read_null_terminated(stream).await?;
        if domain.is_empty() {
            return Err(SocksError::InvalidProtocol);
        }
        Address::domain(&String::from_utf8_lossy(&domain), port)
    } else {
        Address::ipv4(&format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]), port)
    };

    Ok(ClientRequest {
        version: SocksVersion::V4,
        target,
    })
}

/// Read a SOCKS5 address of the given type from the stream.
pub async fn read_target<R>(r: &mut R, atyp: u8) -> Result<Address, SocksError>
where
    R: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6]; // 4 IP + 2 port
            r.read_exact(&mut buf).await?;
            let host = format!("{}.{}.{}.{}", buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok(Address::ipv4(&host, port))
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            r.read_exact(&mut len_buf).await?;
            let domain_len = len_buf[0] as usize;
            if domain_len == 0 {
                return Err(SocksError::Address(AddressError::InvalidDomain));
            }
            let mut buf = vec![0u8; domain_len + 2];
            r.read_exact(&mut buf).await?;
            let host = String::from_utf8_lossy(&buf[..domain_len]).into_owned();
            let port = u16::from_be_bytes([buf[domain_len], buf[domain_len + 1]]);
            Ok(Address::domain(&host, port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18]; // 16 IP + 2 port
            r.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok(Address::from_ipv6_octets(octets, port))
        }
        t => Err(SocksError::Address(AddressError::InvalidType(t))),
    }
}

/// Read bytes up to a null terminator (terminator consumed, not returned).
async fn read_null_terminated<R>(r: &mut R) -> Result<Vec<u8>, SocksError>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    loop {
        let mut b = [0u8; 1];
        r.read_exact(&mut b).await?;
        if b[0] == 0 {
            return Ok(out);
        }
        out.push(b[0]);
        if out.len() > MAX_NULL_FIELD {
            return Err(SocksError::InvalidProtocol);
        }
    }
}

/// Send a SOCKS5 reply with a zeroed IPv4 bind address.
pub async fn send_socks5_reply<W>(w: &mut W, rep: u8) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&[VERSION5, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

/// Send a SOCKS4 reply with zeroed port and address.
pub async fn send_socks4_reply<W>(w: &mut W, code: u8) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&[0x00, code, 0, 0, 0, 0, 0, 0]).await
}

/// Tell the client its tunnel is up.
pub async fn reply_success<W>(w: &mut W, version: SocksVersion) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V5 => send_socks5_reply(w, REP_SUCCESS).await,
        SocksVersion::V4 => send_socks4_reply(w, SOCKS4_GRANTED).await,
    }
}

/// Tell the client its tunnel failed. `rep` is the SOCKS5 reply code;
/// SOCKS4 collapses every failure to "rejected".
pub async fn reply_failure<W>(w: &mut W, version: SocksVersion, rep: u8) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V5 => send_socks5_reply(w, rep).await,
        SocksVersion::V4 => send_socks4_reply(w, SOCKS4_REJECTED).await,
    }
}
