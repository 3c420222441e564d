//! TCP socket tuning.
//!
//! Accepted client sockets get keepalive; direct-path and HTTP-upstream
//! sockets additionally request large kernel buffers for TLS-heavy
//! traffic. On non-Unix targets these are silent no-ops.

use std::io;

use tokio::net::TcpStream;

/// Kernel buffer size requested for direct and HTTP-upstream sockets.
pub const TUNNEL_SOCKET_BUFFER: i32 = 262144; // 256 KB

#[cfg(unix)]
mod imp {
    use super::*;
    use std::os::unix::io::AsRawFd;

    fn setsockopt_i32(fd: i32, level: i32, opt: i32, value: i32) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                level,
                opt,
                &value as *const i32 as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_keepalive(stream: &TcpStream, on: bool) -> io::Result<()> {
        setsockopt_i32(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            on as i32,
        )
    }

    pub fn set_socket_buffers(stream: &TcpStream, size: i32) -> io::Result<()> {
        let fd = stream.as_raw_fd();
        setsockopt_i32(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size)?;
        setsockopt_i32(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, size)
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    pub fn set_keepalive(_stream: &TcpStream, _on: bool) -> io::Result<()> {
        Ok(())
    }

    pub fn set_socket_buffers(_stream: &TcpStream, _size: i32) -> io::Result<()> {
        Ok(())
    }
}

pub use imp::{set_keepalive, set_socket_buffers};
