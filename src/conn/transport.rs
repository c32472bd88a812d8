//! Byte stream under a connection: plain TCP, or TLS after an upgrade.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{NsqError, Result};

/// Anything a connection can speak the protocol over.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased stream so TLS and plain sockets share one code path.
pub(crate) type BoxedStream = Box<dyn AsyncStream>;

/// Open a TCP connection with a timeout and Nagle disabled.
pub(crate) async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NsqError::Timeout(format!("dial {} after {:?}", addr, timeout)))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Host part of `host:port`, without IPv6 brackets.
pub(crate) fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
