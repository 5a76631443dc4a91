//! TCP sockets for netkit connections.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::debug;

use crate::error::TransportError;

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> Result<TcpListener, TransportError> {
    let listener = TcpListener::bind(addr).await?;
    debug!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Connect to a TCP address, giving up after `timeout`
pub async fn connect_with_timeout(
    addr: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    match tokio::time::timeout(timeout, connect_tcp(addr)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(addr)),
    }
}

/// Resolve `host:port` to the first socket address
pub async fn resolve(address: &str) -> Result<SocketAddr, TransportError> {
    lookup_host(address).await?.next().ok_or_else(|| {
        TransportError::Socket {
            code: None,
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address found for {address}"),
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = connect_with_timeout(bound_addr, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), bound_addr);
    }

    #[tokio::test]
    async fn test_refused_connect_is_a_socket_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_tcp(addr).await.unwrap_err();
        assert!(matches!(err, TransportError::Socket { .. }));
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let addr = resolve("127.0.0.1:8080").await.unwrap();
        assert_eq!(addr.port(), 8080);
    }
}
