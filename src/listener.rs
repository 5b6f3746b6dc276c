//! Local TCP endpoint that client tooling dials as if it were the database.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::error::{Result, TunnelError};

/// Listener bound to `127.0.0.1:<port>` with an explicit accept backlog.
///
/// Produces accepted sockets one at a time; each accepted socket becomes
/// exactly one session. Closing the listener (dropping it) only stops new
/// accepts; already-accepted sockets belong to their sessions.
#[derive(Debug)]
pub struct LocalListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl LocalListener {
    /// Bind the local port. Fails with [`TunnelError::Bind`] if the port is
    /// already in use.
    pub fn bind(port: u16, backlog: u32) -> Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));

        let bind = || -> std::io::Result<TcpListener> {
            let socket = TcpSocket::new_v4()?;
            socket.set_reuseaddr(true)?;
            socket.bind(addr)?;
            socket.listen(backlog)
        };

        let listener = bind().map_err(|source| TunnelError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind { port, source })?;

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The actually bound address (resolves port 0 to the ephemeral port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next inbound local connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        Ok((stream, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_bind_resolves_port() {
        tokio_test::block_on(async {
            let listener = LocalListener::bind(0, 16).unwrap();
            assert_ne!(listener.local_addr().port(), 0);
            assert!(listener.local_addr().ip().is_loopback());
        });
    }

    #[test]
    fn bind_error_carries_the_port() {
        tokio_test::block_on(async {
            let first = LocalListener::bind(0, 16).unwrap();
            let port = first.local_addr().port();

            let err = LocalListener::bind(port, 16).unwrap_err();
            assert!(matches!(err, TunnelError::Bind { port: p, .. } if p == port));
        });
    }
}
