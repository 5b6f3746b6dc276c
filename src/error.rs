use thiserror::Error;

/// Errors produced by the tunnel client.
///
/// Listener-level failures ([`TunnelError::Bind`]) abort `connect()` as a
/// whole. Handshake and mid-session failures are scoped to the session that
/// hit them; sibling sessions and the client itself keep running.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The local port could not be bound.
    #[error("failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The remote endpoint rejected the auth token (401/403).
    #[error("remote rejected auth token (HTTP {status})")]
    Auth { status: u16 },

    /// The remote endpoint could not be reached (DNS, TCP or TLS failure).
    #[error("remote endpoint unreachable: {0}")]
    Unreachable(String),

    /// The remote did not complete the expected handshake.
    #[error("tunnel handshake failed: {0}")]
    Protocol(String),

    /// Mid-session I/O failure on the remote channel.
    #[error("transport error: {0}")]
    Transport(String),

    /// Mid-session I/O failure on the local socket.
    #[error("local socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration failed validation at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The client was used in a state that does not permit the call.
    #[error("invalid client state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
