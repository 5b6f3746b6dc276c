//! One forwarded connection: a local socket paired with a remote channel.
//!
//! A session owns exactly one accepted local socket and one remote channel
//! and pumps bytes between them in both directions until termination. It has
//! no awareness of the wire protocol it carries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::Result;
use crate::transport::{Channel, ChannelReader, ChannelWriter};

/// Process-local session identifier, monotonically increasing.
pub type SessionId = u64;

const READ_BUF_SIZE: usize = 8192;

/// Session lifecycle: `starting -> forwarding -> closing -> closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Forwarding,
    Closing,
    Closed,
}

/// Bytes forwarded by a session, per direction.
///
/// Shared with the owning client's registry so totals survive the session.
#[derive(Debug, Default)]
pub struct SessionStats {
    local_to_remote: AtomicU64,
    remote_to_local: AtomicU64,
}

impl SessionStats {
    pub fn local_to_remote(&self) -> u64 {
        self.local_to_remote.load(Ordering::Relaxed)
    }

    pub fn remote_to_local(&self) -> u64 {
        self.remote_to_local.load(Ordering::Relaxed)
    }

    fn add_local_to_remote(&self, n: u64) {
        self.local_to_remote.fetch_add(n, Ordering::Relaxed);
    }

    fn add_remote_to_local(&self, n: u64) {
        self.remote_to_local.fetch_add(n, Ordering::Relaxed);
    }
}

pub struct Session {
    id: SessionId,
    state: SessionState,
    stats: Arc<SessionStats>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Starting,
            stats: Arc::new(SessionStats::default()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// Bridge the local socket and the remote channel until both directions
    /// reach EOF or either direction errors.
    ///
    /// The two directions run concurrently. A clean EOF on one source is
    /// propagated as a half-close on its destination while the other
    /// direction keeps forwarding, so request/response protocols that close
    /// one side early still complete. On return, both the socket and the
    /// channel have been released.
    pub async fn run(mut self, local: TcpStream, channel: Channel) -> Result<()> {
        let (local_read, local_write) = local.into_split();
        let (remote_read, remote_write) = channel.into_split();

        self.state = SessionState::Forwarding;
        debug!(session = self.id, "Session forwarding");

        // try_join drops the surviving direction on first error, which
        // releases its socket and channel halves.
        let result = tokio::try_join!(
            pump_local_to_remote(self.id, local_read, remote_write, &self.stats),
            pump_remote_to_local(self.id, remote_read, local_write, &self.stats),
        );

        self.state = SessionState::Closing;

        let outcome = result.map(|_| ());
        self.state = SessionState::Closed;
        debug!(
            session = self.id,
            local_to_remote = self.stats.local_to_remote(),
            remote_to_local = self.stats.remote_to_local(),
            "Session closed"
        );

        outcome
    }
}

/// Local socket -> remote channel. On local EOF, half-closes the channel's
/// write side and completes.
async fn pump_local_to_remote(
    id: SessionId,
    mut local_read: OwnedReadHalf,
    mut remote_write: ChannelWriter,
    stats: &SessionStats,
) -> Result<()> {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = local_read.read(&mut buf).await?;
        if n == 0 {
            trace!(session = id, "Local peer closed its write side");
            remote_write.shutdown().await?;
            return Ok(());
        }
        remote_write.write(buf[..n].to_vec()).await?;
        stats.add_local_to_remote(n as u64);
    }
}

/// Remote channel -> local socket. On remote EOF, shuts down the local
/// socket's write side and completes.
async fn pump_remote_to_local(
    id: SessionId,
    mut remote_read: ChannelReader,
    mut local_write: OwnedWriteHalf,
    stats: &SessionStats,
) -> Result<()> {
    loop {
        match remote_read.read().await? {
            Some(data) => {
                local_write.write_all(&data).await?;
                stats.add_remote_to_local(data.len() as u64);
            }
            None => {
                trace!(session = id, "Remote peer closed its write side");
                local_write.shutdown().await?;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_in_starting_state() {
        let session = Session::new(7);
        assert_eq!(session.id(), 7);
        assert_eq!(session.state(), SessionState::Starting);
    }

    #[test]
    fn stats_accumulate_per_direction() {
        let stats = SessionStats::default();
        stats.add_local_to_remote(100);
        stats.add_local_to_remote(28);
        stats.add_remote_to_local(5);

        assert_eq!(stats.local_to_remote(), 128);
        assert_eq!(stats.remote_to_local(), 5);
    }
}
