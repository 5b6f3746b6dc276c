//! Tunnel client facade.
//!
//! [`TunnelClient`] owns the local listener and the set of active sessions.
//! `connect()` binds the local port and starts accepting; each accepted
//! connection lazily opens its own remote channel, so a failed remote
//! handshake affects only that session. `disconnect()` stops accepts, lets
//! in-flight sessions drain within a grace period and forcibly closes any
//! stragglers. The scoped-acquisition contract: callers must `disconnect()`
//! on every exit path of the work that used the tunnel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::listener::LocalListener;
use crate::session::{Session, SessionId, SessionStats};
use crate::transport::TunnelTransport;

/// Client lifecycle: `idle -> connecting -> connected -> disconnecting ->
/// disconnected`. A disconnected client cannot be reconnected; construct a
/// new instance instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// What happened to the sessions of a client, reported by `disconnect()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisconnectSummary {
    /// Sessions accepted over the lifetime of the client.
    pub sessions: u64,
    /// Sessions that terminated with a handshake or forwarding error.
    pub failed: u64,
    /// Sessions forcibly closed after the drain grace period.
    pub aborted: u64,
}

struct SessionHandle {
    join: JoinHandle<()>,
    stats: Arc<SessionStats>,
}

// Guards are never held across an await point, so a std mutex suffices and
// stays lockable from the non-async Drop path.
type SessionRegistry = Arc<Mutex<HashMap<SessionId, SessionHandle>>>;

fn lock_registry(
    registry: &Mutex<HashMap<SessionId, SessionHandle>>,
) -> MutexGuard<'_, HashMap<SessionId, SessionHandle>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TunnelClient {
    config: TunnelConfig,
    state: ClientState,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    sessions: SessionRegistry,
    sessions_total: Arc<AtomicU64>,
    sessions_failed: Arc<AtomicU64>,
}

impl TunnelClient {
    /// Create an idle client from a validated configuration.
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            state: ClientState::Idle,
            local_addr: None,
            accept_task: None,
            shutdown: CancellationToken::new(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            sessions_total: Arc::new(AtomicU64::new(0)),
            sessions_failed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The bound local address, once `connect()` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the local port and start accepting connections.
    ///
    /// On bind failure the client transitions straight to `disconnected` and
    /// no port is left bound. The remote endpoint is not contacted here;
    /// each accepted connection performs its own handshake.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state != ClientState::Idle {
            return Err(TunnelError::InvalidState(
                "connect() is only valid on a fresh client",
            ));
        }
        self.state = ClientState::Connecting;

        let listener = match LocalListener::bind(self.config.local_port, self.config.backlog) {
            Ok(listener) => listener,
            Err(e) => {
                self.state = ClientState::Disconnected;
                return Err(e);
            }
        };

        let local_addr = listener.local_addr();
        info!(
            "Tunnel listening on {} -> {}",
            local_addr, self.config.remote_url
        );

        let transport = Arc::new(TunnelTransport::new(self.config.clone()));

        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            self.shutdown.clone(),
            transport,
            self.sessions.clone(),
            self.sessions_total.clone(),
            self.sessions_failed.clone(),
        )));
        self.local_addr = Some(local_addr);
        self.state = ClientState::Connected;

        Ok(())
    }

    /// Release the local port and all remote channels.
    ///
    /// New accepts stop immediately; active sessions get the configured
    /// grace period to drain and are forcibly closed after it. Idempotent
    /// and safe to call even if `connect()` never completed or failed.
    pub async fn disconnect(&mut self) -> DisconnectSummary {
        match self.state {
            ClientState::Connected => {}
            _ => {
                self.state = ClientState::Disconnected;
                return self.summary(0);
            }
        }
        self.state = ClientState::Disconnecting;

        // Stop the accept loop first so no new sessions can start. The
        // listener is dropped inside the task, releasing the port.
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }

        let aborted = self.drain_sessions(self.config.drain_grace).await;

        self.local_addr = None;
        self.state = ClientState::Disconnected;
        info!("Tunnel disconnected");

        self.summary(aborted)
    }

    /// Wait up to `grace` for all active sessions to finish, then abort the
    /// rest. Returns the number of sessions aborted.
    async fn drain_sessions(&self, grace: Duration) -> u64 {
        let handles: Vec<(SessionId, SessionHandle)> =
            lock_registry(&self.sessions).drain().collect();

        if handles.is_empty() {
            return 0;
        }

        debug!("Draining {} active session(s)", handles.len());
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0u64;

        for (id, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle.join).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(
                        session = id,
                        local_to_remote = handle.stats.local_to_remote(),
                        remote_to_local = handle.stats.remote_to_local(),
                        "Session did not drain within grace period, closing forcibly"
                    );
                    handle.join.abort();
                    // abort() only requests cancellation; the socket and
                    // channel are released when the task is dropped, so wait
                    // for that before reporting the session torn down.
                    let _ = handle.join.await;
                    aborted += 1;
                }
            }
        }

        aborted
    }

    fn summary(&self, aborted: u64) -> DisconnectSummary {
        DisconnectSummary {
            sessions: self.sessions_total.load(Ordering::Relaxed),
            failed: self.sessions_failed.load(Ordering::Relaxed),
            aborted,
        }
    }
}

// Hard fallback for clients dropped without `disconnect()`: no session may
// outlive its owning client. Drop cannot await, so there is no graceful
// drain here; sessions are aborted outright.
impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for (_, handle) in lock_registry(&self.sessions).drain() {
            handle.join.abort();
        }
    }
}

/// Accept inbound local connections until shut down, spawning one session
/// per connection.
async fn accept_loop(
    listener: LocalListener,
    shutdown: CancellationToken,
    transport: Arc<TunnelTransport>,
    sessions: SessionRegistry,
    sessions_total: Arc<AtomicU64>,
    sessions_failed: Arc<AtomicU64>,
) {
    let mut next_id: SessionId = 0;

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        next_id += 1;
                        let id = next_id;
                        sessions_total.fetch_add(1, Ordering::Relaxed);
                        debug!(session = id, "Accepted local connection from {}", peer_addr);

                        // Hold the registry lock across the spawn so the
                        // session's terminal-state removal cannot run before
                        // its handle is inserted.
                        let mut registry = lock_registry(&sessions);
                        let session = Session::new(id);
                        let stats = session.stats();
                        let join = tokio::spawn(run_session(
                            session,
                            stream,
                            transport.clone(),
                            sessions.clone(),
                            sessions_failed.clone(),
                        ));
                        registry.insert(id, SessionHandle { join, stats });
                    }
                    Err(e) => {
                        debug!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                debug!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Open the remote channel for one accepted connection and forward until
/// termination. Errors are isolated to this session: the local socket is
/// dropped so the local peer observes a reset instead of a silent hang.
async fn run_session(
    session: Session,
    stream: tokio::net::TcpStream,
    transport: Arc<TunnelTransport>,
    sessions: SessionRegistry,
    sessions_failed: Arc<AtomicU64>,
) {
    let id = session.id();

    match transport.open().await {
        Ok(channel) => {
            if let Err(e) = session.run(stream, channel).await {
                warn!(session = id, "Session terminated with error: {}", e);
                sessions_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(e) => {
            warn!(session = id, "Tunnel handshake failed: {}", e);
            sessions_failed.fetch_add(1, Ordering::Relaxed);
            drop(stream);
        }
    }

    lock_registry(&sessions).remove(&id);
}
