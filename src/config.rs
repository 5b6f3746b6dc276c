//! Configuration for the tunnel client.
//!
//! All settings are collected into an explicit [`TunnelConfig`] that is
//! validated once when the client is constructed, instead of being read from
//! the environment ad hoc. The CLI additionally supports a config file at the
//! platform config dir (`dbtunnel/config.toml`) for the remote URL and token.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, TunnelError};

/// Default grace period granted to in-flight sessions during `disconnect()`.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Default bound on the remote connection upgrade handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default TCP accept backlog for the local listener.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Validated configuration for a [`crate::TunnelClient`].
///
/// Immutable for the lifetime of the client instance.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Remote tunnel endpoint. Accepts `wss://`, `ws://`, `https://` or
    /// `http://`; the HTTP schemes are rewritten to their WebSocket
    /// equivalents during validation.
    pub remote_url: Url,
    /// Local port to listen on. Port 0 binds an ephemeral port; the actual
    /// port is available via `TunnelClient::local_addr` after `connect()`.
    pub local_port: u16,
    /// Bearer token presented on the connection upgrade request.
    pub auth_token: String,
    /// Accept backlog for the local listener.
    pub backlog: u32,
    /// Bound on the remote handshake; exceeding it is a `Protocol` error.
    pub handshake_timeout: Duration,
    /// How long `disconnect()` waits for active sessions to drain before
    /// forcibly closing them.
    pub drain_grace: Duration,
}

impl TunnelConfig {
    /// Build and validate a configuration.
    ///
    /// Fails with [`TunnelError::InvalidConfig`] if the URL is not an
    /// absolute ws/wss/http/https URL or the token is empty.
    pub fn new(remote_url: &str, local_port: u16, auth_token: &str) -> Result<Self> {
        let mut url = Url::parse(remote_url)
            .map_err(|e| TunnelError::InvalidConfig(format!("remote URL: {}", e)))?;

        match url.scheme() {
            "ws" | "wss" => {}
            "http" => {
                // Url::set_scheme cannot fail for these pairs
                let _ = url.set_scheme("ws");
            }
            "https" => {
                let _ = url.set_scheme("wss");
            }
            other => {
                return Err(TunnelError::InvalidConfig(format!(
                    "unsupported remote URL scheme '{}'; expected wss, ws, https or http",
                    other
                )));
            }
        }

        if url.host_str().is_none() {
            return Err(TunnelError::InvalidConfig(
                "remote URL has no host".to_string(),
            ));
        }

        if auth_token.trim().is_empty() {
            return Err(TunnelError::InvalidConfig(
                "auth token must not be empty".to_string(),
            ));
        }

        Ok(Self {
            remote_url: url,
            local_port,
            auth_token: auth_token.to_string(),
            backlog: DEFAULT_BACKLOG,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            drain_grace: DEFAULT_DRAIN_GRACE,
        })
    }

    /// Override the accept backlog.
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Override the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Override the disconnect drain grace period.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }
}

/// Persisted CLI defaults, loaded from `dbtunnel/config.toml`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
    pub remote_url: Option<String>,
}

impl FileConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| {
            TunnelError::InvalidConfig(format!("config file {}: {}", path.display(), e))
        })
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| TunnelError::InvalidConfig(format!("serializing config: {}", e)))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "dbtunnel").ok_or_else(|| {
            TunnelError::InvalidConfig("could not determine config directory".to_string())
        })?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}
