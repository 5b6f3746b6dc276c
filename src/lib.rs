//! Dbtunnel: TCP-to-WebSocket tunnel client.
//!
//! Lets off-the-shelf database tooling that only knows how to dial a plain
//! `host:port` reach a database instance behind an HTTPS-fronted platform
//! boundary. The client binds a local TCP port; each accepted connection is
//! paired with its own authenticated WebSocket channel to the remote tunnel
//! endpoint and the raw wire-protocol bytes are forwarded transparently in
//! both directions.
//!
//! Typical use from an orchestration script:
//!
//! ```ignore
//! use dbtunnel::{TunnelClient, TunnelConfig};
//!
//! let config = TunnelConfig::new("https://tunnel.example.com/db", 5432, token)?;
//! let mut client = TunnelClient::new(config);
//! client.connect().await?;
//! // run migrations / queries against localhost:5432 ...
//! client.disconnect().await;
//! ```
//!
//! `disconnect()` must run on every exit path of the work that used the
//! tunnel; it releases the local port and all remote channels.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod retry;
pub mod session;
pub mod transport;

pub use client::{ClientState, DisconnectSummary, TunnelClient};
pub use config::TunnelConfig;
pub use error::{Result, TunnelError};
