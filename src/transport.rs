//! Authenticated channel to the remote tunnel endpoint.
//!
//! The remote side of every session is a WebSocket connection upgraded over
//! HTTPS with a bearer token. Once open it is presented as a plain ordered
//! byte channel: each chunk written becomes one binary frame, each binary
//! frame received is one chunk read. The tunnel never inspects the payload;
//! the proxied wire protocol's bytes pass through unmodified.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens authenticated channels to the configured remote endpoint.
///
/// One channel is opened per session, lazily, when the local connection is
/// accepted. A failed handshake therefore affects only that session.
pub struct TunnelTransport {
    config: TunnelConfig,
}

impl TunnelTransport {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Perform the connection upgrade handshake and return the open channel.
    ///
    /// The handshake presents the auth token as a bearer credential and must
    /// complete within the configured deadline.
    pub async fn open(&self) -> Result<Channel> {
        let mut request = self
            .config
            .remote_url
            .as_str()
            .into_client_request()
            .map_err(|e| TunnelError::Protocol(e.to_string()))?;

        let bearer = format!("Bearer {}", self.config.auth_token)
            .parse::<http::HeaderValue>()
            .map_err(|_| {
                TunnelError::InvalidConfig("auth token is not a valid header value".to_string())
            })?;
        request
            .headers_mut()
            .insert(http::header::AUTHORIZATION, bearer);

        debug!("Opening tunnel channel to {}", self.config.remote_url);

        let connect = connect_async(request);
        let (ws_stream, response) =
            match tokio::time::timeout(self.config.handshake_timeout, connect).await {
                Ok(Ok(ok)) => ok,
                Ok(Err(e)) => return Err(map_handshake_error(e)),
                Err(_) => {
                    return Err(TunnelError::Protocol(format!(
                        "handshake did not complete within {:?}",
                        self.config.handshake_timeout
                    )))
                }
            };

        debug!("Tunnel channel open, status {}", response.status());

        let (sink, stream) = ws_stream.split();
        Ok(Channel {
            writer: ChannelWriter { sink },
            reader: ChannelReader { stream },
        })
    }
}

fn map_handshake_error(err: tungstenite::Error) -> TunnelError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
                TunnelError::Auth {
                    status: status.as_u16(),
                }
            } else {
                TunnelError::Protocol(format!("unexpected handshake response: {}", status))
            }
        }
        tungstenite::Error::Io(e) => TunnelError::Unreachable(e.to_string()),
        tungstenite::Error::Tls(e) => TunnelError::Unreachable(e.to_string()),
        tungstenite::Error::Url(e) => TunnelError::Unreachable(e.to_string()),
        other => TunnelError::Protocol(other.to_string()),
    }
}

/// A full-duplex ordered byte channel to the remote endpoint.
///
/// Splits into independently owned halves so a session's two forwarding
/// directions can run concurrently without locking.
pub struct Channel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl Channel {
    pub fn into_split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of a [`Channel`].
pub struct ChannelReader {
    stream: SplitStream<WsStream>,
}

impl ChannelReader {
    /// Next chunk of bytes from the remote peer, in order, or `None` once the
    /// remote has cleanly closed.
    ///
    /// Control frames carry no tunnel payload and are skipped; a text frame
    /// is a protocol violation.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>> {
        while let Some(result) = self.stream.next().await {
            match result {
                Ok(Message::Binary(data)) => return Ok(Some(data)),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return Ok(None),
                Ok(Message::Text(_)) => {
                    return Err(TunnelError::Protocol(
                        "remote sent a text frame on a byte channel".to_string(),
                    ))
                }
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => return Ok(None),
                Err(e) => return Err(TunnelError::Transport(e.to_string())),
            }
        }
        Ok(None)
    }
}

/// Write half of a [`Channel`].
pub struct ChannelWriter {
    sink: SplitSink<WsStream, Message>,
}

impl ChannelWriter {
    /// Send one chunk to the remote peer.
    ///
    /// Awaits the underlying flush, so a remote that is not draining fast
    /// enough suspends the caller instead of buffering unboundedly.
    pub async fn write(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(Message::Binary(data))
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))
    }

    /// Close the write direction (half-close). Idempotent.
    ///
    /// The remote may still deliver frames it already sent; the read half
    /// stays usable until it reports EOF.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(TunnelError::Transport(e.to_string())),
        }
    }
}
