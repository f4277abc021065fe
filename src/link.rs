//! Client-side connection to the chat server.
//!
//! [`connect`] performs the login handshake under a bounded wait, then starts
//! exactly one background read loop that decodes server envelopes into a
//! queue-backed inbox. The consumer drains the inbox at its own pace and
//! never touches the socket; outbound traffic goes through [`ServerLink`],
//! which owns the write half. The two directions share the transport but
//! nothing else.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::timeout,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info};

use crate::{
    envelope::{ClientEnvelope, ServerEnvelope},
    framing::{FrameError, Framer},
};

/// How long to wait for the server's verdict on a login before giving up.
/// This is the only load-bearing timeout in the protocol; steady-state reads
/// block until data, EOF or error.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Envelopes decoded by the read loop, in arrival order. The channel closes
/// when the connection does.
pub type Inbox = UnboundedReceiver<ServerEnvelope>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("login rejected: {0}")]
    Rejected(String),
    #[error("no login response within {0:?}")]
    Timeout(Duration),
    #[error("server closed the connection during login")]
    ClosedDuringLogin,
    #[error("unexpected login response: {0}")]
    UnexpectedReply(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Outbound half of an established connection.
pub struct ServerLink {
    writer: FramedWrite<OwnedWriteHalf, Framer>,
}

impl ServerLink {
    pub async fn send_chat(&mut self, text: &str) -> Result<(), FrameError> {
        self.writer
            .send(&ClientEnvelope::Message {
                message: text.to_string(),
            })
            .await
    }

    /// Announces the departure and closes the write half. The read loop ends
    /// once the server closes its side in response.
    pub async fn disconnect(mut self) -> Result<(), FrameError> {
        self.writer.send(&ClientEnvelope::Disconnect).await?;
        self.writer.get_mut().shutdown().await?;
        Ok(())
    }
}

/// Connects and logs in as `username` with the default handshake timeout.
pub async fn connect(
    server: SocketAddr,
    username: &str,
) -> Result<(ServerLink, Inbox), ConnectError> {
    connect_with_timeout(server, username, HANDSHAKE_TIMEOUT).await
}

pub async fn connect_with_timeout(
    server: SocketAddr,
    username: &str,
    wait: Duration,
) -> Result<(ServerLink, Inbox), ConnectError> {
    let stream = TcpStream::connect(server)
        .await
        .map_err(|source| ConnectError::Connect {
            addr: server,
            source,
        })?;
    info!("connected to {server}");

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, Framer);
    let mut writer = FramedWrite::new(write_half, Framer);

    writer
        .send(&ClientEnvelope::Login {
            username: username.to_string(),
        })
        .await?;

    let reply = match timeout(wait, reader.next()).await {
        Err(_) => return Err(ConnectError::Timeout(wait)),
        Ok(None) => return Err(ConnectError::ClosedDuringLogin),
        Ok(Some(Err(err))) => return Err(err.into()),
        Ok(Some(Ok(line))) => line,
    };

    let welcome = match serde_json::from_str::<ServerEnvelope>(&reply) {
        Ok(envelope @ ServerEnvelope::LoginSuccess { .. }) => envelope,
        Ok(ServerEnvelope::Error { message }) => return Err(ConnectError::Rejected(message)),
        Ok(_) | Err(_) => return Err(ConnectError::UnexpectedReply(reply)),
    };

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    // The welcome flows through the inbox like every later envelope, so the
    // consumer renders the whole conversation from one place.
    let _ = inbox_tx.send(welcome);
    tokio::spawn(read_loop(reader, inbox_tx));

    Ok((ServerLink { writer }, inbox_rx))
}

async fn read_loop(
    mut reader: FramedRead<OwnedReadHalf, Framer>,
    inbox: UnboundedSender<ServerEnvelope>,
) {
    while let Some(frame) = reader.next().await {
        let line = match frame {
            Ok(line) => line,
            Err(err) => {
                debug!(error = %err, "server stream failed");
                break;
            }
        };
        match serde_json::from_str::<ServerEnvelope>(&line) {
            Ok(envelope) => {
                if inbox.send(envelope).is_err() {
                    // Inbox consumer is gone; nothing left to read for.
                    break;
                }
            }
            Err(err) => debug!(error = %err, "dropping undecodable envelope"),
        }
    }
    debug!("server read loop finished");
}
