use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc::{self, UnboundedReceiver},
};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    envelope::{ClientEnvelope, ServerEnvelope},
    framing::Framer,
    registry::{RegisterError, Registry},
};

pub struct ChatServer {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl ChatServer {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer { listener, registry } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&registry).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(registry: &Arc<Registry>) {
    info!("server shutting down");
    registry
        .broadcast(ServerEnvelope::error("server shutting down"), None)
        .await;
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, registry),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, registry: &Arc<Registry>) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        debug!(%peer, "connection accepted");
        if let Err(err) = handle_connection(stream, peer, registry).await {
            warn!(%peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection<S>(stream: S, peer: SocketAddr, registry: Arc<Registry>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, Framer);

    let username = match await_login(&mut framed).await? {
        Some(username) => username,
        None => {
            debug!(%peer, "connection closed before login");
            return Ok(());
        }
    };

    let mut outbound = match claim_username(&mut framed, &registry, peer, &username).await? {
        Some(outbound) => outbound,
        None => return Ok(()),
    };

    // The name is registered from here on; cleanup must run on every exit,
    // including a welcome write that fails against an already-gone peer.
    let result = serve_registered(&mut framed, &mut outbound, &registry, peer, &username).await;
    cleanup_session(&registry, peer).await;
    result
}

/// First envelope on a connection must be a login. `Ok(None)` is a clean
/// close before any frame arrived; anything other than a login is a protocol
/// violation that ends the connection.
async fn await_login<S>(framed: &mut Framed<S, Framer>) -> Result<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = match framed.next().await {
        Some(line) => line?,
        None => return Ok(None),
    };

    match serde_json::from_str::<ClientEnvelope>(&line) {
        Ok(ClientEnvelope::Login { username }) => Ok(Some(username)),
        Ok(other) => anyhow::bail!("expected a login envelope first, got {other:?}"),
        Err(err) => Err(err).context("malformed login request"),
    }
}

/// Claims the username for this connection. Returns the session's outbound
/// queue, or `None` when the name was taken and the connection must close
/// (the rejection envelope has already been written).
async fn claim_username<S>(
    framed: &mut Framed<S, Framer>,
    registry: &Registry,
    peer: SocketAddr,
    username: &str,
) -> Result<Option<UnboundedReceiver<ServerEnvelope>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    if let Err(RegisterError::UsernameTaken) =
        registry.register(peer, username, outbound_tx).await
    {
        info!(%peer, username, "login rejected, username taken");
        framed
            .send(&ServerEnvelope::error("Username already taken"))
            .await?;
        return Ok(None);
    }
    Ok(Some(outbound_rx))
}

/// Everything between register and unregister: the welcome writes and the
/// steady-state loop. The caller runs cleanup whatever this returns.
async fn serve_registered<S>(
    framed: &mut Framed<S, Framer>,
    outbound: &mut UnboundedReceiver<ServerEnvelope>,
    registry: &Registry,
    peer: SocketAddr,
    username: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(&ServerEnvelope::login_success(username)).await?;
    registry
        .broadcast(ServerEnvelope::user_joined(username), Some(peer))
        .await;
    framed
        .send(&ServerEnvelope::user_list(registry.snapshot().await))
        .await?;
    info!(%peer, username, "client joined");

    serve_client(framed, outbound, registry, username).await
}

async fn serve_client<S>(
    framed: &mut Framed<S, Framer>,
    outbound: &mut UnboundedReceiver<ServerEnvelope>,
    registry: &Registry,
    username: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        select! {
            inbound = framed.next() => {
                match inbound {
                    Some(line) => {
                        let line = line?;
                        if !handle_inbound_line(&line, registry, username).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            queued = outbound.recv() => {
                match queued {
                    // This loop is the connection's only writer; broadcasts
                    // reach the socket exclusively through this arm.
                    Some(envelope) => framed.send(&envelope).await?,
                    None => break,
                }
            }
        }
    }

    Ok(())
}

/// Returns false when the session should end (graceful disconnect).
async fn handle_inbound_line(line: &str, registry: &Registry, username: &str) -> bool {
    match serde_json::from_str::<ClientEnvelope>(line) {
        Ok(ClientEnvelope::Message { message }) => {
            debug!(username, message, "broadcasting chat message");
            registry
                .broadcast(ServerEnvelope::chat(username, message), None)
                .await;
            true
        }
        Ok(ClientEnvelope::Disconnect) => false,
        Ok(ClientEnvelope::Login { .. }) => {
            debug!(username, "ignoring repeated login");
            true
        }
        Err(err) => {
            debug!(username, error = %err, "dropping malformed line");
            true
        }
    }
}

async fn cleanup_session(registry: &Registry, peer: SocketAddr) {
    if let Some(username) = registry.unregister(peer).await {
        info!(%peer, username, "client disconnected");
        registry
            .broadcast(ServerEnvelope::user_left(&username), None)
            .await;
    }
}
