use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use lanchat::{
    envelope::{ClientEnvelope, ServerEnvelope},
    framing::Framer,
    server::ChatServer,
};
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::oneshot,
    time::timeout,
};
use tokio_util::codec::{FramedRead, FramedWrite};

const READ_TIMEOUT: Duration = Duration::from_secs(1);

async fn start_server() -> Result<(SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = ChatServer::new(listener);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = server.run_until(shutdown).await;
    });

    Ok((addr, shutdown_tx))
}

struct TestClient {
    reader: FramedRead<OwnedReadHalf, Framer>,
    writer: FramedWrite<OwnedWriteHalf, Framer>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(reader, Framer),
            writer: FramedWrite::new(writer, Framer),
        })
    }

    /// Connects, logs in, and consumes the welcome and roster envelopes.
    async fn login(addr: SocketAddr, username: &str) -> Result<(Self, Vec<String>)> {
        let mut client = Self::connect(addr).await?;
        client
            .send(&ClientEnvelope::Login {
                username: username.to_string(),
            })
            .await?;

        let welcome = client.recv().await?;
        assert_eq!(welcome, ServerEnvelope::login_success(username));

        let users = match client.recv().await? {
            ServerEnvelope::UserList { users } => users,
            other => panic!("expected a user list, got {other:?}"),
        };
        Ok((client, users))
    }

    async fn send(&mut self, envelope: &ClientEnvelope) -> Result<()> {
        self.writer.send(envelope).await?;
        Ok(())
    }

    async fn send_chat(&mut self, text: &str) -> Result<()> {
        self.send(&ClientEnvelope::Message {
            message: text.to_string(),
        })
        .await
    }

    async fn recv(&mut self) -> Result<ServerEnvelope> {
        let line = timeout(READ_TIMEOUT, self.reader.next())
            .await
            .context("timed out waiting for an envelope")?
            .context("connection closed early")??;
        Ok(serde_json::from_str(&line)?)
    }

    async fn expect_closed(&mut self) -> Result<()> {
        let next = timeout(READ_TIMEOUT, self.reader.next())
            .await
            .context("timed out waiting for the connection to close")?;
        match next {
            None => Ok(()),
            Some(frame) => anyhow::bail!("expected the connection to close, got {frame:?}"),
        }
    }
}

#[tokio::test]
async fn login_returns_welcome_then_roster() -> Result<()> {
    let (addr, shutdown) = start_server().await?;

    let (_alice, users) = TestClient::login(addr, "alice").await?;
    assert_eq!(users, vec!["alice"]);

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn chat_broadcasts_reach_everyone_including_the_sender() -> Result<()> {
    let (addr, shutdown) = start_server().await?;

    let (mut alice, _) = TestClient::login(addr, "alice").await?;
    let (mut bob, bob_roster) = TestClient::login(addr, "bob").await?;
    assert_eq!(bob_roster, vec!["alice", "bob"]);

    match alice.recv().await? {
        ServerEnvelope::UserJoined {
            username, message, ..
        } => {
            assert_eq!(username, "bob");
            assert_eq!(message, "bob joined the chat");
        }
        other => panic!("expected a join notice, got {other:?}"),
    }

    alice.send_chat("hello bob").await?;

    for client in [&mut alice, &mut bob] {
        match client.recv().await? {
            ServerEnvelope::Message {
                username,
                message,
                timestamp,
            } => {
                assert_eq!(username, "alice");
                assert_eq!(message, "hello bob");
                assert_eq!(timestamp.len(), 8, "timestamp {timestamp:?} is not HH:MM:SS");
            }
            other => panic!("expected the chat message, got {other:?}"),
        }
    }

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn duplicate_username_is_rejected_without_harming_the_original() -> Result<()> {
    let (addr, shutdown) = start_server().await?;

    let (mut alice, _) = TestClient::login(addr, "alice").await?;
    let (mut bob, _) = TestClient::login(addr, "bob").await?;
    alice.recv().await?; // bob's join notice

    let mut imposter = TestClient::connect(addr).await?;
    imposter
        .send(&ClientEnvelope::Login {
            username: "alice".to_string(),
        })
        .await?;
    match imposter.recv().await? {
        ServerEnvelope::Error { message } => assert_eq!(message, "Username already taken"),
        other => panic!("expected a rejection, got {other:?}"),
    }
    imposter.expect_closed().await?;

    // The original alice is untouched and can still chat.
    alice.send_chat("hello").await?;
    for client in [&mut alice, &mut bob] {
        match client.recv().await? {
            ServerEnvelope::Message {
                username, message, ..
            } => {
                assert_eq!(username, "alice");
                assert_eq!(message, "hello");
            }
            other => panic!("expected the chat message, got {other:?}"),
        }
    }

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn joiner_never_sees_their_own_join_notice() -> Result<()> {
    let (addr, shutdown) = start_server().await?;

    let (mut alice, _) = TestClient::login(addr, "alice").await?;
    let (mut bob, _) = TestClient::login(addr, "bob").await?;

    match alice.recv().await? {
        ServerEnvelope::UserJoined { username, .. } => assert_eq!(username, "bob"),
        other => panic!("expected a join notice, got {other:?}"),
    }

    // Nothing was queued for bob beyond his handshake: the very next envelope
    // he sees is his own echo, not a join notice about himself.
    bob.send_chat("first").await?;
    match bob.recv().await? {
        ServerEnvelope::Message {
            username, message, ..
        } => {
            assert_eq!(username, "bob");
            assert_eq!(message, "first");
        }
        other => panic!("expected bob's own echo, got {other:?}"),
    }

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn graceful_disconnect_broadcasts_user_left() -> Result<()> {
    let (addr, shutdown) = start_server().await?;

    let (mut alice, _) = TestClient::login(addr, "alice").await?;
    let (mut bob, _) = TestClient::login(addr, "bob").await?;
    alice.recv().await?; // bob's join notice

    bob.send(&ClientEnvelope::Disconnect).await?;

    match alice.recv().await? {
        ServerEnvelope::UserLeft {
            username, message, ..
        } => {
            assert_eq!(username, "bob");
            assert_eq!(message, "bob left the chat");
        }
        other => panic!("expected a leave notice, got {other:?}"),
    }

    // The roster a newcomer receives no longer contains bob.
    let (_charlie, users) = TestClient::login(addr, "charlie").await?;
    assert_eq!(users, vec!["alice", "charlie"]);

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn dropped_connection_broadcasts_user_left() -> Result<()> {
    let (addr, shutdown) = start_server().await?;

    let (mut alice, _) = TestClient::login(addr, "alice").await?;
    let (bob, _) = TestClient::login(addr, "bob").await?;
    alice.recv().await?; // bob's join notice

    drop(bob);

    match alice.recv().await? {
        ServerEnvelope::UserLeft { username, .. } => assert_eq!(username, "bob"),
        other => panic!("expected a leave notice, got {other:?}"),
    }

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn login_without_a_trailing_newline_is_accepted() -> Result<()> {
    let (addr, shutdown) = start_server().await?;

    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(br#"{"type":"login","username":"eve"}"#)
        .await?;
    writer.flush().await?;

    let mut reader = FramedRead::new(reader, Framer);
    let line = timeout(READ_TIMEOUT, reader.next())
        .await
        .context("timed out waiting for the login response")?
        .context("connection closed early")??;
    assert_eq!(
        serde_json::from_str::<ServerEnvelope>(&line)?,
        ServerEnvelope::login_success("eve")
    );

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn malformed_lines_are_dropped_mid_session() -> Result<()> {
    let (addr, shutdown) = start_server().await?;

    let (mut alice, _) = TestClient::login(addr, "alice").await?;
    let (mut bob, _) = TestClient::login(addr, "bob").await?;
    alice.recv().await?; // bob's join notice

    alice.writer.get_mut().write_all(b"this is not json\n").await?;
    alice.send_chat("still here").await?;

    for client in [&mut alice, &mut bob] {
        match client.recv().await? {
            ServerEnvelope::Message {
                username, message, ..
            } => {
                assert_eq!(username, "alice");
                assert_eq!(message, "still here");
            }
            other => panic!("expected the chat message, got {other:?}"),
        }
    }

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn repeated_login_is_ignored_and_the_session_continues() -> Result<()> {
    let (addr, shutdown) = start_server().await?;

    let (mut alice, _) = TestClient::login(addr, "alice").await?;
    alice
        .send(&ClientEnvelope::Login {
            username: "alice-again".to_string(),
        })
        .await?;
    alice.send_chat("still alice").await?;

    // No reply to the second login: the next envelope is the chat echo,
    // still attributed to the original name.
    match alice.recv().await? {
        ServerEnvelope::Message {
            username, message, ..
        } => {
            assert_eq!(username, "alice");
            assert_eq!(message, "still alice");
        }
        other => panic!("expected the chat echo, got {other:?}"),
    }

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn shutdown_notifies_connected_clients() -> Result<()> {
    let (addr, shutdown) = start_server().await?;

    let (mut alice, _) = TestClient::login(addr, "alice").await?;
    let _ = shutdown.send(());

    match alice.recv().await? {
        ServerEnvelope::Error { message } => assert_eq!(message, "server shutting down"),
        other => panic!("expected the shutdown notice, got {other:?}"),
    }

    Ok(())
}
