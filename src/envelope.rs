//! Wire envelopes exchanged between chat clients and the server.
//!
//! Every envelope is a single JSON document tagged by a `type` field. The two
//! directions use separate enums so the compiler enforces who may say what:
//! clients never carry usernames or timestamps on chat messages, the server
//! stamps both when it broadcasts.

use chrono::Local;
use serde::{Deserialize, Serialize};

/// Envelopes a client may send to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// First envelope on every connection: claim a username.
    Login { username: String },
    /// A chat message to broadcast. The server attributes and stamps it.
    Message { message: String },
    /// Graceful goodbye sent before closing the connection.
    Disconnect,
}

/// Envelopes the server may send to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// Login accepted; the connection is now part of the chat.
    LoginSuccess { message: String },
    /// A request was refused (today: the username is already taken).
    Error { message: String },
    /// A chat message attributed to its sender and stamped by the server.
    Message {
        username: String,
        message: String,
        timestamp: String,
    },
    /// Someone joined; sent to everyone except the new arrival.
    UserJoined {
        username: String,
        message: String,
        timestamp: String,
    },
    /// Someone left, gracefully or not.
    UserLeft {
        username: String,
        message: String,
        timestamp: String,
    },
    /// Roster snapshot, sent to a client right after its own login.
    UserList { users: Vec<String> },
}

impl ServerEnvelope {
    pub fn login_success(username: &str) -> Self {
        ServerEnvelope::LoginSuccess {
            message: format!("Welcome to the chat, {username}!"),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEnvelope::Error {
            message: message.into(),
        }
    }

    /// A chat message as broadcast by the server; the timestamp is assigned
    /// here, never taken from the sender.
    pub fn chat(username: &str, message: String) -> Self {
        ServerEnvelope::Message {
            username: username.to_string(),
            message,
            timestamp: wall_clock(),
        }
    }

    pub fn user_joined(username: &str) -> Self {
        ServerEnvelope::UserJoined {
            username: username.to_string(),
            message: format!("{username} joined the chat"),
            timestamp: wall_clock(),
        }
    }

    pub fn user_left(username: &str) -> Self {
        ServerEnvelope::UserLeft {
            username: username.to_string(),
            message: format!("{username} left the chat"),
            timestamp: wall_clock(),
        }
    }

    pub fn user_list(users: Vec<String>) -> Self {
        ServerEnvelope::UserList { users }
    }
}

fn wall_clock() -> String {
    Local::now().format("%H:%M:%S").to_string()
}
