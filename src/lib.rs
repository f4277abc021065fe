//! A small line-based chat system for machines on one network.
//!
//! See `README.md` for usage and the JSON wire protocol. One binary serves
//! both roles: `lanchat server` hosts the chat, `lanchat client` joins it
//! from a terminal. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`envelope`] defines the tagged JSON envelopes both sides exchange.
//! - [`framing`] frames the byte stream into newline-delimited documents.
//! - [`registry`] tracks who is connected and fans envelopes out to
//!   per-connection outbound queues.
//! - [`server`] accepts TCP connections and drives one session per client:
//!   login handshake, chat loop, departure broadcast.
//! - [`link`] is the client-side connection: a bounded login handshake, then
//!   a background read loop feeding a queue-backed inbox.
//! - [`client`] multiplexes stdin and the inbox for a terminal user.
//!
//! Integration and end-to-end tests use this crate directly to exercise the
//! session state machine and the wire protocol.

pub mod cli;
pub mod client;
pub mod envelope;
pub mod framing;
pub mod link;
pub mod registry;
pub mod server;
