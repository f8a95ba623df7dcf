//! Minimal real-time chat relay over raw TCP.
//!
//! The server runs two concurrent tasks that share one piece of state, the
//! connection registry. The client is a single loop that waits on the
//! keyboard and the socket at the same time.
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`registry`] owns the live connections behind one lock and answers
//!   readiness queries against a snapshot of them.
//! - [`server`] runs the accept task and the dispatch loop, which services one
//!   ready connection per iteration and echoes (or broadcasts) what it reads.
//! - [`client`] multiplexes stdin and server data for a terminal user.
//! - [`message`] splits the unframed wire text into sender label and payload
//!   and defines the control tokens.

pub mod cli;
pub mod client;
pub mod message;
pub mod registry;
pub mod server;
