//! A small multi-client chat service over line-oriented TCP.
//!
//! Clients connect, issue `!`-delimited text commands (`/join!Alice`,
//! `/message!hello`, `/change!Bob`, `/users!`, `/exit!`), and receive
//! broadcast or direct replies. Each module focuses on a concrete
//! responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`session`] models one connected client: identity, display name, and
//!   a bounded outbox drained by the connection's writer task.
//! - [`registry`] is the synchronized set of live sessions with
//!   add/remove/broadcast/list operations.
//! - [`command`] parses command lines and dispatches them to per-verb
//!   handlers through a fixed routing table.
//! - [`server`] accepts TCP connections and runs the per-connection
//!   reader and writer tasks.
//! - [`client`] connects to a server, multiplexing stdin and server
//!   lines for a terminal user.
//!
//! Integration and end-to-end tests use this crate directly to exercise
//! the registry, the dispatcher, and the wire behavior.

pub mod cli;
pub mod client;
pub mod command;
pub mod registry;
pub mod server;
pub mod session;
