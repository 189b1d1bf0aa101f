//! # jim-client
//!
//! Interactive client for the JIM chat server.
//!
//! A [`Session`] signs in, fills a local cache of users and contacts, then
//! runs two units side by side: a composer turning command lines into
//! requests, and a listener routing whatever the server pushes. Neither
//! touches the socket; a single I/O task owns it.

pub mod command;
pub mod config;
pub mod error;
pub mod io;
pub mod session;
pub mod store;

pub use command::{Command, CommandError, HELP};
pub use config::{ClientConfig, ConfigError};
pub use error::ClientError;
pub use session::{Display, Session};
pub use store::{Direction, HistoryEntry, LocalStore, SharedStore};
