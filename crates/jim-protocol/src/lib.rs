//! # jim-protocol
//!
//! Wire protocol definitions for the JIM chat system.
//!
//! Every message is a JSON record ("envelope") sent as one bounded frame.
//! Clients send requests tagged with an `action`; the server answers with a
//! numeric `response` code and routes chat messages between sessions.
//!
//! ## Actions
//!
//! - `presence` - Claim an account name for the connection
//! - `message` - Send text to another account
//! - `exit` - Leave the server
//! - `get_users` / `get_contacts` / `add` / `remove` - Directory and contacts
//!
//! ## Example
//!
//! ```rust
//! use jim_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::message("alice", "bob", "hi");
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError, MAX_FRAME_SIZE};
pub use envelope::{unix_time, Account, Envelope, Request, RequestKind, Response, Timestamp};
