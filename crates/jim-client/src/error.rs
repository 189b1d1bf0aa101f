//! Client error types.

use jim_protocol::{ProtocolError, Response};
use thiserror::Error;

/// Errors that end a command or the whole session.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered 400.
    #[error("Server refused: {0}")]
    Rejected(String),

    /// The server closed the connection.
    #[error("Connection lost")]
    ConnectionLost,

    /// The server sent something undecodable.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An outgoing envelope that cannot be framed, such as an overlong message.
    #[error("Cannot send: {0}")]
    Unsendable(ProtocolError),

    /// No reply within the configured timeout.
    #[error("Timed out waiting for the server")]
    Timeout,

    /// A success reply without the expected payload.
    #[error("Unexpected reply: {0:?}")]
    UnexpectedReply(Response),
}

impl ClientError {
    /// Whether the session can carry on after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::Rejected(_)
                | ClientError::Unsendable(_)
                | ClientError::Timeout
                | ClientError::UnexpectedReply(_)
        )
    }
}
