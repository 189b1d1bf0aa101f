//! Envelope types for the JIM protocol.
//!
//! An envelope is one self-describing JSON record. Client requests carry an
//! `action` tag; server replies carry a numeric `response` code instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Success without a payload.
pub const OK: u16 = 200;
/// Success carrying a `data_list`.
pub const ACCEPTED: u16 = 202;
/// Request rejected.
pub const BAD_REQUEST: u16 = 400;

/// Error text for malformed or unexpected requests.
pub const BAD_REQUEST_TEXT: &str = "Bad Request";
/// Error text for a presence whose account name is already in use.
pub const DUPLICATE_NAME_TEXT: &str = "Account name is already in use";
/// Error text for a reply that would not fit in one frame.
pub const REPLY_TOO_LARGE_TEXT: &str = "Reply too large";

/// Current unix time in seconds.
#[must_use]
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Client timestamp carried by every request.
///
/// Peers stamp requests differently: unix seconds, fractional seconds, or
/// preformatted text such as `"24.02.2022 21:02"`. The server never
/// interprets the value, so it is kept as sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    /// Any JSON number.
    Number(serde_json::Number),
    /// Free-form text.
    Text(String),
}

impl Timestamp {
    /// The current unix time in seconds.
    #[must_use]
    pub fn now() -> Self {
        Timestamp::from(unix_time())
    }
}

impl From<u64> for Timestamp {
    fn from(secs: u64) -> Self {
        Timestamp::Number(secs.into())
    }
}

impl From<String> for Timestamp {
    fn from(text: String) -> Self {
        Timestamp::Text(text)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Number(n) => write!(f, "{n}"),
            Timestamp::Text(text) => f.write_str(text),
        }
    }
}

/// Account reference nested under `user` in a presence request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account name being claimed.
    pub account_name: String,
}

/// Request kinds, used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Presence,
    Message,
    Exit,
    GetContacts,
    AddContact,
    RemoveContact,
    GetUsers,
}

impl RequestKind {
    /// Wire name of the action.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Presence => "presence",
            RequestKind::Message => "message",
            RequestKind::Exit => "exit",
            RequestKind::GetContacts => "get_contacts",
            RequestKind::AddContact => "add",
            RequestKind::RemoveContact => "remove",
            RequestKind::GetUsers => "get_users",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Request {
    /// Claim an account name for this connection.
    #[serde(rename = "presence")]
    Presence {
        /// Client timestamp.
        time: Timestamp,
        /// Account being claimed.
        user: Account,
    },

    /// Chat message addressed to another account.
    #[serde(rename = "message")]
    Message {
        /// Sending account.
        from: String,
        /// Destination account.
        to: String,
        /// Client timestamp.
        time: Timestamp,
        /// Message body.
        #[serde(rename = "message_text")]
        text: String,
    },

    /// Leave the server.
    #[serde(rename = "exit")]
    Exit {
        /// Account leaving.
        account_name: String,
        /// Client timestamp.
        time: Timestamp,
    },

    /// List the contacts of `user`.
    #[serde(rename = "get_contacts")]
    GetContacts {
        /// Acting account.
        user: String,
        /// Client timestamp.
        time: Timestamp,
    },

    /// Add `account_name` to the contacts of `user`.
    #[serde(rename = "add", alias = "add_contact")]
    AddContact {
        /// Acting account.
        user: String,
        /// Contact to add.
        account_name: String,
        /// Client timestamp.
        time: Timestamp,
    },

    /// Remove `account_name` from the contacts of `user`.
    #[serde(rename = "remove", alias = "remove_contact")]
    RemoveContact {
        /// Acting account.
        user: String,
        /// Contact to remove.
        account_name: String,
        /// Client timestamp.
        time: Timestamp,
    },

    /// List every account known to the server.
    #[serde(rename = "get_users")]
    GetUsers {
        /// Acting account.
        account_name: String,
        /// Client timestamp.
        time: Timestamp,
    },
}

impl Request {
    /// Get the request kind.
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Presence { .. } => RequestKind::Presence,
            Request::Message { .. } => RequestKind::Message,
            Request::Exit { .. } => RequestKind::Exit,
            Request::GetContacts { .. } => RequestKind::GetContacts,
            Request::AddContact { .. } => RequestKind::AddContact,
            Request::RemoveContact { .. } => RequestKind::RemoveContact,
            Request::GetUsers { .. } => RequestKind::GetUsers,
        }
    }
}

/// A server reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Status code (200, 202 or 400).
    #[serde(rename = "response")]
    pub code: u16,

    /// Human-readable error for 400 replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Names carried by 202 replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_list: Option<Vec<String>>,
}

impl Response {
    /// A plain 200 reply.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: OK,
            error: None,
            data_list: None,
        }
    }

    /// A 202 reply carrying a list of names.
    #[must_use]
    pub fn accepted(data_list: Vec<String>) -> Self {
        Self {
            code: ACCEPTED,
            error: None,
            data_list: Some(data_list),
        }
    }

    /// A 400 reply with an error message.
    #[must_use]
    pub fn bad_request(error: impl Into<String>) -> Self {
        Self {
            code: BAD_REQUEST,
            error: Some(error.into()),
            data_list: None,
        }
    }

    /// Whether the reply signals success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == OK || self.code == ACCEPTED
    }
}

/// One protocol envelope.
///
/// Requests are recognised by their `action` tag, responses by their
/// `response` code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Request(Request),
    Response(Response),
}

impl Envelope {
    /// Short description used in log lines.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Envelope::Request(request) => request.kind().as_str(),
            Envelope::Response(_) => "response",
        }
    }

    /// Create a presence request stamped with the current time.
    #[must_use]
    pub fn presence(account_name: impl Into<String>) -> Self {
        Envelope::Request(Request::Presence {
            time: Timestamp::now(),
            user: Account {
                account_name: account_name.into(),
            },
        })
    }

    /// Create a chat message stamped with the current time.
    #[must_use]
    pub fn message(from: impl Into<String>, to: impl Into<String>, text: impl Into<String>) -> Self {
        Envelope::Request(Request::Message {
            from: from.into(),
            to: to.into(),
            time: Timestamp::now(),
            text: text.into(),
        })
    }

    /// Create an exit request.
    #[must_use]
    pub fn exit(account_name: impl Into<String>) -> Self {
        Envelope::Request(Request::Exit {
            account_name: account_name.into(),
            time: Timestamp::now(),
        })
    }

    /// Create a contact list request.
    #[must_use]
    pub fn get_contacts(user: impl Into<String>) -> Self {
        Envelope::Request(Request::GetContacts {
            user: user.into(),
            time: Timestamp::now(),
        })
    }

    /// Create an add-contact request.
    #[must_use]
    pub fn add_contact(user: impl Into<String>, contact: impl Into<String>) -> Self {
        Envelope::Request(Request::AddContact {
            user: user.into(),
            account_name: contact.into(),
            time: Timestamp::now(),
        })
    }

    /// Create a remove-contact request.
    #[must_use]
    pub fn remove_contact(user: impl Into<String>, contact: impl Into<String>) -> Self {
        Envelope::Request(Request::RemoveContact {
            user: user.into(),
            account_name: contact.into(),
            time: Timestamp::now(),
        })
    }

    /// Create a known-users request.
    #[must_use]
    pub fn get_users(account_name: impl Into<String>) -> Self {
        Envelope::Request(Request::GetUsers {
            account_name: account_name.into(),
            time: Timestamp::now(),
        })
    }
}

impl From<Request> for Envelope {
    fn from(request: Request) -> Self {
        Envelope::Request(request)
    }
}

impl From<Response> for Envelope {
    fn from(response: Response) -> Self {
        Envelope::Response(response)
    }
}
