//! Message router for JIM.
//!
//! The router is the protocol state machine: it validates each request
//! against the session registry, calls the gateway and decides what the
//! event loop should do next. It keeps no state of its own; everything it
//! touches lives in the [`ServerContext`] passed into each call.

use crate::context::ServerContext;
use crate::gateway::StorageError;
use crate::queue::QueuedMessage;
use crate::registry::{ConnectionId, RegistryError};
use jim_protocol::envelope::{BAD_REQUEST_TEXT, DUPLICATE_NAME_TEXT};
use jim_protocol::{Envelope, ProtocolError, Request, Response};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Maximum account name length.
pub const MAX_ACCOUNT_NAME_LENGTH: usize = 64;

/// Validate an account name.
///
/// Names are single words: whitespace and control characters are rejected.
///
/// # Errors
///
/// Returns an error message if the account name is invalid.
pub fn validate_account_name(name: &str, max_length: usize) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Account name cannot be empty");
    }
    if name.len() > max_length {
        return Err("Account name too long");
    }
    if name.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err("Account name contains invalid characters");
    }
    Ok(())
}

/// Router errors. Each one fails a single request.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Invalid account name.
    #[error("Invalid account name: {0}")]
    InvalidAccountName(&'static str),

    /// Another connection holds the name.
    #[error("{DUPLICATE_NAME_TEXT}: {0}")]
    DuplicateName(String),

    /// This connection already holds a session.
    #[error("Connection already signed in as {0}")]
    AlreadyInSession(String),

    /// The acting account is not bound to this connection.
    #[error("Account {0} is not signed in on this connection")]
    NotBound(String),

    /// Too many messages already wait for this destination.
    #[error("Outbound queue full for {0}")]
    QueueFull(String),

    /// Clients may not send responses.
    #[error("{BAD_REQUEST_TEXT}")]
    UnexpectedResponse,

    /// Gateway failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<RegistryError> for RouterError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NameTaken(name) => RouterError::DuplicateName(name),
            RegistryError::AlreadyBound { name, .. } => RouterError::AlreadyInSession(name),
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum account name length.
    pub max_account_name_length: usize,
    /// Maximum number of queued chat messages per destination.
    pub max_pending_messages: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_account_name_length: MAX_ACCOUNT_NAME_LENGTH,
            max_pending_messages: 1_000,
        }
    }
}

/// The connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    /// Connection identifier.
    pub connection: ConnectionId,
    /// Remote address.
    pub addr: SocketAddr,
}

impl Origin {
    /// Create a new origin.
    #[must_use]
    pub fn new(connection: ConnectionId, addr: SocketAddr) -> Self {
        Self { connection, addr }
    }
}

/// What the event loop must do after a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dispatch {
    /// Reply to write to the originating connection.
    pub reply: Option<Response>,
    /// Close the originating connection once the reply is flushed.
    pub close: bool,
}

impl Dispatch {
    /// Nothing to do.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Send a reply.
    #[must_use]
    pub fn reply(response: Response) -> Self {
        Self {
            reply: Some(response),
            close: false,
        }
    }

    /// Send a reply, then close.
    #[must_use]
    pub fn reply_and_close(response: Response) -> Self {
        Self {
            reply: Some(response),
            close: true,
        }
    }

    /// Close without replying.
    #[must_use]
    pub fn close() -> Self {
        Self {
            reply: None,
            close: true,
        }
    }
}

/// The protocol state machine.
#[derive(Debug, Default)]
pub struct Router {
    config: RouterConfig,
}

impl Router {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self { config }
    }

    /// Handle one decoded envelope from `origin`.
    pub fn handle(&self, ctx: &mut ServerContext, origin: Origin, envelope: Envelope) -> Dispatch {
        let label = envelope.label();
        debug!(connection = %origin.connection, action = label, "Routing envelope");

        let result = match envelope {
            Envelope::Request(request) => self.route(ctx, origin, request),
            Envelope::Response(_) => Err(RouterError::UnexpectedResponse),
        };

        match result {
            Ok(dispatch) => dispatch,
            Err(RouterError::DuplicateName(name)) => {
                warn!(
                    connection = %origin.connection,
                    account = %name,
                    "Duplicate account name, closing connection"
                );
                Dispatch::reply_and_close(Response::bad_request(DUPLICATE_NAME_TEXT))
            }
            Err(e) => {
                warn!(connection = %origin.connection, action = label, error = %e, "Request rejected");
                Dispatch::reply(Response::bad_request(e.to_string()))
            }
        }
    }

    /// Answer a frame that was a record but not a valid envelope.
    pub fn reject_frame(&self, origin: Origin, error: &ProtocolError) -> Dispatch {
        warn!(connection = %origin.connection, error = %error, "Bad request");
        Dispatch::reply(Response::bad_request(BAD_REQUEST_TEXT))
    }

    fn route(
        &self,
        ctx: &mut ServerContext,
        origin: Origin,
        request: Request,
    ) -> Result<Dispatch, RouterError> {
        match request {
            Request::Presence { user, .. } => self.presence(ctx, origin, user.account_name),
            Request::Message {
                from,
                to,
                time,
                text,
            } => {
                let envelope = Envelope::Request(Request::Message {
                    from: from.clone(),
                    to: to.clone(),
                    time,
                    text,
                });
                self.message(ctx, origin, &from, &to, envelope)
            }
            Request::Exit { account_name, .. } => {
                require_bound(ctx, origin, &account_name)?;
                ctx.release(origin.connection);
                Ok(Dispatch::close())
            }
            Request::AddContact {
                user, account_name, ..
            } => {
                require_bound(ctx, origin, &user)?;
                ctx.gateway().add_contact(&user, &account_name)?;
                Ok(Dispatch::reply(Response::ok()))
            }
            Request::RemoveContact {
                user, account_name, ..
            } => {
                require_bound(ctx, origin, &user)?;
                ctx.gateway().remove_contact(&user, &account_name)?;
                Ok(Dispatch::reply(Response::ok()))
            }
            Request::GetUsers { account_name, .. } => {
                require_bound(ctx, origin, &account_name)?;
                let names = ctx
                    .gateway()
                    .list_users()?
                    .into_iter()
                    .map(|u| u.username)
                    .collect();
                Ok(Dispatch::reply(Response::accepted(names)))
            }
            Request::GetContacts { user, .. } => {
                require_bound(ctx, origin, &user)?;
                let contacts = ctx.gateway().list_contacts(&user)?;
                Ok(Dispatch::reply(Response::accepted(contacts)))
            }
        }
    }

    fn presence(
        &self,
        ctx: &mut ServerContext,
        origin: Origin,
        name: String,
    ) -> Result<Dispatch, RouterError> {
        validate_account_name(&name, self.config.max_account_name_length)
            .map_err(RouterError::InvalidAccountName)?;

        if let Some(bound) = ctx.registry.name_of(origin.connection) {
            return Err(RouterError::AlreadyInSession(bound.to_string()));
        }
        if ctx.registry.lookup(&name).is_some() {
            return Err(RouterError::DuplicateName(name));
        }

        // Login first so every registered name has a user row.
        ctx.gateway()
            .login(&name, origin.addr.ip(), origin.addr.port())?;
        ctx.registry.register(name.clone(), origin.connection)?;

        info!(
            account = %name,
            connection = %origin.connection,
            addr = %origin.addr,
            "Session opened"
        );
        Ok(Dispatch::reply(Response::ok()))
    }

    fn message(
        &self,
        ctx: &mut ServerContext,
        origin: Origin,
        from: &str,
        to: &str,
        envelope: Envelope,
    ) -> Result<Dispatch, RouterError> {
        require_bound(ctx, origin, from)?;

        if ctx.registry.lookup(to).is_none() {
            warn!(from = %from, to = %to, "Destination not registered, message dropped");
            return Ok(Dispatch::none());
        }
        if ctx.queue.pending_for(to) >= self.config.max_pending_messages {
            return Err(RouterError::QueueFull(to.to_string()));
        }

        ctx.gateway().record_message(from, to)?;
        ctx.queue.push(QueuedMessage::new(to, envelope));

        debug!(from = %from, to = %to, pending = ctx.queue.len(), "Message queued");
        Ok(Dispatch::none())
    }
}

/// Require `account` to be the session bound to the origin connection.
fn require_bound(ctx: &ServerContext, origin: Origin, account: &str) -> Result<(), RouterError> {
    if ctx.registry.is_bound_to(account, origin.connection) {
        Ok(())
    } else {
        Err(RouterError::NotBound(account.to_string()))
    }
}
