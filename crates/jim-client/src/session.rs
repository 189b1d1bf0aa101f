//! Client session: handshake, bootstrap and the composer/listener pair.
//!
//! The session owns no socket. It talks to the [I/O task](crate::io)
//! through channels: the composer sends requests and waits for replies,
//! the listener routes everything the server pushes. Either unit stopping
//! ends the session.

use crate::command::{Command, HELP};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::io::{self, IoHandle};
use crate::store::{Direction, HistoryEntry, LocalStore, SharedStore};
use jim_protocol::envelope::BAD_REQUEST_TEXT;
use jim_protocol::{codec, Envelope, Request, Response, Timestamp};
use std::fmt::Write as _;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Lines shown to the user.
pub type Display = mpsc::UnboundedSender<String>;

/// Upper bound on waiting for the I/O task to flush at exit.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// A signed-in client session.
pub struct Session {
    name: String,
    store: SharedStore,
    outbound: mpsc::Sender<Envelope>,
    inbound: mpsc::Receiver<Envelope>,
    io_task: JoinHandle<Result<(), ClientError>>,
    reply_timeout: Duration,
}

impl Session {
    /// Connect to the configured server and sign in as `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Rejected`] if the server refuses the name,
    /// [`ClientError::ConnectionLost`] if it hangs up first.
    pub async fn connect(config: &ClientConfig, name: &str) -> Result<Self, ClientError> {
        let addr = config.server_addr();
        let stream = timeout(config.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::Timeout)??;

        info!(server = %addr, account = %name, "Connected");
        Self::handshake(stream, name, config.reply_timeout()).await
    }

    /// Sign in over an already connected stream.
    ///
    /// # Errors
    ///
    /// Same as [`Session::connect`].
    pub async fn handshake(
        stream: TcpStream,
        name: &str,
        reply_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let IoHandle {
            outbound,
            inbound,
            task,
        } = io::spawn(stream);

        let mut session = Self {
            name: name.to_string(),
            store: LocalStore::shared(),
            outbound,
            inbound,
            io_task: task,
            reply_timeout,
        };

        session.direct_request(Envelope::presence(name)).await?;
        info!(account = %name, "Signed in");
        Ok(session)
    }

    /// Account name of this session.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the local cache.
    #[must_use]
    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    /// Fill the local cache with known users and contacts.
    ///
    /// Failures are logged; the session stays usable with an empty cache.
    pub async fn bootstrap(&mut self) {
        match self.direct_list(Envelope::get_users(&self.name)).await {
            Ok(users) => self.store.lock().await.set_known_users(users),
            Err(e) => error!(error = %e, "Failed to load known users"),
        }
        match self.direct_list(Envelope::get_contacts(&self.name)).await {
            Ok(contacts) => self.store.lock().await.set_contacts(contacts),
            Err(e) => error!(error = %e, "Failed to load contacts"),
        }
    }

    /// Run the composer over `lines` and the listener until either stops.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionLost`] if the server goes away.
    pub async fn run(self, lines: mpsc::Receiver<String>, display: Display) -> Result<(), ClientError> {
        let (replies_tx, replies_rx) = mpsc::channel(16);

        let listener = Listener {
            name: self.name.clone(),
            inbound: self.inbound,
            replies: replies_tx,
            store: self.store.clone(),
            display: display.clone(),
        };
        let composer = Composer {
            name: self.name,
            outbound: self.outbound,
            replies: replies_rx,
            store: self.store,
            reply_timeout: self.reply_timeout,
            overdue: 0,
        };

        let mut listener_task = tokio::spawn(listener.run());

        let result = tokio::select! {
            result = composer.run(lines, display) => result,
            joined = &mut listener_task => match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Listener task failed");
                    Err(ClientError::ConnectionLost)
                }
            },
        };
        listener_task.abort();

        // The composer is gone, so the outbound channel is closed.
        match timeout(FLUSH_TIMEOUT, self.io_task).await {
            Ok(Ok(Ok(()))) => debug!("Connection closed cleanly"),
            Ok(Ok(Err(e))) => debug!(error = %e, "Connection closed with error"),
            Ok(Err(e)) => warn!(error = %e, "I/O task failed"),
            Err(_) => warn!("Timed out flushing outgoing messages"),
        }

        result
    }

    /// Request/reply before the listener runs.
    async fn direct_request(&mut self, envelope: Envelope) -> Result<Response, ClientError> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| ClientError::ConnectionLost)?;

        loop {
            let next = timeout(self.reply_timeout, self.inbound.recv())
                .await
                .map_err(|_| ClientError::Timeout)?;

            match next {
                Some(Envelope::Response(response)) => return check(response),
                Some(other) => debug!(label = other.label(), "Ignoring envelope before reply"),
                None => return Err(ClientError::ConnectionLost),
            }
        }
    }

    async fn direct_list(&mut self, envelope: Envelope) -> Result<Vec<String>, ClientError> {
        let response = self.direct_request(envelope).await?;
        into_list(response)
    }
}

/// Turn a 400 into [`ClientError::Rejected`].
fn check(response: Response) -> Result<Response, ClientError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(ClientError::Rejected(
            response.error.unwrap_or_else(|| BAD_REQUEST_TEXT.to_string()),
        ))
    }
}

fn into_list(response: Response) -> Result<Vec<String>, ClientError> {
    match response {
        Response {
            data_list: Some(list),
            ..
        } => Ok(list),
        other => Err(ClientError::UnexpectedReply(other)),
    }
}

/// What a command left behind.
enum Outcome {
    Done,
    Output(String),
    Exit,
}

/// Reads user commands and talks to the server.
struct Composer {
    name: String,
    outbound: mpsc::Sender<Envelope>,
    replies: mpsc::Receiver<Response>,
    store: SharedStore,
    reply_timeout: Duration,
    /// Requests that timed out and still owe a reply.
    overdue: usize,
}

impl Composer {
    async fn run(mut self, mut lines: mpsc::Receiver<String>, display: Display) -> Result<(), ClientError> {
        let _ = display.send(HELP.to_string());

        while let Some(line) = lines.recv().await {
            if line.trim().is_empty() {
                continue;
            }

            let command = match line.parse::<Command>() {
                Ok(command) => command,
                Err(e) => {
                    let _ = display.send(e.to_string());
                    continue;
                }
            };

            match self.execute(command).await {
                Ok(Outcome::Done) => {}
                Ok(Outcome::Output(text)) => {
                    let _ = display.send(text);
                }
                Ok(Outcome::Exit) => return Ok(()),
                Err(e) if e.is_recoverable() => {
                    let _ = display.send(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        // Input closed: leave as if `exit` was typed.
        self.send(Envelope::exit(&self.name)).await
    }

    async fn execute(&mut self, command: Command) -> Result<Outcome, ClientError> {
        match command {
            Command::Message { to, text } => {
                if !self.ensure_known(&to).await? {
                    return Ok(Outcome::Output(format!("Unknown user: {to}")));
                }
                let envelope = Envelope::message(&self.name, &to, &text);
                codec::encode(&envelope).map_err(ClientError::Unsendable)?;
                self.store.lock().await.record(HistoryEntry {
                    direction: Direction::Outgoing,
                    peer: to.clone(),
                    text,
                    time: Timestamp::now(),
                });
                self.send(envelope).await?;
                info!(to = %to, "Message sent");
                Ok(Outcome::Done)
            }
            Command::History(direction) => {
                let store = self.store.lock().await;
                Ok(Outcome::Output(listing(
                    store.history(direction).iter().map(|e| e.to_string()),
                )))
            }
            Command::Contacts => {
                let contacts = self.store.lock().await.contacts();
                Ok(Outcome::Output(listing(contacts)))
            }
            Command::Users => {
                let users = self.refresh_users().await?;
                Ok(Outcome::Output(listing(users)))
            }
            Command::Add(name) => {
                if !self.ensure_known(&name).await? {
                    return Ok(Outcome::Output(format!("Unknown user: {name}")));
                }
                self.request(Envelope::add_contact(&self.name, &name)).await?;
                self.store.lock().await.add_contact(name.clone());
                Ok(Outcome::Output(format!("Contact added: {name}")))
            }
            Command::Del(name) => {
                if !self.store.lock().await.has_contact(&name) {
                    return Ok(Outcome::Output(format!("Not a contact: {name}")));
                }
                self.request(Envelope::remove_contact(&self.name, &name)).await?;
                self.store.lock().await.remove_contact(&name);
                Ok(Outcome::Output(format!("Contact removed: {name}")))
            }
            Command::Help => Ok(Outcome::Output(HELP.to_string())),
            Command::Exit => {
                self.send(Envelope::exit(&self.name)).await?;
                info!("Exit requested");
                Ok(Outcome::Exit)
            }
        }
    }

    /// Check a name against the cache, refreshing once on a miss.
    async fn ensure_known(&mut self, name: &str) -> Result<bool, ClientError> {
        if self.store.lock().await.is_known(name) {
            return Ok(true);
        }
        let users = self.refresh_users().await?;
        Ok(users.iter().any(|u| u == name))
    }

    async fn refresh_users(&mut self) -> Result<Vec<String>, ClientError> {
        let users = into_list(self.request(Envelope::get_users(&self.name)).await?)?;
        self.store.lock().await.set_known_users(users.clone());
        Ok(users)
    }

    async fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| ClientError::ConnectionLost)
    }

    /// Send `envelope` and wait for its reply.
    ///
    /// The server answers requests in order, so the first `overdue`
    /// replies belong to requests that already timed out.
    async fn request(&mut self, envelope: Envelope) -> Result<Response, ClientError> {
        while let Ok(stale) = self.replies.try_recv() {
            self.discard(&stale);
        }

        self.send(envelope).await?;
        loop {
            let Ok(next) = timeout(self.reply_timeout, self.replies.recv()).await else {
                self.overdue += 1;
                return Err(ClientError::Timeout);
            };
            let response = next.ok_or(ClientError::ConnectionLost)?;
            if self.overdue == 0 {
                return check(response);
            }
            self.discard(&response);
        }
    }

    fn discard(&mut self, response: &Response) {
        self.overdue = self.overdue.saturating_sub(1);
        debug!(code = response.code, overdue = self.overdue, "Discarding late reply");
    }
}

fn listing(items: impl IntoIterator<Item = String>) -> String {
    let mut out = String::new();
    for item in items {
        let _ = writeln!(out, "  {item}");
    }
    if out.is_empty() {
        "  (none)".to_string()
    } else {
        out.trim_end().to_string()
    }
}

/// Routes envelopes pushed by the server.
struct Listener {
    name: String,
    inbound: mpsc::Receiver<Envelope>,
    replies: mpsc::Sender<Response>,
    store: SharedStore,
    display: Display,
}

impl Listener {
    async fn run(mut self) -> Result<(), ClientError> {
        while let Some(envelope) = self.inbound.recv().await {
            match envelope {
                Envelope::Response(response) => {
                    if self.replies.send(response).await.is_err() {
                        debug!("Reply arrived after the composer stopped");
                    }
                }
                Envelope::Request(Request::Message {
                    from,
                    to,
                    time,
                    text,
                }) if to == self.name => {
                    info!(from = %from, "Message received");
                    let _ = self.display.send(format!("{from}: {text}"));
                    self.store.lock().await.record(HistoryEntry {
                        direction: Direction::Incoming,
                        peer: from,
                        text,
                        time,
                    });
                }
                other => warn!(label = other.label(), "Unexpected envelope from server"),
            }
        }

        Err(ClientError::ConnectionLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use jim_protocol::codec;
    use jim_protocol::envelope::DUPLICATE_NAME_TEXT;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    /// Server side of a scripted conversation.
    struct FakeServer {
        stream: TcpStream,
        buf: BytesMut,
    }

    impl FakeServer {
        async fn recv(&mut self) -> Option<Envelope> {
            loop {
                if let Some(envelope) = codec::decode_from(&mut self.buf).unwrap() {
                    return Some(envelope);
                }
                let n = timeout(WAIT, self.stream.read_buf(&mut self.buf))
                    .await
                    .unwrap()
                    .unwrap_or(0);
                if n == 0 {
                    return None;
                }
            }
        }

        async fn expect(&mut self, action: &str) -> Envelope {
            let envelope = self.recv().await.expect("client hung up");
            assert_eq!(envelope.label(), action);
            envelope
        }

        async fn send(&mut self, envelope: Envelope) {
            let bytes = codec::encode(&envelope).unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn reply(&mut self, response: Response) {
            self.send(Envelope::Response(response)).await;
        }
    }

    async fn listen() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    async fn accept(listener: &TcpListener) -> FakeServer {
        let (stream, _) = listener.accept().await.unwrap();
        FakeServer {
            stream,
            buf: BytesMut::new(),
        }
    }

    async fn wait_for(display: &mut mpsc::UnboundedReceiver<String>, line: &str) {
        timeout(WAIT, async {
            while let Some(shown) = display.recv().await {
                if shown == line {
                    return;
                }
            }
            panic!("display closed before {line:?}");
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let (listener, addr) = listen().await;
        tokio::spawn(async move {
            let mut server = accept(&listener).await;
            server.expect("presence").await;
            server.reply(Response::bad_request(DUPLICATE_NAME_TEXT)).await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        match Session::handshake(stream, "alice", WAIT).await {
            Err(ClientError::Rejected(text)) => assert_eq!(text, DUPLICATE_NAME_TEXT),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("handshake should fail"),
        }
    }

    #[tokio::test]
    async fn test_hangup_is_connection_lost() {
        let (listener, addr) = listen().await;
        tokio::spawn(async move {
            let mut server = accept(&listener).await;
            server.expect("presence").await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(
            Session::handshake(stream, "alice", WAIT).await,
            Err(ClientError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_conversation() {
        let (listener, addr) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;
            server.expect("presence").await;
            server.reply(Response::ok()).await;
            server.expect("get_users").await;
            server
                .reply(Response::accepted(vec!["alice".into(), "bob".into()]))
                .await;
            server.expect("get_contacts").await;
            server.reply(Response::accepted(vec![])).await;

            let sent = server.expect("message").await;
            server.send(Envelope::message("bob", "alice", "hi")).await;

            server.expect("add").await;
            server.reply(Response::ok()).await;

            server.expect("exit").await;
            assert_eq!(server.recv().await, None);
            sent
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut session = Session::handshake(stream, "alice", WAIT).await.unwrap();
        session.bootstrap().await;
        let store = session.store();
        assert!(store.lock().await.is_known("bob"));

        let (lines_tx, lines_rx) = mpsc::channel(8);
        let (display_tx, mut display_rx) = mpsc::unbounded_channel();
        let running = tokio::spawn(session.run(lines_rx, display_tx));

        lines_tx.send("message bob hello".into()).await.unwrap();
        wait_for(&mut display_rx, "bob: hi").await;

        lines_tx.send("add bob".into()).await.unwrap();
        wait_for(&mut display_rx, "Contact added: bob").await;

        lines_tx.send("exit".into()).await.unwrap();
        running.await.unwrap().unwrap();

        match server.await.unwrap() {
            Envelope::Request(Request::Message { from, to, text, .. }) => {
                assert_eq!((from.as_str(), to.as_str(), text.as_str()), ("alice", "bob", "hello"));
            }
            other => panic!("unexpected envelope {other:?}"),
        }

        let store = store.lock().await;
        assert_eq!(store.contacts(), vec!["bob"]);
        let history: Vec<_> = store.history(None).iter().map(|e| e.direction).collect();
        assert_eq!(history, vec![Direction::Outgoing, Direction::Incoming]);
    }

    #[tokio::test]
    async fn test_overlong_message_stays_local() {
        let (listener, addr) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;
            server.expect("presence").await;
            server.reply(Response::ok()).await;

            // Nothing reaches the server before the exit
            server.expect("exit").await;
            assert_eq!(server.recv().await, None);
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let session = Session::handshake(stream, "alice", WAIT).await.unwrap();
        let store = session.store();
        store.lock().await.set_known_users(vec!["bob".to_string()]);

        let (lines_tx, lines_rx) = mpsc::channel(8);
        let (display_tx, mut display_rx) = mpsc::unbounded_channel();
        let running = tokio::spawn(session.run(lines_rx, display_tx));

        let long = "y".repeat(1000);
        lines_tx.send(format!("message bob {long}")).await.unwrap();
        let shown = timeout(WAIT, async {
            loop {
                let line = display_rx.recv().await.unwrap();
                if line.starts_with("Cannot send") {
                    return line;
                }
            }
        })
        .await
        .unwrap();
        assert!(shown.contains("exceeds maximum"));

        lines_tx.send("exit".into()).await.unwrap();
        running.await.unwrap().unwrap();
        server.await.unwrap();
        assert!(store.lock().await.history(None).is_empty());
    }

    #[tokio::test]
    async fn test_late_reply_is_not_taken_for_the_next() {
        let (listener, addr) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;
            server.expect("presence").await;
            server.reply(Response::ok()).await;

            // Answer get_users only after the next request is in flight
            server.expect("get_users").await;
            server.expect("add").await;
            server
                .reply(Response::accepted(vec!["alice".into(), "bob".into()]))
                .await;
            server.reply(Response::bad_request("Contact refused")).await;

            server.expect("exit").await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let session = Session::handshake(stream, "alice", Duration::from_millis(300))
            .await
            .unwrap();
        let store = session.store();
        store.lock().await.set_known_users(vec!["bob".to_string()]);

        let (lines_tx, lines_rx) = mpsc::channel(8);
        let (display_tx, mut display_rx) = mpsc::unbounded_channel();
        let running = tokio::spawn(session.run(lines_rx, display_tx));

        lines_tx.send("users".into()).await.unwrap();
        wait_for(&mut display_rx, "Timed out waiting for the server").await;

        lines_tx.send("add bob".into()).await.unwrap();
        wait_for(&mut display_rx, "Server refused: Contact refused").await;
        assert!(store.lock().await.contacts().is_empty());

        lines_tx.send("exit".into()).await.unwrap();
        running.await.unwrap().unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_recipient_refreshes_once() {
        let (listener, addr) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;
            server.expect("presence").await;
            server.reply(Response::ok()).await;

            // Cache miss on "carol": one refresh, still unknown
            server.expect("get_users").await;
            server.reply(Response::accepted(vec!["alice".into()])).await;

            server.expect("exit").await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let session = Session::handshake(stream, "alice", WAIT).await.unwrap();

        let (lines_tx, lines_rx) = mpsc::channel(8);
        let (display_tx, mut display_rx) = mpsc::unbounded_channel();
        let running = tokio::spawn(session.run(lines_rx, display_tx));

        lines_tx.send("message carol hi".into()).await.unwrap();
        wait_for(&mut display_rx, "Unknown user: carol").await;

        // Closing input leaves like `exit`
        drop(lines_tx);
        running.await.unwrap().unwrap();
        server.await.unwrap();
    }
}
