//! Readiness-driven multiplexer.
//!
//! One task owns the listener, every connection and the [`ServerContext`].
//! Each iteration waits for the first of: an incoming connection, a
//! connection becoming ready, the poll interval elapsing, or shutdown.
//! It then reads and routes every complete frame, flushes output, drains
//! the outbound queue and reaps closed connections. A failing connection
//! is evicted; it never stops the loop.

use crate::config::Config;
use crate::connection::{Connection, ReadStatus};
use crate::metrics;
use anyhow::{Context, Result};
use futures_util::future::select_all;
use jim_core::{ConnectionId, Delivery, Dispatch, Gateway, Origin, Router, ServerContext};
use jim_protocol::envelope::REPLY_TOO_LARGE_TEXT;
use jim_protocol::{Envelope, Response};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What ended a wait.
enum Wake {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Ready,
    Tick,
    Shutdown,
}

/// The server event loop.
pub struct EventLoop {
    listener: TcpListener,
    router: Router,
    ctx: ServerContext,
    connections: HashMap<ConnectionId, Connection>,
    poll_interval: Duration,
    max_connections: usize,
}

impl EventLoop {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(config: &Config, gateway: Arc<dyn Gateway>) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        info!("JIM server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            router: Router::with_config(config.router_config()),
            ctx: ServerContext::new(gateway),
            connections: HashMap::new(),
            poll_interval: config.poll_interval(),
            max_connections: config.limits.max_connections,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.wait(&mut shutdown).await {
                Wake::Accepted(Ok((stream, addr))) => self.admit(stream, addr),
                Wake::Accepted(Err(e)) => {
                    metrics::record_error("accept");
                    warn!(error = %e, "Accept failed");
                }
                Wake::Ready | Wake::Tick => {}
                Wake::Shutdown => break,
            }

            self.service_reads();
            self.flush_all();
            self.deliver();
            self.flush_all();
            self.reap();

            metrics::set_state(self.ctx.queue.len(), self.ctx.registry.len());
        }

        self.close_all();
    }

    async fn wait(&self, shutdown: &mut watch::Receiver<bool>) -> Wake {
        if *shutdown.borrow() {
            return Wake::Shutdown;
        }

        tokio::select! {
            accepted = self.listener.accept() => Wake::Accepted(accepted),
            _ = any_ready(&self.connections) => Wake::Ready,
            _ = tokio::time::sleep(self.poll_interval) => Wake::Tick,
            _ = shutdown.changed() => Wake::Shutdown,
        }
    }

    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.connections.len() >= self.max_connections {
            metrics::record_refused();
            warn!(addr = %addr, limit = self.max_connections, "Connection limit reached, refusing");
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let id = ConnectionId::next();
        self.connections.insert(id, Connection::new(id, stream, addr));
        info!(connection = %id, addr = %addr, "Connection accepted");
    }

    fn service_reads(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.read_connection(id);
        }
    }

    fn read_connection(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if !conn.accepts_input() {
            return;
        }

        let status = match conn.fill() {
            Ok(status) => status,
            Err(e) => {
                debug!(connection = %id, error = %e, "Read failed");
                self.evict(id, "read_error");
                return;
            }
        };

        // Frames that arrived ahead of EOF are still honoured.
        loop {
            let Some(conn) = self.connections.get_mut(&id) else {
                return;
            };
            // A backlogged peer keeps its remaining frames, and its EOF,
            // until the replies drain.
            if !conn.accepts_input() {
                return;
            }
            let origin = Origin::new(id, conn.addr);

            match conn.next_frame() {
                Ok(Some(envelope)) => {
                    metrics::record_frame(envelope.label());
                    let dispatch = self.router.handle(&mut self.ctx, origin, envelope);
                    self.apply(id, dispatch);
                }
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    metrics::record_error("invalid_frame");
                    let dispatch = self.router.reject_frame(origin, &e);
                    self.apply(id, dispatch);
                }
                Err(e) => {
                    metrics::record_error("protocol");
                    warn!(connection = %id, error = %e, "Undecodable input");
                    self.evict(id, "protocol");
                    return;
                }
            }
        }

        if status == ReadStatus::Eof {
            debug!(connection = %id, "Peer closed connection");
            self.evict(id, "eof");
        }
    }

    fn apply(&mut self, id: ConnectionId, dispatch: Dispatch) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        if let Some(reply) = dispatch.reply {
            if let Err(e) = conn.enqueue(&Envelope::Response(reply)) {
                metrics::record_error("encode");
                warn!(connection = %id, error = %e, "Reply does not fit in a frame");
                let fallback = Envelope::Response(Response::bad_request(REPLY_TOO_LARGE_TEXT));
                if let Err(e) = conn.enqueue(&fallback) {
                    error!(connection = %id, error = %e, "Failed to encode reply");
                }
            }
        }
        if dispatch.close {
            conn.closing = true;
        }
    }

    fn flush_all(&mut self) {
        let failed: Vec<ConnectionId> = self
            .connections
            .values_mut()
            .filter(|c| c.has_pending_output())
            .filter_map(|c| match c.flush() {
                Ok(()) => None,
                Err(e) => {
                    debug!(connection = %c.id, error = %e, "Write failed");
                    Some(c.id)
                }
            })
            .collect();

        for id in failed {
            self.evict(id, "write_error");
        }
    }

    /// Hand queued chat messages to their destinations.
    fn deliver(&mut self) {
        if self.ctx.queue.is_empty() {
            return;
        }

        let registry = &self.ctx.registry;
        let connections = &mut self.connections;
        let mut failed: HashSet<ConnectionId> = HashSet::new();

        let stats = self.ctx.queue.drain(|message| {
            let Some(id) = registry.lookup(&message.destination) else {
                info!(to = %message.destination, "Destination gone, message dropped");
                return Delivery::Dropped;
            };
            if failed.contains(&id) {
                return Delivery::Dropped;
            }
            let Some(conn) = connections.get_mut(&id) else {
                return Delivery::Dropped;
            };
            if conn.has_pending_output() {
                return Delivery::Blocked;
            }

            if let Err(e) = conn.enqueue(&message.envelope) {
                error!(connection = %id, error = %e, "Failed to encode message");
                return Delivery::Dropped;
            }
            match conn.flush() {
                Ok(()) => Delivery::Delivered,
                Err(e) => {
                    debug!(connection = %id, error = %e, "Delivery failed");
                    failed.insert(id);
                    Delivery::Dropped
                }
            }
        });

        if stats.delivered + stats.dropped > 0 {
            debug!(
                delivered = stats.delivered,
                retained = stats.retained,
                dropped = stats.dropped,
                "Queue drained"
            );
        }
        metrics::record_delivery(stats);

        for id in failed {
            self.evict(id, "write_error");
        }
    }

    fn reap(&mut self) {
        let done: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.closing && !c.has_pending_output())
            .map(|c| c.id)
            .collect();

        for id in done {
            if let Some(conn) = self.connections.remove(&id) {
                self.ctx.release(id);
                info!(connection = %id, addr = %conn.addr, "Connection closed");
            }
        }
    }

    /// Drop a connection and end its session.
    fn evict(&mut self, id: ConnectionId, reason: &'static str) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };

        let account = self.ctx.release(id);
        metrics::record_eviction(reason);
        info!(
            connection = %id,
            addr = %conn.addr,
            account = account.as_deref().unwrap_or("-"),
            reason,
            "Connection evicted"
        );
    }

    fn close_all(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(mut conn) = self.connections.remove(&id) {
                if let Err(e) = conn.flush() {
                    debug!(connection = %id, error = %e, "Final flush failed");
                }
                self.ctx.release(id);
            }
        }

        if !self.ctx.queue.is_empty() {
            warn!(pending = self.ctx.queue.len(), "Discarding undelivered messages");
        }
        info!("Event loop stopped");
    }
}

/// Resolve once any connection is ready; pend forever with none.
async fn any_ready(connections: &HashMap<ConnectionId, Connection>) {
    if connections.is_empty() {
        return std::future::pending().await;
    }

    let waits = connections.values().map(|c| Box::pin(c.ready()));
    let _ = select_all(waits).await;
}
