//! Server context shared by every router call.

use crate::gateway::Gateway;
use crate::queue::OutboundQueue;
use crate::registry::{ConnectionId, SessionRegistry};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry, outbound queue and gateway handle owned by the event loop.
pub struct ServerContext {
    /// Live sessions.
    pub registry: SessionRegistry,
    /// Routed messages awaiting delivery.
    pub queue: OutboundQueue,
    gateway: Arc<dyn Gateway>,
}

impl ServerContext {
    /// Create a context over a gateway.
    #[must_use]
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            queue: OutboundQueue::new(),
            gateway,
        }
    }

    /// The persistence gateway.
    #[must_use]
    pub fn gateway(&self) -> &dyn Gateway {
        self.gateway.as_ref()
    }

    /// End the session held by `connection`, if any, and log it out.
    ///
    /// Messages still queued for the account are discarded.
    pub fn release(&mut self, connection: ConnectionId) -> Option<String> {
        let name = self.registry.remove_connection(connection)?;

        if let Err(e) = self.gateway.logout(&name) {
            warn!(account = %name, error = %e, "Logout failed");
        }
        let purged = self.queue.purge(&name);
        if purged > 0 {
            debug!(account = %name, purged, "Discarded pending messages");
        }
        info!(account = %name, connection = %connection, "Session closed");
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGateway;
    use crate::queue::QueuedMessage;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_release_logs_out() {
        let gateway = Arc::new(MemoryGateway::new());
        let mut ctx = ServerContext::new(gateway.clone());

        gateway
            .login("alice", IpAddr::V4(Ipv4Addr::LOCALHOST), 5000)
            .unwrap();
        ctx.registry.register("alice", ConnectionId(7)).unwrap();
        ctx.queue.push(QueuedMessage::new(
            "alice",
            jim_protocol::Envelope::message("bob", "alice", "late"),
        ));

        assert_eq!(ctx.release(ConnectionId(7)), Some("alice".into()));
        assert!(ctx.registry.is_empty());
        assert!(ctx.queue.is_empty());
        assert!(gateway.active_sessions().unwrap().is_empty());

        assert_eq!(ctx.release(ConnectionId(7)), None);
    }
}
