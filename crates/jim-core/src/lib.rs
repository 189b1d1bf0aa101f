//! # jim-core
//!
//! Session registry, outbound queue, persistence gateway and message
//! routing for the JIM chat server.
//!
//! - **SessionRegistry** - Account name ↔ connection bindings
//! - **OutboundQueue** - Routed messages awaiting a writable destination
//! - **Gateway** - Persistence interface (`MemoryGateway` reference backend)
//! - **Router** - Protocol state machine over a `ServerContext`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Event loop  │────▶│   Router    │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │    │
//!        │                   ▼    ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        └────────────│    Queue    │     │   Gateway   │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod context;
pub mod gateway;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod router;

pub use context::ServerContext;
pub use gateway::{
    ActiveSession, Gateway, LoginRecord, MessageCounters, StorageError, UserRecord,
};
pub use memory::{MemoryGateway, Snapshot};
pub use queue::{Delivery, DrainStats, OutboundQueue, QueuedMessage};
pub use registry::{ConnectionId, RegistryError, SessionRegistry};
pub use router::{Dispatch, Origin, Router, RouterConfig, RouterError};
