//! Actor model implementation for the Consultation Controller.
//!
//! The actor hierarchy:
//!
//! ```text
//! RoomRegistryActor (singleton per controller instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per active consultation)
//!         ├── owns room state (two slots, media flags, channels)
//!         └── supervises N ConnectionActors
//!             └── ConnectionActor (one per WebSocket connection)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Registry serializes room lifecycle**: creation, lookup, and
//!   removal all pass through one mailbox, so first-join races create
//!   exactly one room and occupancy decisions see a consistent view
//! - **Rooms are independent**: callers hold `RoomActorHandle`s and talk
//!   to rooms directly; traffic in one room never contends with another
//! - **Connection mailboxes are the ordered channels**: frames for one
//!   receiver are delivered in the order the room emitted them
//! - **CancellationToken propagation**: registry → room tokens are
//!   parent/child for shutdown; connections are closed explicitly so
//!   final frames drain before the socket goes away
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` singleton that owns the room map
//! - [`room`] - `RoomActor` per active consultation
//! - [`connection`] - `ConnectionActor` per WebSocket connection
//! - [`messages`] - Message types for actor communication

pub mod connection;
pub mod messages;
pub mod registry;
pub mod room;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use messages::{CloseReason, JoinOutcome, RelayFrame, RoomSnapshot};
pub use registry::{RegistrySettings, RoomRegistryActor, RoomRegistryHandle};
pub use room::{RoomActor, RoomActorHandle};
