//! Consultation Controller (CC) Service Library
//!
//! This library provides the session coordination core for Televisit
//! remote consultations - a stateful WebSocket signaling server
//! responsible for:
//!
//! - Ephemeral two-party rooms keyed by consultation identifier
//! - Admission of exactly the two authorized participants, with
//!   last-writer-wins reconnect eviction
//! - Opaque relay of connection-negotiation frames (offers, answers,
//!   candidates) for two independent channels per session: primary
//!   audio/video and an optional screen-share
//! - Media-state tracking and broadcast (mic, camera, screen-share)
//! - Teardown on disconnect, explicit end, or idle timeout
//!
//! # Architecture
//!
//! The core uses an actor model hierarchy:
//!
//! ```text
//! RoomRegistryActor (singleton per controller instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per active consultation)
//!         └── supervises N ConnectionActors (one per WebSocket)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Nothing is persisted**: the core is in-memory and ephemeral per
//!   consultation; the authoritative record lives in the scheduling
//!   layer
//! - **Media never touches the core**: once negotiation completes, audio
//!   and video flow directly between the participants
//! - **One external dependency**: the consultation directory answers
//!   authorization checks; everything else is in-process
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation (registry, room, connection)
//! - [`admission`] - Admission gate and the directory authorizer
//! - [`channels`] - Negotiation channel state tracking
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with wire denial-reason mapping
//! - [`observability`] - Health endpoints and metrics
//! - [`transport`] - WebSocket signaling surface

#![warn(clippy::pedantic)]

pub mod actors;
pub mod admission;
pub mod channels;
pub mod config;
pub mod errors;
pub mod observability;
pub mod transport;
