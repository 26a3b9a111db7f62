//! livewatch core - shared domain types for channel liveness tracking
//!
//! This crate provides the domain types shared between the protocol
//! crate and the daemon (lwd): tracked channel records, priorities,
//! delivery modes, credentials, and the push/pull assignment engine.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod assignment;
pub mod channel;
pub mod credential;
pub mod error;
pub mod stream;

// Re-exports for convenience
pub use assignment::{assign_modes, needs_reassignment, AssignmentSummary};
pub use channel::{ChannelId, ChannelRecord, DeliveryMode, Handle, Priority};
pub use credential::Credential;
pub use error::{DomainError, DomainResult};
pub use stream::LiveStream;
