//! livewatch protocol - wire types for the streaming platform
//!
//! This crate provides message types and parsing for:
//! - `eventsub` - frames received on the push session websocket and the
//!   subscription requests sent over HTTP
//! - `helix` - REST/OAuth response bodies used by liveness queries,
//!   identity lookups and token exchanges

pub mod error;
pub mod eventsub;
pub mod helix;

pub use error::ProtocolError;
pub use eventsub::{
    parse_frame, ControlMessage, EventKind, EventSubFrame, SubscriptionRequest,
    SESSION_TRANSPORT_METHOD,
};
pub use helix::{
    CreatedSubscription, HelixStream, HelixUser, StreamsResponse, SubscriptionsResponse,
    TokenResponse, UsersResponse,
};
