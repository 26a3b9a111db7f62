//! Push pipeline: a long-lived event session delivering liveness events for
//! the push-assigned channels.
//!
//! ```text
//!  Disconnected ──▶ Connecting ──welcome──▶ SessionEstablished ──▶ Subscribing ──▶ Active
//!       ▲               ▲                          │ no user credential              │
//!       │               │ cooldown                 ▼                                 │
//!       └─ push set ────┴──── Reconnecting ◀── read error / close / malformed / reconnect
//!          empty
//! ```

mod pipeline;
mod state;
mod transport;

pub use pipeline::{EventOutcome, PushConfig, PushError, PushPipeline, PushStatus};
pub use state::{ErrorBackoff, ReconnectGuard, ReconnectPermit, SessionState};
pub use transport::{
    Dialer, EventTransport, TransportError, WsDialer, WsTransport, DEFAULT_ENDPOINT, DIAL_TIMEOUT,
};
