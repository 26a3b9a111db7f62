//! livewatch daemon - channel registry, credentials, and liveness pipelines
//!
//! This crate provides the daemon's core:
//! - `registry` - persisted set of tracked channels
//! - `credentials` - service and user credential lifecycle
//! - `poller` - periodic batch polling for pull channels
//! - `push` - event session with subscriptions and reconnects for push channels
//! - `service` - operator actions and mode reconciliation
//! - `twitch` / `notify` - platform and notification clients
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         lwd daemon                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────┐  events   ┌──────────────────────────┐     │
//! │  │ChannelRegistry│─────────▶│ reassignment task        │     │
//! │  │ channels.json │          │ assign_modes + push.sync │     │
//! │  └──────┬───────┘           └────────────┬─────────────┘     │
//! │         │ pull set                       │ push set          │
//! │         ▼                                ▼                   │
//! │  ┌──────────────┐           ┌──────────────────────────┐     │
//! │  │    Poller    │           │      PushPipeline        │     │
//! │  │ batch query  │           │ websocket + subscriptions│     │
//! │  └──────┬───────┘           └────────────┬─────────────┘     │
//! │         │                                │                   │
//! │         └──────────────┬─────────────────┘                   │
//! │                        ▼                                     │
//! │                   Notifier                                   │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - External failures are logged and retried on the next natural schedule

pub mod api;
pub mod config;
pub mod credentials;
pub mod notify;
pub mod persist;
pub mod poller;
pub mod push;
pub mod registry;
pub mod service;
pub mod twitch;
