//! Control bus subsystem.
//!
//! Backends announce themselves on a NATS server; every worker holds its
//! own subscriptions and applies events to its own registry.
//!
//! # Subjects (prefix `router` by default)
//! - `router.register` / `router.unregister`: backend descriptor with `uris`
//! - `router.list`: request with a reply subject, answered with `{uid, hosts}`
//! - `router.start`: published by a worker once its listeners are up

pub mod client;
pub mod message;
pub mod protocol;

pub use client::{BusClient, LIST_REPLY_WINDOW};
pub use message::{BusCommand, BusError, Envelope, ListReply, Subjects};
pub use protocol::{BusConnection, ServerOp};
