//! PolyWire Transport
//!
//! Async transport layer for PolyWire secure messaging.
//!
//! This crate wraps `polywire-core` and provides:
//! - The [`Transport`] contract every physical channel implements
//! - A shared connection retry loop with a fixed backoff
//! - A TCP transport for the IP channels and an in-process loopback
//! - The [`Daemon`], which seals, routes and opens messages per channel
//!
//! # Concurrency Invariants
//!
//! - Transport entry points never block the caller; work runs on tokio tasks.
//! - Every task belongs to a per-connection registry. Teardown signals it,
//!   joins for a bounded time and aborts the rest.
//! - Transports hold their daemon weakly through a [`DaemonHandle`].
//! - Locks are `parking_lot` and never held across `.await`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod config;
pub mod daemon;
pub mod error;
pub mod memory;
pub mod retry;
pub mod stream;
pub mod tasks;
pub mod tcp;
pub mod transport;

pub use config::{ChannelId, NetworkAddress, Role, ServiceDescriptor};
pub use daemon::{Daemon, EventListener, SendOutcome, SessionEvent, SessionListener, StandardTransports};
pub use error::TransportError;
pub use memory::{loopback_pair, LoopbackFactory, LoopbackTransport};
pub use retry::{connect_with_retry, RetryPolicy, RETRY_BACKOFF};
pub use tasks::{Cancellation, TaskRegistry};
pub use tcp::IpTransport;
pub use transport::{ConnectionState, DaemonHandle, Transport, TransportEvents, TransportFactory};
