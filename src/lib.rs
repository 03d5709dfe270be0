//! NetRAID — a distributed, parity-protected block storage cluster.
//!
//! Files are striped across groups of servers in fixed-size stripe
//! units; each group dedicates one server to an XOR parity unit
//! (RAID-4: the parity unit never rotates). Writes are driven through a
//! three-phase commit between the data servers touched by the write and
//! the group's parity server, so a crash mid-write never leaves parity
//! inconsistent with data.
//!
//! # Modules
//!
//! - [`geometry`] - stripe/group/server placement math
//! - [`parity`] - XOR parity folding and checksums
//! - [`store`] - on-disk, versioned block storage
//! - [`cache`] - in-memory version-vector tracking for data objects
//! - [`message`] - wire protocol framing
//! - [`op`] - participant/coordinator state machines and the per-inode arena
//! - [`transport`] - peer connection pool
//! - [`dispatch`] - priority message queues and the worker pool draining them
//! - [`config`] - CLI/environment configuration
//! - [`node`] - per-process server wiring
//! - [`client`] - application-facing read/write entry point
//! - [`metrics`] - Prometheus exposition and health endpoints
//! - [`error`] - error types

pub mod cache;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod geometry;
pub mod message;
pub mod metrics;
pub mod node;
pub mod op;
pub mod parity;
pub mod store;
pub mod transport;

pub use client::Client;
pub use error::{Error, Result};
pub use geometry::{CoordinatorRole, FileLayout, ServerId, StripeId, StripeUnitId};
pub use node::Node;
