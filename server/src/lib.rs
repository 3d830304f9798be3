//! # Group Relay Server Library
//!
//! This library implements the relay server for spatially grouped peers. Peers
//! connect over TCP, join a numbered group, and from then on the server fans
//! their presence and position announcements out to groupmates and routes
//! directed messages (acknowledgments, name lookups) to a single recipient.
//! Peers in different groups never observe each other's traffic.
//!
//! ## Architecture Design
//!
//! ### Router Task
//! A single router task owns the listening socket and the group registry. New
//! connections sit in an ungrouped set until their join request arrives; the
//! router then finds or creates the group's worker and hands the socket over
//! as an ownership transfer on the worker's command channel.
//!
//! ### Worker Per Group
//! Every active group has its own worker task that owns its connections, its
//! membership set and the write side of each socket. Nothing about a group is
//! shared with any other task, so no locks are involved, and a recipient that
//! is slow to drain its socket only holds up its own group.
//!
//! ### Bounded Delivery
//! Every outgoing write is bounded by the configured send timeout. A recipient
//! whose write fails or times out is torn down like a closed connection, so a
//! disconnect notice can never spin on an unresponsive peer.
//!
//! ## Module Organization
//!
//! - `router`: accept loop, join handshake, handoff, control handle
//! - `registry`: group identifier to worker handle
//! - `worker`: per-group dispatch loop and relay policy
//! - `connection`: per-connection reader task and bounded writes
//! - `membership`: the greeted members of one group
//! - `config`, `error`: relay settings and error type
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{start_relay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (handle, addr) = start_relay(RelayConfig::default()).await?;
//!     println!("listening on {}", addr);
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod membership;
pub mod registry;
pub mod router;
pub mod worker;

pub use config::RelayConfig;
pub use error::RelayError;
pub use router::{start_relay, RelayHandle};
