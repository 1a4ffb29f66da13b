//! Pty broker: the long-lived process that owns terminal sessions, and the
//! client handle that talks to it
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐        Unix socket        ┌────────────────┐
//! │ MultiClient  │ ◄───────────────────────► │ BrokerServer   │
//! │ (per client) │   frames + SCM_RIGHTS     │ (ptybrokerd)   │
//! └──────────────┘                           └───────┬────────┘
//!                                                    │ openpty + exec
//!                                              ┌─────▼─────┐
//!                                              │  children │
//!                                              └───────────┘
//! ```
//!
//! Children outlive the clients that launched them. A client that restarts attaches
//! again and rediscovers every child, pty master included.

pub mod child;
pub mod client;
pub mod config;
mod launcher;
pub mod protocol;
pub mod server;

pub use child::{Child, ChildState};
pub use client::{ClientEvent, ConnectionState, MultiClient};
pub use config::{BrokerConfig, CacheConfig, ClientConfig};
pub use protocol::{ChildId, ExitStatus, LaunchRequest, TtyConfig};
pub use server::BrokerServer;
