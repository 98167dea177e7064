//! sockpool: a thread-safe connection registry with readiness polling
//!
//! Connections are accepted or dialed, registered with an interest, and
//! waited on with `poll(2)`. Registration changes from other threads wake a
//! blocked waiter through a self-pipe, so new connections are picked up
//! without waiting for the poll timeout.
//!
//! # Architecture
//!
//! ```text
//! PassiveSocket ──accept──┐
//!                         ├─→ ActiveConnection ─add─→ ConnectionRegistry ─get─→ handler
//! dial::connect ──────────┘                              ↑
//!                                       Waker (self-pipe) ┘
//! ```
//!
//! # Modules
//!
//! - `address`: IP / unix domain endpoints
//! - `socket`: listening and connected sockets, connection identity
//! - `dial`: outbound connect and in-place reconnect
//! - `registry`: the connection registry and readiness types
//! - `server`: accept loops, dispatch, stop tokens
//! - `client`: sender-driven client loop
//! - `config`: TOML configuration
//! - `logging`: `tracing` subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code; descriptor-level work lives in
//! `sockpool-fd`.

#![forbid(unsafe_code)]

pub mod address;
pub mod client;
pub mod config;
pub mod dial;
pub mod error;
pub mod logging;
pub mod registry;
pub mod server;
pub mod socket;

pub use address::{Address, AddressKind};
pub use client::Client;
pub use config::{Config, ConfigError, PoolConfig, ServerConfig};
pub use error::{Error, Result};
pub use registry::{ConnectionRef, ConnectionRegistry, Interest, Readiness, ReadyConnection, Waker};
pub use server::{ConnectionHandler, Disposition, EchoHandler, ServeStats, Server, StopToken};
pub use socket::{ActiveConnection, Identity, PassiveSocket};
