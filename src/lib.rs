//! sstunnel - Connection Orchestration Core for Shadowsocks VPN Clients
//!
//! This crate is the platform-independent part of a Shadowsocks VPN client.
//! It decides *when* a tunnel should be up and reports *what* happened; the
//! packet tunnel itself lives behind the [`tunnel::TunnelBackend`] trait.
//!
//! ## What This Crate Provides
//! - Access key parsing (`ss://`, `ssconf://`, `https://`) and resolution of
//!   dynamic keys over HTTPS
//! - A per-server tunnel state machine with timeouts and reconnection probing
//! - Observable per-server status streams ([`ValueStream`])
//! - A typed, reentrant event bus for domain events ([`EventQueue`])
//! - A server registry enforcing a single active tunnel ([`VpnClient`])
//! - Configuration parsing and validation (TOML format)
//!
//! ## What Your Application Must Implement
//! - A [`tunnel::TunnelBackend`] for the target platform
//! - Persistence of the server list
//! - Forwarding OS network changes to [`VpnClient::network_changed`]

pub mod access_key;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod tunnel;
pub mod value_stream;

// Re-export core types
pub use access_key::{ConfigResolver, ServiceConfig};
pub use client::{ServerInfo, VpnClient};
pub use config::Config;
pub use error::{BackendErrorCode, Result, VpnError};
pub use events::EventQueue;
pub use tunnel::{NetworkStatus, TunnelBackend, TunnelConfig, TunnelController, TunnelStatus};
pub use value_stream::ValueStream;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
