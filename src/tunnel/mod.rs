//! Tunnel lifecycle management
//!
//! The native packet tunnel is an opaque [`TunnelBackend`]. This module owns
//! the types exchanged with it and the [`TunnelController`] that drives one
//! tunnel's lifecycle on top of it.

pub mod controller;
pub mod timeout;

pub use controller::{ControllerState, TunnelController};
pub use timeout::with_timeout;

use crate::error::Result;
use async_trait::async_trait;

/// Fully resolved, directly runnable tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Serialized transport descriptor
    pub client: String,
    /// `host:port` of the first-hop proxy
    pub first_hop: String,
}

/// Externally observable state of one tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TunnelStatus::Connected => "connected",
            TunnelStatus::Disconnected => "disconnected",
            TunnelStatus::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Host network link hint from OS network monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// A link is available; it may differ from the previous one
    Available,
    Lost,
}

/// Callback invoked by the backend on spontaneous status changes
pub type StatusListener = Box<dyn Fn(TunnelStatus) + Send + Sync>;

/// Handle returned by [`TunnelBackend::on_status_change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Platform tunnel implementation.
///
/// Errors are reported as [`crate::VpnError::Backend`] carrying one of the
/// fixed [`crate::BackendErrorCode`]s.
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Start routing traffic through `config`. With `check_connectivity`,
    /// the call only succeeds once the proxy is known to work.
    async fn connect(&self, config: &TunnelConfig, check_connectivity: bool) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn is_running(&self) -> Result<bool>;

    async fn is_reachable(&self, host: &str, port: u16) -> Result<bool>;

    /// Register a listener for backend-driven status changes. Backends
    /// must support several listeners.
    fn on_status_change(&self, listener: StatusListener) -> ListenerId;

    /// Drop a listener registered with `on_status_change`. Unknown ids are
    /// ignored.
    fn remove_status_listener(&self, id: ListenerId);

    /// Turn on verbose backend diagnostics. Only valid before `connect`.
    async fn enable_debug_mode(&self) -> Result<()> {
        Ok(())
    }
}
