//! VPN Client - server registry and single-tunnel orchestration
//!
//! This module provides the [`VpnClient`] the UI talks to. It keeps the list
//! of servers added from access keys, owns one [`TunnelController`] per
//! server and makes sure at most one tunnel is active at a time. Persisting
//! the list is up to the embedding application.

use crate::access_key::{
    ConfigResolver, HttpConfigFetcher, ServiceConfig, ShadowsocksConfigParser,
};
use crate::config::Config;
use crate::error::{Result, VpnError};
use crate::events::{
    EventQueue, ServerAdded, ServerAlreadyAdded, ServerForgetUndone, ServerForgotten,
    ServerRenamed,
};
use crate::tunnel::{ControllerState, NetworkStatus, TunnelBackend, TunnelController, TunnelStatus};
use crate::value_stream::ValueStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Snapshot of one server for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub access_key: String,
    /// Host of the first hop or of the dynamic config location
    pub host: Option<String>,
    pub status: TunnelStatus,
}

struct ServerEntry {
    name: String,
    access_key: String,
    controller: Arc<TunnelController>,
}

impl ServerEntry {
    fn id(&self) -> &str {
        self.controller.id()
    }

    fn info(&self) -> ServerInfo {
        ServerInfo {
            id: self.id().to_string(),
            name: self.name.clone(),
            access_key: self.access_key.clone(),
            host: self.controller.service_config().host(),
            status: self.controller.status().get(),
        }
    }
}

/// Entry kept around so a forget can be undone
struct ForgottenServer {
    id: String,
    name: String,
    access_key: String,
    service_config: ServiceConfig,
}

/// Registry of servers sharing one tunnel backend
///
/// All domain events are posted on [`VpnClient::events`]; subscribe before
/// calling [`EventQueue::start_publishing`] to receive the ones queued during
/// startup.
pub struct VpnClient {
    config: Config,
    backend: Arc<dyn TunnelBackend>,
    resolver: ConfigResolver,
    events: EventQueue,
    servers: Mutex<Vec<ServerEntry>>,
    forgotten: Mutex<Option<ForgottenServer>>,
}

impl std::fmt::Debug for VpnClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VpnClient")
            .field("servers", &self.lock_servers().len())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl VpnClient {
    /// Create a client that fetches dynamic keys over HTTPS
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built
    pub fn new(config: Config, backend: Arc<dyn TunnelBackend>) -> Result<Self> {
        config.validate()?;
        let fetcher = HttpConfigFetcher::new(&config.fetch, config.timeouts.fetch())?;
        let resolver = ConfigResolver::new(Arc::new(ShadowsocksConfigParser), Arc::new(fetcher));
        Ok(Self::with_resolver(config, backend, resolver))
    }

    /// Create a client with a custom parser/fetcher pair
    pub fn with_resolver(
        config: Config,
        backend: Arc<dyn TunnelBackend>,
        resolver: ConfigResolver,
    ) -> Self {
        Self {
            config,
            backend,
            resolver,
            events: EventQueue::new(),
            servers: Mutex::new(Vec::new()),
            forgotten: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lock_servers(&self) -> MutexGuard<'_, Vec<ServerEntry>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_forgotten(&self) -> MutexGuard<'_, Option<ForgottenServer>> {
        self.forgotten.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_controller(
        &self,
        id: String,
        service_config: ServiceConfig,
    ) -> Result<Arc<TunnelController>> {
        TunnelController::new(
            id,
            service_config,
            Arc::clone(&self.backend),
            self.resolver.clone(),
            self.events.clone(),
            self.config.clone(),
        )
    }

    /// Controller for `id`
    ///
    /// # Errors
    /// `ServerNotFound` for an unknown id
    pub fn controller(&self, id: &str) -> Result<Arc<TunnelController>> {
        self.lock_servers()
            .iter()
            .find(|entry| entry.id() == id)
            .map(|entry| Arc::clone(&entry.controller))
            .ok_or_else(|| VpnError::ServerNotFound(id.to_string()))
    }

    /// Add a server from an access key and return its id.
    ///
    /// Adding a key that is already registered returns the existing id and
    /// publishes `ServerAlreadyAdded` instead of `ServerAdded`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_server(&self, access_key: &str) -> Result<String> {
        let access_key = access_key.trim();

        let existing = self
            .lock_servers()
            .iter()
            .find(|entry| entry.access_key == access_key)
            .map(|entry| (entry.id().to_string(), entry.name.clone()));
        if let Some((server_id, name)) = existing {
            log::info!("Access key already added as server {}", server_id);
            self.events.enqueue(ServerAlreadyAdded {
                server_id: server_id.clone(),
                name,
            });
            return Ok(server_id);
        }

        let service_config = self.resolver.parse_access_key(access_key)?;
        let server_id = uuid::Uuid::new_v4().to_string();
        let controller = self.new_controller(server_id.clone(), service_config)?;

        let name = {
            let mut servers = self.lock_servers();
            let name = controller
                .service_config()
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| default_name(&servers));
            servers.push(ServerEntry {
                name: name.clone(),
                access_key: access_key.to_string(),
                controller,
            });
            name
        };

        log::info!("➕ Added server {} ({})", server_id, name);
        self.events.enqueue(ServerAdded {
            server_id: server_id.clone(),
            name,
        });
        Ok(server_id)
    }

    pub fn rename_server(&self, id: &str, name: &str) -> Result<()> {
        {
            let mut servers = self.lock_servers();
            let entry = servers
                .iter_mut()
                .find(|entry| entry.id() == id)
                .ok_or_else(|| VpnError::ServerNotFound(id.to_string()))?;
            entry.name = name.to_string();
        }

        log::debug!("Renamed server {} to {}", id, name);
        self.events.enqueue(ServerRenamed {
            server_id: id.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    /// Remove a server, tearing its tunnel down and closing its status
    /// stream. The most recent forget can be reverted with
    /// [`VpnClient::undo_forget`].
    pub async fn forget_server(&self, id: &str) -> Result<()> {
        let entry = {
            let mut servers = self.lock_servers();
            let index = servers
                .iter()
                .position(|entry| entry.id() == id)
                .ok_or_else(|| VpnError::ServerNotFound(id.to_string()))?;
            servers.remove(index)
        };

        if let Err(e) = entry.controller.shutdown().await {
            log::warn!("Tunnel of forgotten server {} did not stop cleanly: {}", id, e);
        }

        *self.lock_forgotten() = Some(ForgottenServer {
            id: id.to_string(),
            name: entry.name,
            access_key: entry.access_key,
            service_config: entry.controller.service_config().clone(),
        });

        log::info!("➖ Forgot server {}", id);
        self.events.enqueue(ServerForgotten {
            server_id: id.to_string(),
        });
        Ok(())
    }

    /// Restore the most recently forgotten server under its old id
    pub fn undo_forget(&self, id: &str) -> Result<()> {
        let forgotten = {
            let mut slot = self.lock_forgotten();
            match slot.take() {
                Some(server) if server.id == id => server,
                other => {
                    *slot = other;
                    return Err(VpnError::ServerNotFound(id.to_string()));
                }
            }
        };

        let controller = self.new_controller(forgotten.id.clone(), forgotten.service_config)?;
        self.lock_servers().push(ServerEntry {
            name: forgotten.name,
            access_key: forgotten.access_key,
            controller,
        });

        log::info!("Restored server {}", id);
        self.events.enqueue(ServerForgetUndone {
            server_id: id.to_string(),
        });
        Ok(())
    }

    /// Connect `id`, disconnecting any other active tunnel first
    pub async fn connect(&self, id: &str) -> Result<()> {
        let target = self.controller(id)?;

        let others: Vec<Arc<TunnelController>> = self
            .lock_servers()
            .iter()
            .filter(|entry| entry.id() != id)
            .filter(|entry| entry.controller.state() != ControllerState::Disconnected)
            .map(|entry| Arc::clone(&entry.controller))
            .collect();

        for other in others {
            log::info!("Switching away from server {}", other.id());
            other.disconnect().await?;
        }

        target.connect().await
    }

    pub async fn disconnect(&self, id: &str) -> Result<()> {
        self.controller(id)?.disconnect().await
    }

    /// Status stream of `id`
    pub fn status(&self, id: &str) -> Result<ValueStream<TunnelStatus>> {
        Ok(self.controller(id)?.status())
    }

    /// Servers in the order they were added
    pub fn servers(&self) -> Vec<ServerInfo> {
        self.lock_servers().iter().map(ServerEntry::info).collect()
    }

    /// Forward an OS network hint to every tunnel; only a live one reacts
    pub fn network_changed(&self, status: NetworkStatus) {
        let controllers: Vec<Arc<TunnelController>> = self
            .lock_servers()
            .iter()
            .map(|entry| Arc::clone(&entry.controller))
            .collect();
        for controller in controllers {
            controller.network_changed(status);
        }
    }
}

/// First free "Server N" name
fn default_name(servers: &[ServerEntry]) -> String {
    (1..)
        .map(|n| format!("Server {n}"))
        .find(|candidate| servers.iter().all(|entry| &entry.name != candidate))
        .unwrap_or_else(|| "Server".to_string())
}
