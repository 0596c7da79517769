//! Per-server tunnel state machine
//!
//! A [`TunnelController`] owns the lifecycle of one server's tunnel: it
//! resolves the access key, starts and stops the backend, detects
//! reconnection and probes connectivity until the tunnel is back or the
//! retry budget is spent. Every externally visible transition is mirrored
//! into the server's [`ValueStream`] and posted on the shared
//! [`EventQueue`].
//!
//! Each `connect`, `disconnect` and reconnection episode takes a fresh
//! generation number; work started under an older generation never applies
//! its result.

use crate::access_key::{split_host_port, ConfigResolver, ServiceConfig};
use crate::config::Config;
use crate::error::{Result, VpnError};
use crate::events::{EventQueue, ServerConnected, ServerDisconnected, ServerReconnecting};
use crate::tunnel::{
    with_timeout, ListenerId, NetworkStatus, TunnelBackend, TunnelConfig, TunnelStatus,
};
use crate::value_stream::ValueStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::Notify;

/// Internal controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ControllerState::Disconnected => "disconnected",
            ControllerState::Connecting => "connecting",
            ControllerState::Connected => "connected",
            ControllerState::Reconnecting => "reconnecting",
            ControllerState::Disconnecting => "disconnecting",
        };
        f.write_str(label)
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Machine {
    state: ControllerState,
    generation: u64,
    /// Interrupts an in-flight connect
    cancel: Option<Arc<Notify>>,
    /// Wakes the running reconnection episode
    episode: Option<Arc<Notify>>,
    tunnel_config: Option<TunnelConfig>,
    debug_mode: bool,
}

impl Machine {
    fn advance(&mut self, state: ControllerState) -> u64 {
        self.state = state;
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    fn wake_episode(&mut self) {
        if let Some(episode) = self.episode.take() {
            episode.notify_one();
        }
    }
}

/// Drives one server's tunnel
pub struct TunnelController {
    id: String,
    service_config: ServiceConfig,
    backend: Arc<dyn TunnelBackend>,
    resolver: ConfigResolver,
    events: EventQueue,
    status: ValueStream<TunnelStatus>,
    config: Config,
    machine: Mutex<Machine>,
    on_reconnecting: Mutex<Option<Callback>>,
    on_reconnected: Mutex<Option<Callback>>,
    /// Registration on the backend, released on shutdown or drop
    listener: Mutex<Option<ListenerId>>,
    runtime: Handle,
}

impl std::fmt::Debug for TunnelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelController")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TunnelController {
    /// Create a controller and subscribe it to the backend's status
    /// notifications.
    ///
    /// Must be called from within a tokio runtime; reconnection episodes are
    /// spawned on it.
    pub fn new(
        id: impl Into<String>,
        service_config: ServiceConfig,
        backend: Arc<dyn TunnelBackend>,
        resolver: ConfigResolver,
        events: EventQueue,
        config: Config,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| VpnError::IllegalState(format!("no tokio runtime available: {e}")))?;

        let controller = Arc::new(Self {
            id: id.into(),
            service_config,
            backend,
            resolver,
            events,
            status: ValueStream::new(TunnelStatus::Disconnected),
            config,
            machine: Mutex::new(Machine {
                state: ControllerState::Disconnected,
                generation: 0,
                cancel: None,
                episode: None,
                tunnel_config: None,
                debug_mode: false,
            }),
            on_reconnecting: Mutex::new(None),
            on_reconnected: Mutex::new(None),
            listener: Mutex::new(None),
            runtime,
        });

        let weak: Weak<Self> = Arc::downgrade(&controller);
        let listener = controller.backend.on_status_change(Box::new(move |status| {
            if let Some(controller) = weak.upgrade() {
                controller.handle_backend_status(status);
            }
        }));
        *lock(&controller.listener) = Some(listener);

        Ok(controller)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service_config(&self) -> &ServiceConfig {
        &self.service_config
    }

    pub fn state(&self) -> ControllerState {
        self.lock_machine().state
    }

    /// Handle to the externally observable status stream
    pub fn status(&self) -> ValueStream<TunnelStatus> {
        self.status.clone()
    }

    /// Config the running tunnel was started with
    pub fn tunnel_config(&self) -> Option<TunnelConfig> {
        self.lock_machine().tunnel_config.clone()
    }

    pub fn is_debug_mode(&self) -> bool {
        self.lock_machine().debug_mode
    }

    /// Called once when a reconnection episode starts
    pub fn on_reconnecting<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.on_reconnecting) = Some(Arc::new(callback));
    }

    /// Called once when a reconnection episode restores the tunnel
    pub fn on_reconnected<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.on_reconnected) = Some(Arc::new(callback));
    }

    fn lock_machine(&self) -> MutexGuard<'_, Machine> {
        lock(&self.machine)
    }

    fn publish_status(&self, status: TunnelStatus) {
        if let Err(e) = self.status.set(status) {
            log::debug!("Status {} for server {} not published: {}", status, self.id, e);
        }
    }

    fn fire(&self, slot: &Mutex<Option<Callback>>) {
        let callback = lock(slot).clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Bring the tunnel up.
    ///
    /// A no-op when already connected. On failure the controller is back in
    /// `Disconnected`, the status stream is untouched and the error is
    /// returned exactly as produced by resolution or the backend.
    ///
    /// # Errors
    /// `IllegalState` while another operation is in progress, `Cancelled` if
    /// a `disconnect` interrupted the attempt.
    pub async fn connect(&self) -> Result<()> {
        let (generation, cancel) = {
            let mut machine = self.lock_machine();
            match machine.state {
                ControllerState::Connected => return Ok(()),
                ControllerState::Disconnected => {}
                other => {
                    return Err(VpnError::IllegalState(format!(
                        "cannot connect server {} while {}",
                        self.id, other
                    )))
                }
            }
            let generation = machine.advance(ControllerState::Connecting);
            let cancel = Arc::new(Notify::new());
            machine.cancel = Some(Arc::clone(&cancel));
            (generation, cancel)
        };

        log::info!("🔌 Connecting server {}", self.id);

        let outcome = tokio::select! {
            biased;
            // A finished attempt wins so a late success is seen and torn down.
            result = self.attempt_connect() => result,
            _ = cancel.notified() => {
                Err(VpnError::Cancelled(format!("connect to server {}", self.id)))
            }
        };

        let superseded = {
            let mut machine = self.lock_machine();
            if machine.generation == generation {
                machine.cancel = None;
                match &outcome {
                    Ok(tunnel_config) => {
                        machine.state = ControllerState::Connected;
                        machine.tunnel_config = Some(tunnel_config.clone());
                        self.publish_status(TunnelStatus::Connected);
                    }
                    Err(_) => machine.state = ControllerState::Disconnected,
                }
                None
            } else {
                Some(machine.state)
            }
        };

        if let Some(state) = superseded {
            // The attempt finished after a disconnect already stopped the
            // backend; don't leave a tunnel nobody owns.
            if outcome.is_ok() && state == ControllerState::Disconnected {
                if let Err(e) = self.stop_backend().await {
                    log::warn!("Failed to stop late tunnel for server {}: {}", self.id, e);
                }
            }
            log::info!("Connect to server {} was cancelled", self.id);
            return Err(VpnError::Cancelled(format!("connect to server {}", self.id)));
        }

        match outcome {
            Ok(_) => {
                log::info!("✅ Server {} connected", self.id);
                self.events.enqueue(ServerConnected {
                    server_id: self.id.clone(),
                });
                Ok(())
            }
            Err(e) => {
                log::error!("❌ Failed to connect server {}: {}", self.id, e);
                Err(e)
            }
        }
    }

    async fn attempt_connect(&self) -> Result<TunnelConfig> {
        let tunnel_config = self.resolve().await?;

        let started = with_timeout(
            "connect",
            self.config.timeouts.connect(),
            self.backend.connect(&tunnel_config, true),
        )
        .await;

        if let Err(VpnError::Timeout { .. }) = &started {
            if let Err(e) = self.stop_backend().await {
                log::warn!("Failed to stop backend after connect timeout: {}", e);
            }
        }
        started?;
        Ok(tunnel_config)
    }

    async fn resolve(&self) -> Result<TunnelConfig> {
        with_timeout(
            "fetchConfig",
            self.config.timeouts.fetch(),
            self.resolver.resolve(&self.service_config),
        )
        .await
    }

    async fn stop_backend(&self) -> Result<()> {
        with_timeout("stop", self.config.timeouts.stop(), self.backend.disconnect()).await
    }

    /// Tear the tunnel down. Idempotent once disconnected.
    ///
    /// Interrupts an in-flight `connect` or reconnection episode. The
    /// backend is always asked to stop; its error, if any, is returned after
    /// the controller has settled in `Disconnected`.
    pub async fn disconnect(&self) -> Result<()> {
        let was_live = {
            let mut machine = self.lock_machine();
            let was_live = match machine.state {
                ControllerState::Disconnected | ControllerState::Disconnecting => return Ok(()),
                ControllerState::Connecting => {
                    if let Some(cancel) = machine.cancel.take() {
                        cancel.notify_one();
                    }
                    false
                }
                ControllerState::Connected | ControllerState::Reconnecting => {
                    machine.wake_episode();
                    true
                }
            };
            machine.advance(ControllerState::Disconnecting);
            machine.tunnel_config = None;
            was_live
        };

        log::info!("🔌 Disconnecting server {}", self.id);
        let stopped = self.stop_backend().await;
        if let Err(e) = &stopped {
            log::warn!("Backend stop for server {} failed: {}", self.id, e);
        }

        {
            let mut machine = self.lock_machine();
            machine.state = ControllerState::Disconnected;
            if was_live {
                self.publish_status(TunnelStatus::Disconnected);
            }
        }
        if was_live {
            self.events.enqueue(ServerDisconnected {
                server_id: self.id.clone(),
            });
        }
        log::info!("Server {} disconnected", self.id);
        stopped
    }

    /// Host network hint from the OS
    pub fn network_changed(self: &Arc<Self>, status: NetworkStatus) {
        log::debug!("Network {:?} reported to server {}", status, self.id);
        match status {
            NetworkStatus::Lost => {
                if self.state() == ControllerState::Connected {
                    self.begin_reconnecting("network lost");
                }
            }
            NetworkStatus::Available => self.begin_reconnecting("network changed"),
        }
    }

    /// Turn on backend diagnostics.
    ///
    /// # Panics
    /// When the tunnel is not disconnected; debug mode can only be chosen
    /// before connecting.
    pub async fn enable_debug_mode(&self) -> Result<()> {
        {
            let mut machine = self.lock_machine();
            assert_eq!(
                machine.state,
                ControllerState::Disconnected,
                "debug mode must be enabled before connecting"
            );
            machine.debug_mode = true;
        }
        self.backend.enable_debug_mode().await
    }

    /// Disconnect and close the status stream for good
    pub async fn shutdown(&self) -> Result<()> {
        let stopped = self.disconnect().await;
        self.status.close();
        self.release_listener();
        log::debug!("Controller for server {} shut down", self.id);
        stopped
    }

    fn release_listener(&self) {
        if let Some(listener) = lock(&self.listener).take() {
            self.backend.remove_status_listener(listener);
        }
    }

    fn handle_backend_status(self: &Arc<Self>, status: TunnelStatus) {
        log::debug!("Backend reported {} for server {}", status, self.id);
        match status {
            TunnelStatus::Reconnecting => self.begin_reconnecting("backend reconnecting"),
            TunnelStatus::Connected => {
                let generation = {
                    let machine = self.lock_machine();
                    (machine.state == ControllerState::Reconnecting).then_some(machine.generation)
                };
                if let Some(generation) = generation {
                    self.finish_reconnect(generation, None);
                }
            }
            TunnelStatus::Disconnected => {
                {
                    let mut machine = self.lock_machine();
                    if !matches!(
                        machine.state,
                        ControllerState::Connected | ControllerState::Reconnecting
                    ) {
                        return;
                    }
                    machine.wake_episode();
                    machine.advance(ControllerState::Disconnected);
                    machine.tunnel_config = None;
                    self.publish_status(TunnelStatus::Disconnected);
                }
                log::warn!("Backend dropped the tunnel for server {}", self.id);
                self.events.enqueue(ServerDisconnected {
                    server_id: self.id.clone(),
                });
            }
        }
    }

    /// Open a reconnection episode if connected, or hurry the running one
    fn begin_reconnecting(self: &Arc<Self>, reason: &str) {
        let (generation, wake) = {
            let mut machine = self.lock_machine();
            match machine.state {
                ControllerState::Connected => {}
                ControllerState::Reconnecting => {
                    if let Some(episode) = &machine.episode {
                        episode.notify_one();
                    }
                    return;
                }
                other => {
                    log::debug!("Ignoring {} for server {} while {}", reason, self.id, other);
                    return;
                }
            }
            let generation = machine.advance(ControllerState::Reconnecting);
            let wake = Arc::new(Notify::new());
            machine.episode = Some(Arc::clone(&wake));
            self.publish_status(TunnelStatus::Reconnecting);
            (generation, wake)
        };

        log::warn!("🔄 Server {} reconnecting ({})", self.id, reason);
        self.events.enqueue(ServerReconnecting {
            server_id: self.id.clone(),
        });
        self.fire(&self.on_reconnecting);

        let controller = Arc::clone(self);
        self.runtime.spawn(async move {
            controller.run_episode(generation, wake).await;
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_machine().generation == generation
    }

    async fn run_episode(self: Arc<Self>, generation: u64, wake: Arc<Notify>) {
        let max_attempts = self.config.reconnect.max_retry_attempts;

        for attempt in 1..=max_attempts {
            if !self.is_current(generation) {
                return;
            }
            log::info!(
                "Reconnection probe {}/{} for server {}",
                attempt,
                max_attempts,
                self.id
            );

            let probed = self.probe(generation).await;
            if !self.is_current(generation) {
                return;
            }
            match probed {
                Ok(Some(tunnel_config)) => {
                    self.finish_reconnect(generation, Some(tunnel_config));
                    return;
                }
                Ok(None) => log::info!("Server {} not reachable yet", self.id),
                Err(e) if e.is_transient() => {
                    log::warn!("Reconnection probe for server {} failed: {}", self.id, e)
                }
                Err(e) => {
                    log::error!("❌ Reconnection of server {} abandoned: {}", self.id, e);
                    self.abandon_episode(generation).await;
                    return;
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.reconnect.retry_delay()) => {}
                    _ = wake.notified() => {
                        log::debug!("Reconnection probe for server {} woken early", self.id)
                    }
                }
            }
        }

        log::warn!(
            "Giving up on server {} after {} reconnection probes",
            self.id,
            max_attempts
        );
        self.abandon_episode(generation).await;
    }

    /// One connectivity check; `Some` once the tunnel is usable again.
    ///
    /// Gives up without touching the backend once `generation` is stale.
    async fn probe(&self, generation: u64) -> Result<Option<TunnelConfig>> {
        let tunnel_config = self.resolve().await?;
        let (host, port) = split_host_port(&tunnel_config.first_hop).ok_or_else(|| {
            VpnError::invalid_config_msg(format!("bad first hop '{}'", tunnel_config.first_hop))
        })?;

        let probe_timeout = self.config.timeouts.probe();
        let reachable =
            with_timeout("probe", probe_timeout, self.backend.is_reachable(host, port)).await?;
        if !reachable || !self.is_current(generation) {
            return Ok(None);
        }

        let running = with_timeout("probe", probe_timeout, self.backend.is_running()).await?;
        if running {
            return Ok(Some(tunnel_config));
        }
        if !self.is_current(generation) {
            return Ok(None);
        }

        log::info!("Restarting backend for server {}", self.id);
        with_timeout(
            "connect",
            self.config.timeouts.connect(),
            self.backend.connect(&tunnel_config, false),
        )
        .await?;

        let stale_state = {
            let machine = self.lock_machine();
            (machine.generation != generation).then_some(machine.state)
        };
        match stale_state {
            None => Ok(Some(tunnel_config)),
            Some(state) => {
                // The restart outlived the episode; nobody owns this tunnel.
                if state == ControllerState::Disconnected {
                    if let Err(e) = self.stop_backend().await {
                        log::warn!("Failed to stop late tunnel for server {}: {}", self.id, e);
                    }
                }
                Ok(None)
            }
        }
    }

    fn finish_reconnect(&self, generation: u64, tunnel_config: Option<TunnelConfig>) {
        {
            let mut machine = self.lock_machine();
            if machine.generation != generation || machine.state != ControllerState::Reconnecting {
                return;
            }
            machine.wake_episode();
            machine.advance(ControllerState::Connected);
            if tunnel_config.is_some() {
                machine.tunnel_config = tunnel_config;
            }
            self.publish_status(TunnelStatus::Connected);
        }

        log::info!("✅ Server {} reconnected", self.id);
        self.events.enqueue(ServerConnected {
            server_id: self.id.clone(),
        });
        self.fire(&self.on_reconnected);
    }

    async fn abandon_episode(&self, generation: u64) {
        {
            let mut machine = self.lock_machine();
            if machine.generation != generation || machine.state != ControllerState::Reconnecting {
                return;
            }
            machine.episode = None;
            machine.advance(ControllerState::Disconnecting);
            machine.tunnel_config = None;
        }

        if let Err(e) = self.stop_backend().await {
            log::warn!("Backend stop for server {} failed: {}", self.id, e);
        }

        {
            let mut machine = self.lock_machine();
            machine.state = ControllerState::Disconnected;
            self.publish_status(TunnelStatus::Disconnected);
        }
        self.events.enqueue(ServerDisconnected {
            server_id: self.id.clone(),
        });
    }
}

impl Drop for TunnelController {
    fn drop(&mut self) {
        self.release_listener();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
