//! Client Registry
//!
//! Directory of connected downstream clients. The registry-wide lock is only
//! held to add, remove or look up a connection; per-client rate and usage
//! state sits behind each connection's own lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::application::ports::Clock;
use crate::domain::client::{ClientConnection, ClientId, ClientUsage, InFlightGuard};
use crate::domain::operation::PermissionSet;
use crate::domain::rate_limit::RateLimitPolicy;
use crate::error::{AdmissionError, ProxyError};
use crate::infrastructure::metrics;

/// Registry limits and defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Maximum simultaneously connected clients.
    pub max_clients: usize,
    /// Connections idle longer than this are evicted.
    pub idle_timeout: Duration,
    /// How often the idle sweeper runs.
    pub sweep_interval: Duration,
    /// Operations any client may be granted.
    pub allowed_operations: PermissionSet,
    /// Rate window applied to every client.
    pub rate_limit: RateLimitPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_clients: 64,
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            allowed_operations: PermissionSet::all(),
            rate_limit: RateLimitPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Directory {
    by_id: HashMap<ClientId, Arc<ClientConnection>>,
    by_identity: HashMap<String, ClientId>,
}

impl Directory {
    fn remove(&mut self, id: ClientId) -> Option<Arc<ClientConnection>> {
        let connection = self.by_id.remove(&id)?;
        if self.by_identity.get(connection.identity()) == Some(&id) {
            self.by_identity.remove(connection.identity());
        }
        Some(connection)
    }
}

/// Connected clients, indexed by id and identity.
#[derive(Debug)]
pub struct ClientRegistry {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    directory: RwLock<Directory>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            directory: RwLock::new(Directory::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Admit a client with the requested permissions.
    ///
    /// Re-admitting a connected identity replaces its connection; the old
    /// id is retired and never reused.
    ///
    /// # Errors
    ///
    /// - `PermissionDenied` if a requested operation is not in the allow-list.
    /// - `CapacityExceeded` if the registry is full.
    pub fn admit(
        &self,
        identity: &str,
        requested: PermissionSet,
    ) -> Result<ClientId, AdmissionError> {
        let denied = requested.not_covered_by(&self.config.allowed_operations);
        if !denied.is_empty() {
            metrics::record_admission("permission_denied");
            tracing::warn!(identity, ?denied, "Client requested operations outside the allow-list");
            return Err(AdmissionError::PermissionDenied { denied });
        }

        let now = self.clock.monotonic_now();
        let connected_at = self.clock.now_utc();
        let (id, replaced, count) = {
            let mut directory = self.directory.write();
            let replaced = directory
                .by_identity
                .get(identity)
                .copied()
                .and_then(|old| directory.remove(old));

            if replaced.is_none() && directory.by_id.len() >= self.config.max_clients {
                drop(directory);
                metrics::record_admission("capacity_exceeded");
                tracing::warn!(identity, max_clients = self.config.max_clients, "Client capacity reached");
                return Err(AdmissionError::CapacityExceeded {
                    max: self.config.max_clients,
                });
            }

            let id = ClientId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
            let connection = Arc::new(ClientConnection::new(
                id,
                identity,
                requested,
                self.config.rate_limit,
                now,
                connected_at,
            ));
            directory.by_id.insert(id, connection);
            directory.by_identity.insert(identity.to_string(), id);
            (id, replaced.map(|old| old.id()), directory.by_id.len())
        };

        metrics::record_admission("admitted");
        metrics::set_connected_clients(count);
        match replaced {
            Some(old) => tracing::info!(client_id = %id, replaced = %old, identity, "Client reconnected"),
            None => tracing::info!(client_id = %id, identity, connected = count, "Client admitted"),
        }
        Ok(id)
    }

    /// Remove a client. Removing an unknown id is a no-op.
    pub fn remove(&self, id: ClientId) -> bool {
        let (removed, count) = {
            let mut directory = self.directory.write();
            let removed = directory.remove(id);
            (removed, directory.by_id.len())
        };

        match removed {
            Some(connection) => {
                metrics::set_connected_clients(count);
                tracing::info!(client_id = %id, identity = connection.identity(), "Client removed");
                true
            }
            None => false,
        }
    }

    /// Find a client by id.
    ///
    /// # Errors
    ///
    /// `NotFound` if the id is not connected.
    pub fn lookup(&self, id: ClientId) -> Result<Arc<ClientConnection>, ProxyError> {
        self.directory
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| ProxyError::not_found(id))
    }

    /// Find the id currently bound to `identity`.
    #[must_use]
    pub fn resolve(&self, identity: &str) -> Option<ClientId> {
        self.directory.read().by_identity.get(identity).copied()
    }

    /// Look up a client and mark a request in flight for it.
    ///
    /// The marker is taken under the registry lock, so the idle sweeper
    /// either sees it or has already evicted the client.
    ///
    /// # Errors
    ///
    /// `NotFound` if the id is not connected.
    pub fn checkout(&self, id: ClientId) -> Result<InFlightGuard, ProxyError> {
        let directory = self.directory.read();
        directory
            .by_id
            .get(&id)
            .map(|connection| InFlightGuard::begin(Arc::clone(connection)))
            .ok_or_else(|| ProxyError::not_found(id))
    }

    /// Evict connections idle longer than `idle_timeout` with nothing in
    /// flight. Returns the evicted ids.
    pub fn sweep_idle(&self) -> Vec<ClientId> {
        let now = self.clock.monotonic_now();
        let idle_timeout = self.config.idle_timeout;

        let (evicted, count) = {
            let mut directory = self.directory.write();
            let expired: Vec<ClientId> = directory
                .by_id
                .values()
                .filter(|c| c.in_flight() == 0 && c.idle_for(now) > idle_timeout)
                .map(|c| c.id())
                .collect();
            let evicted: Vec<Arc<ClientConnection>> = expired
                .into_iter()
                .filter_map(|id| directory.remove(id))
                .collect();
            (evicted, directory.by_id.len())
        };

        if !evicted.is_empty() {
            for connection in &evicted {
                tracing::info!(
                    client_id = %connection.id(),
                    identity = connection.identity(),
                    idle_secs = connection.idle_for(now).as_secs(),
                    "Evicting idle client"
                );
            }
            metrics::record_evictions(evicted.len() as u64);
            metrics::set_connected_clients(count);
        }
        evicted.iter().map(|c| c.id()).collect()
    }

    /// Run `sweep_idle` every `sweep_interval` until cancelled.
    pub async fn run_idle_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Idle sweeper cancelled");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep_idle();
                }
            }
        }
    }

    /// Usage rows for every connected client, ordered by id.
    #[must_use]
    pub fn usage(&self) -> Vec<ClientUsage> {
        let now = self.clock.monotonic_now();
        let connections: Vec<Arc<ClientConnection>> =
            self.directory.read().by_id.values().cloned().collect();

        let mut rows: Vec<ClientUsage> = connections.iter().map(|c| c.usage(now)).collect();
        rows.sort_by_key(|row| row.client_id);
        rows
    }

    /// Number of connected clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.directory.read().by_id.len()
    }

    /// Whether no client is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
