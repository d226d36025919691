//! Gateway Multiplexer Facade
//!
//! The inbound surface a transport layer talks to. A transport maps each of
//! its connections to a stable identity and calls `connect`, `handle` and
//! `disconnect`; it never sees client ids, sessions or rate windows.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Clock, Credentials, SharedGatewayClient};
use crate::application::services::client_registry::{ClientRegistry, RegistryConfig};
use crate::application::services::request_router::{RequestRouter, RouterConfig};
use crate::application::services::session::{SessionConfig, SessionManager};
use crate::application::services::status_monitor::{StatusMonitor, StatusSnapshot};
use crate::domain::client::ClientId;
use crate::domain::operation::{Operation, PermissionSet};
use crate::domain::request::{Params, Response};
use crate::error::ProxyError;

/// Configuration for every component behind the facade.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MuxConfig {
    /// Session manager tuning.
    pub session: SessionConfig,
    /// Client directory limits.
    pub registry: RegistryConfig,
    /// Router timeouts and dispatch mode.
    pub router: RouterConfig,
}

/// Shared-session multiplexer.
#[derive(Debug)]
pub struct GatewayMux {
    sessions: Arc<SessionManager>,
    registry: Arc<ClientRegistry>,
    router: RequestRouter,
    monitor: StatusMonitor,
}

impl GatewayMux {
    /// Wire the components around one gateway.
    #[must_use]
    pub fn new(
        gateway: SharedGatewayClient,
        credentials: Credentials,
        config: MuxConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(
            gateway,
            credentials,
            config.session,
            Arc::clone(&clock),
        ));
        let registry = Arc::new(ClientRegistry::new(config.registry, Arc::clone(&clock)));
        let router = RequestRouter::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&clock),
            config.router,
        );
        let monitor = StatusMonitor::new(Arc::clone(&sessions), Arc::clone(&registry), clock);

        Self {
            sessions,
            registry,
            router,
            monitor,
        }
    }

    /// The session manager.
    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The client registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// The request router.
    #[must_use]
    pub const fn router(&self) -> &RequestRouter {
        &self.router
    }

    /// Spawn the session supervisor and idle sweeper.
    ///
    /// Both stop when `cancel` fires. The session starts connecting right
    /// away rather than on the first request.
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let supervisor = tokio::spawn(Arc::clone(&self.sessions).run(cancel.clone()));
        let sweeper = tokio::spawn(Arc::clone(&self.registry).run_idle_sweeper(cancel.clone()));
        self.sessions.start();
        vec![supervisor, sweeper]
    }

    /// Admit `identity` with `permissions`.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` or `CapacityExceeded` from admission.
    pub fn connect(&self, identity: &str, permissions: PermissionSet) -> Result<ClientId, ProxyError> {
        self.registry
            .admit(identity, permissions)
            .map_err(ProxyError::from)
    }

    /// Admit `identity` with permissions given by operation name.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` for an unknown name, otherwise as `connect`.
    pub fn connect_with_names<'a, I>(&self, identity: &str, names: I) -> Result<ClientId, ProxyError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let permissions = names
            .into_iter()
            .map(Operation::from_str)
            .collect::<Result<PermissionSet, _>>()
            .map_err(|unknown| ProxyError::denied(unknown.0))?;
        self.connect(identity, permissions)
    }

    /// Route one request on behalf of `identity`.
    ///
    /// An unknown identity is `NotFound`; a known client naming an operation
    /// outside the closed set is `PermissionDenied` without touching its rate
    /// window. Everything after that is the router's job.
    pub async fn handle(&self, identity: &str, operation: &str, params: Params) -> Response {
        let Some(client_id) = self.registry.resolve(identity) else {
            return self.router.reject(None, ProxyError::not_found(identity));
        };
        let Ok(operation) = Operation::from_str(operation) else {
            return self
                .router
                .reject(Some(client_id), ProxyError::denied(operation.trim()));
        };

        let request = self.router.request(client_id, operation, params);
        self.router.route(request).await
    }

    /// Convenience wrapper over `handle` for callers holding a JSON value.
    ///
    /// Non-object values are treated as no parameters.
    pub async fn handle_value(&self, identity: &str, operation: &str, params: Value) -> Response {
        let params = match params {
            Value::Object(map) => map,
            _ => Params::new(),
        };
        self.handle(identity, operation, params).await
    }

    /// Remove `identity`. Unknown identities are ignored.
    pub fn disconnect(&self, identity: &str) -> bool {
        self.registry
            .resolve(identity)
            .is_some_and(|id| self.registry.remove(id))
    }

    /// Status snapshot.
    #[must_use]
    pub fn get_status(&self) -> StatusSnapshot {
        self.monitor.snapshot()
    }

    /// The status monitor.
    #[must_use]
    pub const fn monitor(&self) -> &StatusMonitor {
        &self.monitor
    }

    /// Clear a latched fatal session error and reconnect.
    pub fn restart_session(&self) -> bool {
        self.sessions.restart()
    }

    /// Drain dispatched calls, then log out.
    pub async fn shutdown(&self) {
        self.router.shutdown().await;
        self.sessions.shutdown().await;
    }
}
