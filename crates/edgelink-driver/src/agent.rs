use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::health::{HealthBridge, HealthError, HealthSender};
use crate::registry::Registry;
use edgelink_session::{
    ClientCertificate, CommandRequest, Connector, ForwardOptions, Forwarder, RemoteCommand,
    Session, SessionError, SessionEvent, SessionResult, Upstream, UpstreamTls,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Capacity of the inbound session event queue
const EVENT_QUEUE_CAPACITY: usize = 64;

/// Backend an endpoint forwards to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamSpec {
    /// Backend address, `scheme://host:port` or `host:port`
    pub url: String,

    /// Application protocol override (e.g. "http2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Desired state of one agent endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Public address to claim
    pub url: String,

    pub upstream: UpstreamSpec,

    #[serde(default)]
    pub bindings: Vec<String>,

    /// Opaque metadata attached to the endpoint
    #[serde(default)]
    pub metadata: String,

    #[serde(default)]
    pub description: String,
}

/// Outcome of creating an agent endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointResult {
    /// Public URL the edge assigned
    pub url: String,
    pub traffic_policy: Option<String>,
    pub ready: bool,
}

/// Build the upstream descriptor for `spec`, attaching client certificates
/// for mutual TLS when there are any.
fn build_upstream(
    spec: &UpstreamSpec,
    client_certs: &[ClientCertificate],
) -> Result<Upstream, DriverError> {
    let invalid = |reason: String| DriverError::InvalidUpstream {
        url: spec.url.clone(),
        reason,
    };

    let parsed = if spec.url.contains("://") {
        Url::parse(&spec.url)
    } else {
        Url::parse(&format!("tcp://{}", spec.url))
    }
    .map_err(|e| invalid(e.to_string()))?;

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    Ok(Upstream {
        addr: spec.url.clone(),
        protocol: spec.protocol.clone().filter(|p| !p.is_empty()),
        tls: UpstreamTls {
            client_certs: client_certs.to_vec(),
            ..UpstreamTls::default()
        },
    })
}

/// Treat a close on a handle the session already tore down as done
fn closed_or_gone(result: SessionResult<()>, name: &str, id: &str) -> SessionResult<()> {
    match result {
        Err(SessionError::Closed) => {
            tracing::debug!(name = %name, id = %id, "Endpoint was already closed");
            Ok(())
        }
        other => other,
    }
}

/// Owns one edge session and the agent endpoints opened on it.
///
/// Session events are drained by a task the driver spawns at construction;
/// heartbeats and connects feed the [`HealthBridge`], and a remote stop or
/// restart fires the shutdown token so new endpoints are refused.
pub struct AgentDriver<S: Session> {
    session: Arc<S>,
    endpoints: Registry<S::Forwarder>,
    health: Arc<HealthBridge>,
    shutdown: CancellationToken,
}

impl<S: Session> AgentDriver<S> {
    /// Connect to the edge and start handling session events.
    ///
    /// The driver reports itself not ready until the session says it has
    /// connected. A failed connect is returned as is; there is no retry.
    pub async fn connect<C>(connector: &C, config: DriverConfig) -> Result<Self, DriverError>
    where
        C: Connector<Session = S>,
    {
        let options = config.connect_options()?;

        let (ready_tx, ready_rx) = watch::channel(Some(HealthError::Connecting));
        let (alive_tx, alive_rx) = watch::channel(None);
        let health = Arc::new(HealthBridge::spawn(ready_rx, alive_rx));

        tracing::info!(
            server_addr = ?options.server_addr,
            region = ?options.region,
            root_cas = %options.root_cas,
            "Connecting agent session"
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let session = connector
            .connect(options, events_tx)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Agent session connect failed");
                DriverError::Connect(e)
            })?;
        let session = Arc::new(session);
        let shutdown = CancellationToken::new();

        let handler = EventHandler {
            session: session.clone(),
            ready: ready_tx,
            alive: alive_tx,
            shutdown: shutdown.clone(),
            stop_disconnect_delay: config.stop_disconnect_delay,
        };
        tokio::spawn(handler.run(events_rx));

        Ok(Self {
            session,
            endpoints: Registry::new(),
            health,
            shutdown,
        })
    }

    /// Create or replace the endpoint registered under `name`.
    ///
    /// A non-pooled predecessor is closed before the new endpoint is opened.
    /// A pooled predecessor keeps serving until the new endpoint is up and is
    /// then closed in the background. An `Err` means the endpoint is not
    /// ready; the error is the one the session reported.
    pub async fn create_agent_endpoint(
        &self,
        name: &str,
        spec: &EndpointSpec,
        traffic_policy: Option<&str>,
        client_certs: &[ClientCertificate],
    ) -> Result<EndpointResult, DriverError> {
        if self.shutdown.is_cancelled() {
            return Err(DriverError::ShuttingDown);
        }

        let upstream = build_upstream(&spec.upstream, client_certs)?;

        let superseded = match self.endpoints.get(name).await {
            Some(existing) if !existing.pooling_enabled() => {
                tracing::debug!(
                    name = %name,
                    id = %existing.id(),
                    "Closing non-pooled endpoint before replacing it"
                );
                closed_or_gone(existing.close().await, name, existing.id())?;
                self.endpoints.remove(name).await;
                None
            }
            other => other,
        };

        let options = ForwardOptions {
            url: Some(spec.url.clone()),
            upstream,
            bindings: spec.bindings.clone(),
            metadata: spec.metadata.clone(),
            description: spec.description.clone(),
            pooling_enabled: true,
            traffic_policy: traffic_policy.map(str::to_owned),
        };

        let forwarder = self.session.forward(options).await.map_err(|e| {
            tracing::warn!(name = %name, url = %spec.url, error = %e, "Failed to open endpoint");
            e
        })?;

        let result = EndpointResult {
            url: forwarder.url().to_string(),
            traffic_policy: forwarder.traffic_policy().map(str::to_owned),
            ready: true,
        };

        tracing::info!(
            name = %name,
            id = %forwarder.id(),
            url = %result.url,
            pooling = forwarder.pooling_enabled(),
            "Agent endpoint started"
        );
        self.endpoints.insert(name, Arc::new(forwarder)).await;

        if let Some(previous) = superseded {
            let name = name.to_string();
            tokio::spawn(async move {
                if let Err(e) = previous.close().await {
                    tracing::warn!(
                        name = %name,
                        id = %previous.id(),
                        error = %e,
                        "Failed to close superseded pooled endpoint"
                    );
                }
            });
        }

        Ok(result)
    }

    /// Close and forget the endpoint registered under `name`.
    ///
    /// Unknown names succeed, as do endpoints the session already closed
    /// (for example after a shutdown). Otherwise the entry is only removed
    /// once the close succeeded, so a failed or cancelled delete can be
    /// retried.
    pub async fn delete_agent_endpoint(&self, name: &str) -> Result<(), DriverError> {
        let Some(forwarder) = self.endpoints.get(name).await else {
            tracing::debug!(name = %name, "No endpoint to delete");
            return Ok(());
        };

        closed_or_gone(forwarder.close().await, name, forwarder.id()).map_err(|e| {
            tracing::warn!(name = %name, id = %forwarder.id(), error = %e, "Failed to close endpoint");
            e
        })?;
        self.endpoints.remove(name).await;

        tracing::info!(name = %name, id = %forwarder.id(), "Agent endpoint deleted");
        Ok(())
    }

    /// Public URL of the endpoint registered under `name`
    pub async fn endpoint_url(&self, name: &str) -> Option<String> {
        self.endpoints
            .get(name)
            .await
            .map(|forwarder| forwarder.url().to_string())
    }

    /// Readiness of the session
    pub fn ready(&self) -> Result<(), HealthError> {
        self.health.ready()
    }

    /// Liveness of the session
    pub fn alive(&self) -> Result<(), HealthError> {
        self.health.alive()
    }

    /// Health bridge, for registering with a [`crate::HealthAggregator`]
    pub fn health(&self) -> Arc<HealthBridge> {
        self.health.clone()
    }

    /// Token cancelled once the driver starts shutting down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Refuse new endpoints and disconnect the session
    pub async fn shutdown(&self) -> Result<(), DriverError> {
        tracing::info!("Shutting down agent driver");
        self.shutdown.cancel();
        self.session.close().await?;
        Ok(())
    }
}

/// Drains session events; owns the sending side of both health signals
struct EventHandler<S: Session> {
    session: Arc<S>,
    ready: HealthSender,
    alive: HealthSender,
    shutdown: CancellationToken,
    stop_disconnect_delay: Duration,
}

impl<S: Session> EventHandler<S> {
    async fn run(self, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        tracing::debug!("Session event queue closed");
    }

    fn handle(&self, event: SessionEvent) {
        match event {
            SessionEvent::Heartbeat { latency } => {
                tracing::trace!(latency = ?latency, "Heartbeat received");
                self.ready.send_replace(None);
                self.alive.send_replace(None);
            }
            SessionEvent::Connected => {
                tracing::info!("Agent session connected");
                self.ready.send_replace(None);
            }
            SessionEvent::Disconnected { cause } => {
                tracing::warn!(cause = %cause, "Agent session disconnected");
                self.ready.send_replace(Some(HealthError::Disconnected(cause)));
            }
            SessionEvent::Command(request) => self.handle_command(request),
        }
    }

    fn handle_command(&self, request: CommandRequest) {
        match request.command() {
            RemoteCommand::Stop | RemoteCommand::Restart => {
                let kind = request.command().kind().to_string();
                tracing::info!(command = %kind, "Remote shutdown requested");

                self.alive
                    .send_replace(Some(HealthError::Stopping(kind.clone())));

                let session = self.session.clone();
                let delay = self.stop_disconnect_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = session.close().await {
                        tracing::warn!(command = %kind, error = %e, "Failed to disconnect session");
                    }
                });

                self.shutdown.cancel();
                request.respond(Ok(()));
            }
            RemoteCommand::Update { version, .. } => {
                tracing::info!(version = ?version, "Rejecting remote update request");
                request.respond(Err(
                    "agent updates are not supported: the version is fixed by the deployment"
                        .to_string(),
                ));
            }
            RemoteCommand::Other(kind) => {
                tracing::warn!(command = %kind, "Rejecting unsupported remote request");
                let reason = format!("unsupported remote request: {}", kind);
                request.respond(Err(reason));
            }
        }
    }
}
