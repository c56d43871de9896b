use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::proxy::run_proxy;
use crate::registry::Registry;
use edgelink_session::{Connector, Labels, Session, SessionError, SessionEvent, Tunnel};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_QUEUE_CAPACITY: usize = 16;

/// A registered tunnel and the token that stops its proxy loop
#[derive(Debug)]
struct TunnelHandle<T> {
    tunnel: Arc<T>,
    labels: Labels,
    proxy: CancellationToken,
}

impl<T: Tunnel> TunnelHandle<T> {
    /// Close the tunnel and stop its proxy loop. A tunnel the session already
    /// tore down counts as closed.
    async fn close(&self) -> Result<(), DriverError> {
        let result = self.tunnel.close().await;
        self.proxy.cancel();

        match result {
            Ok(()) => Ok(()),
            Err(SessionError::Closed) => {
                tracing::debug!(id = %self.tunnel.id(), "Tunnel was already closed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Raw tunnels proxying to fixed in-cluster destinations.
///
/// Each tunnel gets a proxy loop that dials `destination` for every
/// connection the edge routes into it.
pub struct TunnelDriver<S: Session> {
    session: Arc<S>,
    tunnels: Registry<TunnelHandle<S::Tunnel>>,
}

impl<S: Session> TunnelDriver<S> {
    /// Connect a session for raw tunnels.
    ///
    /// This session does not feed health; its events are only logged and
    /// remote commands are refused.
    pub async fn connect<C>(connector: &C, config: DriverConfig) -> Result<Self, DriverError>
    where
        C: Connector<Session = S>,
    {
        let options = config.connect_options()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let session = connector
            .connect(options, events_tx)
            .await
            .map_err(DriverError::Connect)?;
        tokio::spawn(log_events(events_rx));

        Ok(Self {
            session: Arc::new(session),
            tunnels: Registry::new(),
        })
    }

    /// Make the tunnel registered under `name` carry `labels`.
    ///
    /// An existing tunnel with the same labels is left alone. Otherwise the
    /// new tunnel is registered and serving before the previous one is closed
    /// in the background.
    pub async fn create_tunnel(
        &self,
        name: &str,
        labels: Labels,
        destination: &str,
    ) -> Result<(), DriverError> {
        if let Some(existing) = self.tunnels.get(name).await {
            if existing.labels == labels {
                tracing::debug!(name = %name, "Tunnel already has the requested labels");
                return Ok(());
            }
        }

        let tunnel = self.session.open_tunnel(labels.clone()).await?;
        tracing::info!(
            name = %name,
            id = %tunnel.id(),
            url = %tunnel.url(),
            destination = %destination,
            "Tunnel started"
        );

        let handle = Arc::new(TunnelHandle {
            tunnel: Arc::new(tunnel),
            labels,
            proxy: CancellationToken::new(),
        });
        let previous = self.tunnels.insert(name, handle.clone()).await;

        tokio::spawn(run_proxy(
            handle.tunnel.clone(),
            destination.to_string(),
            handle.proxy.clone(),
        ));

        if let Some(previous) = previous {
            let name = name.to_string();
            tokio::spawn(async move {
                if let Err(e) = previous.close().await {
                    tracing::warn!(
                        name = %name,
                        id = %previous.tunnel.id(),
                        error = %e,
                        "Failed to close replaced tunnel"
                    );
                }
            });
        }

        Ok(())
    }

    /// Close and forget the tunnel registered under `name`.
    ///
    /// Unknown names succeed, as do tunnels the session already closed.
    pub async fn delete_tunnel(&self, name: &str) -> Result<(), DriverError> {
        let Some(handle) = self.tunnels.get(name).await else {
            tracing::debug!(name = %name, "No tunnel to delete");
            return Ok(());
        };

        handle.close().await?;
        self.tunnels.remove(name).await;

        tracing::info!(name = %name, id = %handle.tunnel.id(), "Tunnel deleted");
        Ok(())
    }

    /// Public URL of the tunnel registered under `name`
    pub async fn tunnel_url(&self, name: &str) -> Option<String> {
        self.tunnels
            .get(name)
            .await
            .map(|handle| handle.tunnel.url().to_string())
    }

    /// Disconnect the session, taking every tunnel down with it
    pub async fn shutdown(&self) -> Result<(), DriverError> {
        tracing::info!("Shutting down tunnel driver");
        self.session.close().await?;
        Ok(())
    }
}

async fn log_events(mut events: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Connected => tracing::info!("Tunnel session connected"),
            SessionEvent::Disconnected { cause } => {
                tracing::warn!(cause = %cause, "Tunnel session disconnected")
            }
            SessionEvent::Heartbeat { .. } => {}
            SessionEvent::Command(request) => {
                let kind = request.command().kind().to_string();
                tracing::warn!(command = %kind, "Rejecting remote request on tunnel session");
                request.respond(Err(format!(
                    "unsupported remote request on tunnel session: {}",
                    kind
                )));
            }
        }
    }
}
