//! In-process edge
//!
//! [`LocalConnector`] implements the session traits without talking to a
//! remote edge. Forwarding sessions bind a TCP listener on the local host and
//! proxy every accepted connection to their upstream; tunnels bind a TCP
//! listener and hand accepted connections to [`Tunnel::accept`]. The session
//! reports `Connected` right away and then heartbeats on a fixed interval.
//!
//! Only the port of a requested public URL is honored; the listener always
//! binds on the connector's bind host. Pooling is never granted because two
//! listeners cannot share a port.

use crate::{
    ConnectOptions, Connector, EventSender, ForwardOptions, Forwarder, Labels, Session,
    SessionError, SessionEvent, SessionResult, Tunnel,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_BIND_HOST: &str = "127.0.0.1";

/// Resolve an upstream address (`scheme://host:port` or `host:port`) into a
/// dialable `host:port`, filling in the scheme's default port when omitted.
pub fn resolve_upstream(addr: &str) -> SessionResult<String> {
    let invalid = |reason: String| SessionError::InvalidUpstream {
        address: addr.to_string(),
        reason,
    };

    let parsed = if addr.contains("://") {
        Url::parse(addr)
    } else {
        Url::parse(&format!("tcp://{}", addr))
    }
    .map_err(|e| invalid(e.to_string()))?;

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host".to_string()))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| invalid("missing port".to_string()))?;

    Ok(format!("{}:{}", host, port))
}

/// Scheme and port requested by a public URL such as `tcp://x:9000`
fn requested_listener(url: &str) -> SessionResult<(String, u16)> {
    let parsed = if url.contains("://") {
        Url::parse(url)
    } else {
        Url::parse(&format!("tcp://{}", url))
    }
    .map_err(|e| SessionError::ConfigurationError(format!("invalid public URL '{}': {}", url, e)))?;

    Ok((
        parsed.scheme().to_string(),
        parsed.port_or_known_default().unwrap_or(0),
    ))
}

/// Connector for the in-process edge
#[derive(Debug, Clone)]
pub struct LocalConnector {
    bind_host: String,
    heartbeat_interval: Duration,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Host the public listeners bind on
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for LocalConnector {
    type Session = LocalSession;

    async fn connect(
        &self,
        options: ConnectOptions,
        events: EventSender,
    ) -> SessionResult<Self::Session> {
        tracing::info!(
            bind_host = %self.bind_host,
            server_addr = ?options.server_addr,
            region = ?options.region,
            root_cas = %options.root_cas,
            "Starting local edge session"
        );

        let closed = CancellationToken::new();
        tokio::spawn(run_heartbeat(events, self.heartbeat_interval, closed.clone()));

        Ok(LocalSession {
            bind_host: self.bind_host.clone(),
            closed,
        })
    }
}

async fn run_heartbeat(events: EventSender, interval: Duration, closed: CancellationToken) {
    if events.send(SessionEvent::Connected).await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // First tick completes immediately

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                let _ = events
                    .send(SessionEvent::Disconnected {
                        cause: "session closed by agent".to_string(),
                    })
                    .await;
                break;
            }
            _ = ticker.tick() => {
                let event = SessionEvent::Heartbeat { latency: Duration::ZERO };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("Local edge heartbeat stopped");
}

/// Session on the in-process edge; its heartbeat task is the only event producer
#[derive(Debug)]
pub struct LocalSession {
    bind_host: String,
    closed: CancellationToken,
}

#[async_trait]
impl Session for LocalSession {
    type Forwarder = LocalForwarder;
    type Tunnel = LocalTunnel;

    async fn forward(&self, options: ForwardOptions) -> SessionResult<Self::Forwarder> {
        if self.closed.is_cancelled() {
            return Err(SessionError::Closed);
        }

        let target = resolve_upstream(&options.upstream.addr)?;
        let (scheme, port) = match options.url.as_deref() {
            Some(url) => requested_listener(url)?,
            None => ("tcp".to_string(), 0),
        };

        let listener = TcpListener::bind((self.bind_host.as_str(), port)).await?;
        let local_addr = listener.local_addr()?;
        let url = format!("{}://{}", scheme, local_addr);
        let stop = self.closed.child_token();

        tracing::info!(
            url = %url,
            upstream = %target,
            protocol = ?options.upstream.protocol,
            "Local edge forwarding started"
        );

        let accept_task = tokio::spawn(run_forward_listener(listener, target, stop.clone()));

        Ok(LocalForwarder {
            id: format!("fwd_{}", Uuid::new_v4().simple()),
            url,
            bindings: options.bindings,
            traffic_policy: options.traffic_policy,
            metadata: options.metadata,
            stop,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    async fn open_tunnel(&self, labels: Labels) -> SessionResult<Self::Tunnel> {
        if self.closed.is_cancelled() {
            return Err(SessionError::Closed);
        }

        let listener = TcpListener::bind((self.bind_host.as_str(), 0)).await?;
        let url = format!("tcp://{}", listener.local_addr()?);

        tracing::info!(url = %url, labels = ?labels, "Local edge tunnel opened");

        Ok(LocalTunnel {
            id: format!("tun_{}", Uuid::new_v4().simple()),
            url,
            labels,
            listener: Mutex::new(Some(Arc::new(listener))),
            stop: self.closed.child_token(),
        })
    }

    async fn close(&self) -> SessionResult<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        tracing::info!("Local edge session closed");
        Ok(())
    }
}

async fn run_forward_listener(listener: TcpListener, target: String, stop: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer_addr)) => {
                tracing::debug!(peer_addr = %peer_addr, target = %target, "Accepted public connection");

                let target = target.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = stop.cancelled() => {}
                        result = proxy_to_upstream(socket, &target) => {
                            if let Err(e) = result {
                                tracing::warn!(target = %target, error = %e, "Upstream proxy failed");
                            }
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Local edge accept error");
            }
        }
    }

    tracing::debug!(target = %target, "Local edge forwarding stopped");
}

async fn proxy_to_upstream(mut client: TcpStream, target: &str) -> SessionResult<()> {
    let mut upstream = TcpStream::connect(target).await?;
    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;

    tracing::debug!(
        target = %target,
        bytes_to_upstream = sent,
        bytes_to_client = received,
        "Upstream proxy completed"
    );
    Ok(())
}

/// Forwarding session on the in-process edge
#[derive(Debug)]
pub struct LocalForwarder {
    id: String,
    url: String,
    bindings: Vec<String>,
    traffic_policy: Option<String>,
    metadata: String,
    stop: CancellationToken,
    /// Owns the public listener; `None` once closed
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Forwarder for LocalForwarder {
    fn id(&self) -> &str {
        &self.id
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn pooling_enabled(&self) -> bool {
        false
    }

    fn bindings(&self) -> &[String] {
        &self.bindings
    }

    fn traffic_policy(&self) -> Option<&str> {
        self.traffic_policy.as_deref()
    }

    fn metadata(&self) -> &str {
        &self.metadata
    }

    async fn close(&self) -> SessionResult<()> {
        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SessionError::Closed)?;
        self.stop.cancel();

        // The listener is dropped when the accept task returns, freeing the port.
        if let Err(e) = accept_task.await {
            tracing::warn!(id = %self.id, error = %e, "Local edge accept task failed");
        }

        tracing::info!(id = %self.id, url = %self.url, "Local edge forwarding closed");
        Ok(())
    }
}

/// Raw tunnel on the in-process edge
#[derive(Debug)]
pub struct LocalTunnel {
    id: String,
    url: String,
    labels: Labels,
    listener: Mutex<Option<Arc<TcpListener>>>,
    stop: CancellationToken,
}

#[async_trait]
impl Tunnel for LocalTunnel {
    type Conn = TcpStream;

    fn id(&self) -> &str {
        &self.id
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn labels(&self) -> &Labels {
        &self.labels
    }

    async fn accept(&self) -> SessionResult<Self::Conn> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SessionError::Closed)?;

        tokio::select! {
            _ = self.stop.cancelled() => Err(SessionError::Closed),
            accepted = listener.accept() => {
                let (socket, _) = accepted?;
                Ok(socket)
            }
        }
    }

    async fn close(&self) -> SessionResult<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if listener.is_none() {
            return Err(SessionError::Closed);
        }
        self.stop.cancel();

        tracing::info!(id = %self.id, url = %self.url, "Local edge tunnel closed");
        Ok(())
    }
}
