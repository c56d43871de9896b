//! Session abstraction layer for edge connections
//!
//! This crate provides the traits that separate the connection drivers from the
//! SDK that actually speaks to the edge service. A [`Connector`] establishes one
//! multiplexed [`Session`]; the session opens forwarding sessions
//! ([`Forwarder`]) and raw label-routed tunnels ([`Tunnel`]), and reports what
//! happens to it asynchronously as [`SessionEvent`]s pushed into a queue owned
//! by the caller.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   edgelink-driver                        │
//! │        (agent endpoints, raw tunnels, health)            │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │             edgelink-session (this crate)                │
//! │  - Connector    - Session    - Forwarder    - Tunnel     │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌────────────────────────────┬────────────────────────────┐
//! │  edge SDK bindings         │  local (in-process edge)   │
//! └────────────────────────────┴────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

pub mod local;

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Session closed")]
    Closed,

    #[error("Invalid upstream address '{address}': {reason}")]
    InvalidUpstream { address: String, reason: String },

    #[error("Timeout")]
    Timeout,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Remote error: {0}")]
    Remote(String),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Label set used to route traffic into a raw tunnel
pub type Labels = BTreeMap<String, String>;

/// Sending half of the inbound event queue handed to [`Connector::connect`]
pub type EventSender = mpsc::Sender<SessionEvent>;

/// Which certificate authorities the session trusts when dialing the edge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootCas {
    /// Trust roots bundled with the agent
    #[default]
    Trusted,
    /// Trust the operating system's certificate store
    Host,
}

impl FromStr for RootCas {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trusted" => Ok(RootCas::Trusted),
            "host" => Ok(RootCas::Host),
            other => Err(SessionError::ConfigurationError(format!(
                "invalid root CA mode '{}' (expected 'trusted' or 'host')",
                other
            ))),
        }
    }
}

impl fmt::Display for RootCas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootCas::Trusted => f.write_str("trusted"),
            RootCas::Host => f.write_str("host"),
        }
    }
}

/// Identity reported to the edge when the session is established
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

/// Options for establishing a session
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Override for the edge connect address (host:port)
    pub server_addr: Option<String>,

    /// Certificate authority trust mode
    pub root_cas: RootCas,

    /// Preferred edge region
    pub region: Option<String>,

    /// Bearer credential
    pub authtoken: Option<String>,

    /// Client identity strings, outermost first
    pub client_info: Vec<ClientInfo>,
}

/// Client certificate for mutual TLS to an upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    /// Certificate chain (PEM encoded)
    pub cert_chain: Vec<u8>,

    /// Private key (PEM encoded)
    pub private_key: Vec<u8>,
}

/// TLS policy the edge applies when dialing the upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTls {
    /// Skip verification of the upstream's certificate
    pub insecure_skip_verify: bool,

    /// Certificates presented for mutual TLS
    pub client_certs: Vec<ClientCertificate>,
}

impl Default for UpstreamTls {
    fn default() -> Self {
        Self {
            insecure_skip_verify: true,
            client_certs: Vec::new(),
        }
    }
}

/// Backend a forwarding session delivers traffic to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Backend address, either `scheme://host:port` or `host:port`
    pub addr: String,

    /// Application protocol override (e.g. "http2")
    pub protocol: Option<String>,

    pub tls: UpstreamTls,
}

/// Options for opening a forwarding session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOptions {
    /// Public address to claim; `None` lets the edge assign one
    pub url: Option<String>,
    pub upstream: Upstream,
    pub bindings: Vec<String>,
    pub metadata: String,
    pub description: String,
    pub pooling_enabled: bool,
    pub traffic_policy: Option<String>,
}

/// Request initiated by the edge against this agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    Stop,
    Restart,
    Update {
        version: Option<String>,
        permit_major_version: bool,
    },
    /// Any request this crate has no dedicated variant for
    Other(String),
}

impl RemoteCommand {
    /// Short request type name, used in logs and rejections
    pub fn kind(&self) -> &str {
        match self {
            RemoteCommand::Stop => "stop",
            RemoteCommand::Restart => "restart",
            RemoteCommand::Update { .. } => "update",
            RemoteCommand::Other(kind) => kind,
        }
    }
}

/// A remote command together with the channel its answer goes back on
#[derive(Debug)]
pub struct CommandRequest {
    command: RemoteCommand,
    reply: oneshot::Sender<Result<(), String>>,
}

impl CommandRequest {
    /// Create a request and the receiver the session waits on for the answer
    pub fn new(command: RemoteCommand) -> (Self, oneshot::Receiver<Result<(), String>>) {
        let (reply, rx) = oneshot::channel();
        (Self { command, reply }, rx)
    }

    pub fn command(&self) -> &RemoteCommand {
        &self.command
    }

    /// Answer the request. The session may have stopped waiting already.
    pub fn respond(self, result: Result<(), String>) {
        let _ = self.reply.send(result);
    }
}

/// Something that happened to a session, delivered through the event queue
#[derive(Debug)]
pub enum SessionEvent {
    /// The handshake with the edge completed (initially or after a reconnect)
    Connected,

    /// The connection to the edge was lost; the session may reconnect
    Disconnected { cause: String },

    /// A heartbeat round trip completed
    Heartbeat { latency: Duration },

    /// The edge asks the agent to do something
    Command(CommandRequest),
}

/// A live binding between a public address and an upstream
#[async_trait]
pub trait Forwarder: Send + Sync + Debug + 'static {
    fn id(&self) -> &str;

    /// Public URL the edge resolved for this binding
    fn url(&self) -> &str;

    /// Whether the edge accepted pooling for this binding
    fn pooling_enabled(&self) -> bool;

    fn bindings(&self) -> &[String];

    fn traffic_policy(&self) -> Option<&str>;

    fn metadata(&self) -> &str;

    /// Stop forwarding. Calling this more than once is an error.
    async fn close(&self) -> SessionResult<()>;
}

/// A raw label-routed tunnel yielding one byte stream per remote connection
#[async_trait]
pub trait Tunnel: Send + Sync + Debug + 'static {
    /// Connection type handed out by [`Tunnel::accept`]
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn id(&self) -> &str;

    fn url(&self) -> &str;

    fn labels(&self) -> &Labels;

    /// Wait for the next remote connection.
    ///
    /// Returns [`SessionError::Closed`] once the tunnel has been closed.
    async fn accept(&self) -> SessionResult<Self::Conn>;

    async fn close(&self) -> SessionResult<()>;
}

/// One multiplexed logical connection to the edge
#[async_trait]
pub trait Session: Send + Sync + Debug + 'static {
    type Forwarder: Forwarder;
    type Tunnel: Tunnel;

    /// Open a forwarding session
    async fn forward(&self, options: ForwardOptions) -> SessionResult<Self::Forwarder>;

    /// Open a raw tunnel routed by `labels`
    async fn open_tunnel(&self, labels: Labels) -> SessionResult<Self::Tunnel>;

    /// Disconnect from the edge, tearing down everything opened on this session
    async fn close(&self) -> SessionResult<()>;
}

/// Establishes sessions
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    /// Connect and authenticate.
    ///
    /// Events for the new session are pushed into `events` for as long as the
    /// session lives; the receiving side decides how to react to them.
    async fn connect(
        &self,
        options: ConnectOptions,
        events: EventSender,
    ) -> SessionResult<Self::Session>;
}
