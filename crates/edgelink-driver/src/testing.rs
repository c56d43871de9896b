//! Scriptable session used by the driver tests

use async_trait::async_trait;
use edgelink_session::{
    CommandRequest, ConnectOptions, Connector, EventSender, ForwardOptions, Forwarder, Labels,
    RemoteCommand, Session, SessionError, SessionEvent, SessionResult, Tunnel,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Shared knobs and observations for one mock session
#[derive(Debug, Default)]
pub struct MockState {
    events: Mutex<Option<EventSender>>,
    connects: AtomicUsize,
    fail_connect: AtomicBool,
    fail_forward: AtomicBool,
    fail_close: AtomicBool,
    pooling: AtomicBool,
    close_delay: Mutex<Duration>,
    session_closed: AtomicBool,
    forward_options: Mutex<Vec<ForwardOptions>>,
    forwarders: Mutex<Vec<String>>,
    closed_forwarders: Mutex<Vec<String>>,
    tunnels: Mutex<Vec<(String, mpsc::Sender<DuplexStream>)>>,
    closed_tunnels: Mutex<Vec<String>>,
    accept_failures: AtomicUsize,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_forward(&self, fail: bool) {
        self.fail_forward.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Pooling flag reported by forwarders opened from now on
    pub fn set_pooling(&self, pooling: bool) {
        self.pooling.store(pooling, Ordering::SeqCst);
    }

    /// How long every close takes from now on
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = delay;
    }

    /// Make the next `count` tunnel accepts fail
    pub fn fail_next_accepts(&self, count: usize) {
        self.accept_failures.store(count, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn session_closed(&self) -> bool {
        self.session_closed.load(Ordering::SeqCst)
    }

    pub fn last_forward_options(&self) -> Option<ForwardOptions> {
        self.forward_options.lock().unwrap().last().cloned()
    }

    pub fn forwarder_ids(&self) -> Vec<String> {
        self.forwarders.lock().unwrap().clone()
    }

    pub fn closed_forwarders(&self) -> Vec<String> {
        self.closed_forwarders.lock().unwrap().clone()
    }

    pub fn tunnel_ids(&self) -> Vec<String> {
        self.tunnels
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether every handle to the `index`-th tunnel has been dropped
    pub fn tunnel_released(&self, index: usize) -> bool {
        self.tunnels.lock().unwrap()[index].1.is_closed()
    }

    pub fn closed_tunnels(&self) -> Vec<String> {
        self.closed_tunnels.lock().unwrap().clone()
    }

    /// Push an event into the driver's queue
    pub async fn emit(&self, event: SessionEvent) {
        let events = self
            .events
            .lock()
            .unwrap()
            .clone()
            .expect("session not connected");
        events.send(event).await.expect("event queue closed");
    }

    /// Send a remote command and wait for the driver's answer
    pub async fn command(&self, command: RemoteCommand) -> Result<(), String> {
        let (request, reply) = CommandRequest::new(command);
        self.emit(SessionEvent::Command(request)).await;
        reply
            .await
            .unwrap_or_else(|_| Err("command dropped".to_string()))
    }

    /// Open a remote connection on the `index`-th tunnel; returns the remote end
    pub async fn connect_tunnel(&self, index: usize) -> DuplexStream {
        let sender = self.tunnels.lock().unwrap()[index].1.clone();
        let (remote, local) = tokio::io::duplex(64 * 1024);
        sender.send(local).await.expect("tunnel dropped");
        remote
    }

    fn close_delay(&self) -> Duration {
        *self.close_delay.lock().unwrap()
    }
}

#[derive(Debug)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new(state: Arc<MockState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(
        &self,
        _options: ConnectOptions,
        events: EventSender,
    ) -> SessionResult<Self::Session> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(SessionError::AuthenticationFailed("bad token".to_string()));
        }
        *self.state.events.lock().unwrap() = Some(events);
        Ok(MockSession {
            state: self.state.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MockSession {
    state: Arc<MockState>,
}

#[async_trait]
impl Session for MockSession {
    type Forwarder = MockForwarder;
    type Tunnel = MockTunnel;

    async fn forward(&self, options: ForwardOptions) -> SessionResult<Self::Forwarder> {
        if self.state.fail_forward.load(Ordering::SeqCst) {
            return Err(SessionError::Remote("endpoint already exists".to_string()));
        }

        let mut forwarders = self.state.forwarders.lock().unwrap();
        let id = format!("fwd_{}", forwarders.len());
        forwarders.push(id.clone());
        self.state.forward_options.lock().unwrap().push(options.clone());

        Ok(MockForwarder {
            url: format!("https://{}.mock.edge", id),
            id,
            pooling: self.state.pooling.load(Ordering::SeqCst),
            options,
            closed: AtomicBool::new(false),
            state: self.state.clone(),
        })
    }

    async fn open_tunnel(&self, labels: Labels) -> SessionResult<Self::Tunnel> {
        let (tx, rx) = mpsc::channel(8);
        let mut tunnels = self.state.tunnels.lock().unwrap();
        let id = format!("tun_{}", tunnels.len());
        tunnels.push((id.clone(), tx));

        Ok(MockTunnel {
            url: format!("tcp://{}.mock.edge:1", id),
            id,
            labels,
            incoming: tokio::sync::Mutex::new(rx),
            stop: CancellationToken::new(),
            state: self.state.clone(),
        })
    }

    async fn close(&self) -> SessionResult<()> {
        self.state.session_closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockForwarder {
    id: String,
    url: String,
    pooling: bool,
    options: ForwardOptions,
    closed: AtomicBool,
    state: Arc<MockState>,
}

#[async_trait]
impl Forwarder for MockForwarder {
    fn id(&self) -> &str {
        &self.id
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn pooling_enabled(&self) -> bool {
        self.pooling
    }

    fn bindings(&self) -> &[String] {
        &self.options.bindings
    }

    fn traffic_policy(&self) -> Option<&str> {
        self.options.traffic_policy.as_deref()
    }

    fn metadata(&self) -> &str {
        &self.options.metadata
    }

    async fn close(&self) -> SessionResult<()> {
        let delay = self.state.close_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.session_closed() {
            return Err(SessionError::Closed);
        }
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(SessionError::Remote("close failed".to_string()));
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        self.state
            .closed_forwarders
            .lock()
            .unwrap()
            .push(self.id.clone());
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockTunnel {
    id: String,
    url: String,
    labels: Labels,
    incoming: tokio::sync::Mutex<mpsc::Receiver<DuplexStream>>,
    stop: CancellationToken,
    state: Arc<MockState>,
}

#[async_trait]
impl Tunnel for MockTunnel {
    type Conn = DuplexStream;

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
        if self.stop.is_cancelled() {
            return Err(SessionError::Closed);
        }
        let failed = self
            .state
            .accept_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SessionError::Remote("accept failed".to_string()));
        }

        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.stop.cancelled() => Err(SessionError::Closed),
            conn = incoming.recv() => conn.ok_or(SessionError::Closed),
        }
    }

    async fn close(&self) -> SessionResult<()> {
        let delay = self.state.close_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.stop.is_cancelled() || self.state.session_closed() {
            return Err(SessionError::Closed);
        }
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(SessionError::Remote("close failed".to_string()));
        }
        self.stop.cancel();
        self.state
            .closed_tunnels
            .lock()
            .unwrap()
            .push(self.id.clone());
        Ok(())
    }
}
