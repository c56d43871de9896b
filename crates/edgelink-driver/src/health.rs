//! Latched health state
//!
//! The agent driver publishes its readiness and liveness into two
//! `tokio::sync::watch` channels. [`HealthBridge`] drains each channel on its
//! own task into a latched slot that probes can read synchronously. When a
//! channel's sender goes away the slot keeps the last value it saw.
//!
//! [`HealthAggregator`] combines any number of named checks; it is an explicit
//! value handed to whoever registers or queries checks.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::watch;

/// Why a component is not ready or not alive
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthError {
    #[error("session is connecting to the edge")]
    Connecting,

    #[error("session disconnected: {0}")]
    Disconnected(String),

    #[error("remote {0} requested, agent is shutting down")]
    Stopping(String),

    #[error("{0}")]
    Unhealthy(String),
}

/// Sending half of one health signal
pub type HealthSender = watch::Sender<Option<HealthError>>;

/// Receiving half of one health signal
pub type HealthReceiver = watch::Receiver<Option<HealthError>>;

/// A component that can answer readiness and liveness probes
pub trait HealthCheck: Send + Sync {
    fn ready(&self) -> Result<(), HealthError>;

    fn alive(&self) -> Result<(), HealthError>;
}

type Slot = Arc<Mutex<Option<HealthError>>>;

fn read_slot(slot: &Slot) -> Result<(), HealthError> {
    match slot.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
        Some(err) => Err(err.clone()),
        None => Ok(()),
    }
}

async fn drain(mut source: HealthReceiver, slot: Slot) {
    loop {
        let latest = source.borrow_and_update().clone();
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = latest;

        if source.changed().await.is_err() {
            break;
        }
    }

    // The sender is gone; latch whatever it published last.
    let last = source.borrow().clone();
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = last;
}

/// Latched ready/alive state fed by two health signals
#[derive(Debug, Clone)]
pub struct HealthBridge {
    ready: Slot,
    alive: Slot,
}

impl HealthBridge {
    /// Start draining both sources. Must be called inside a Tokio runtime.
    pub fn spawn(ready: HealthReceiver, alive: HealthReceiver) -> Self {
        let ready_slot: Slot = Arc::new(Mutex::new(ready.borrow().clone()));
        let alive_slot: Slot = Arc::new(Mutex::new(alive.borrow().clone()));

        tokio::spawn(drain(ready, ready_slot.clone()));
        tokio::spawn(drain(alive, alive_slot.clone()));

        Self {
            ready: ready_slot,
            alive: alive_slot,
        }
    }

    pub fn ready(&self) -> Result<(), HealthError> {
        read_slot(&self.ready)
    }

    pub fn alive(&self) -> Result<(), HealthError> {
        read_slot(&self.alive)
    }
}

impl HealthCheck for HealthBridge {
    fn ready(&self) -> Result<(), HealthError> {
        HealthBridge::ready(self)
    }

    fn alive(&self) -> Result<(), HealthError> {
        HealthBridge::alive(self)
    }
}

/// Named collection of health checks
#[derive(Default)]
pub struct HealthAggregator {
    checks: RwLock<Vec<(String, Arc<dyn HealthCheck>)>>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a check; a later check with the same name replaces the earlier one
    pub fn register(&self, name: impl Into<String>, check: Arc<dyn HealthCheck>) {
        let name = name.into();
        let mut checks = self.checks.write().unwrap_or_else(PoisonError::into_inner);
        checks.retain(|(existing, _)| *existing != name);

        tracing::debug!(check = %name, "Registered health check");
        checks.push((name, check));
    }

    /// First failing readiness check, if any
    pub fn ready(&self) -> Result<(), HealthError> {
        self.first_failure(|check| check.ready())
    }

    /// First failing liveness check, if any
    pub fn alive(&self) -> Result<(), HealthError> {
        self.first_failure(|check| check.alive())
    }

    fn first_failure(
        &self,
        probe: impl Fn(&dyn HealthCheck) -> Result<(), HealthError>,
    ) -> Result<(), HealthError> {
        let checks = self.checks.read().unwrap_or_else(PoisonError::into_inner);
        for (name, check) in checks.iter() {
            if let Err(err) = probe(check.as_ref()) {
                tracing::debug!(check = %name, error = %err, "Health check failing");
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn eventually<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_bridge_reports_latest_values() {
        let (ready_tx, ready_rx) = watch::channel(Some(HealthError::Connecting));
        let (alive_tx, alive_rx) = watch::channel(None);
        let bridge = HealthBridge::spawn(ready_rx, alive_rx);

        assert_eq!(bridge.ready(), Err(HealthError::Connecting));
        assert_eq!(bridge.alive(), Ok(()));

        ready_tx.send_replace(None);
        eventually(|| bridge.ready().is_ok()).await;

        alive_tx.send_replace(Some(HealthError::Stopping("stop".into())));
        eventually(|| bridge.alive().is_err()).await;
        assert_eq!(bridge.ready(), Ok(()));
    }

    #[tokio::test]
    async fn test_bridge_latches_after_sources_close() {
        let (ready_tx, ready_rx) = watch::channel(None);
        let (alive_tx, alive_rx) = watch::channel(None);
        let bridge = HealthBridge::spawn(ready_rx, alive_rx);

        let e1 = HealthError::Unhealthy("E1".to_string());
        ready_tx.send_replace(Some(e1.clone()));
        alive_tx.send_replace(None);
        eventually(|| bridge.ready().is_err()).await;
        assert_eq!(bridge.ready(), Err(e1.clone()));
        assert_eq!(bridge.alive(), Ok(()));

        drop(ready_tx);
        drop(alive_tx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(bridge.ready(), Err(e1));
        assert_eq!(bridge.alive(), Ok(()));
    }

    #[tokio::test]
    async fn test_bridge_keeps_only_latest_of_a_burst() {
        let (ready_tx, ready_rx) = watch::channel(None);
        let (_alive_tx, alive_rx) = watch::channel(None);
        let bridge = HealthBridge::spawn(ready_rx, alive_rx);

        for i in 0..50 {
            ready_tx.send_replace(Some(HealthError::Disconnected(i.to_string())));
        }
        drop(ready_tx);

        eventually(|| bridge.ready() == Err(HealthError::Disconnected("49".into()))).await;
    }

    struct Fixed(Result<(), HealthError>);

    impl HealthCheck for Fixed {
        fn ready(&self) -> Result<(), HealthError> {
            self.0.clone()
        }

        fn alive(&self) -> Result<(), HealthError> {
            Ok(())
        }
    }

    #[test]
    fn test_aggregator_first_failure() {
        let aggregator = HealthAggregator::new();
        assert!(aggregator.ready().is_ok());

        aggregator.register("good", Arc::new(Fixed(Ok(()))));
        aggregator.register(
            "bad",
            Arc::new(Fixed(Err(HealthError::Unhealthy("down".into())))),
        );

        assert_eq!(
            aggregator.ready(),
            Err(HealthError::Unhealthy("down".into()))
        );
        assert!(aggregator.alive().is_ok());

        aggregator.register("bad", Arc::new(Fixed(Ok(()))));
        assert!(aggregator.ready().is_ok());
    }

    #[test]
    fn test_aggregators_are_independent() {
        let first = HealthAggregator::new();
        let second = HealthAggregator::new();

        first.register(
            "agent",
            Arc::new(Fixed(Err(HealthError::Connecting))),
        );
        assert!(first.ready().is_err());
        assert!(second.ready().is_ok());
    }
}
