use crate::error::DriverError;
use edgelink_session::{ClientInfo, ConnectOptions, RootCas};
use std::time::Duration;

/// Environment variable the bearer credential is read from when none is configured
pub const AUTHTOKEN_ENV: &str = "EDGELINK_AUTHTOKEN";

/// Delay between acknowledging a remote stop/restart and disconnecting,
/// so the acknowledgement reaches the edge first
pub const DEFAULT_STOP_DISCONNECT_DELAY: Duration = Duration::from_secs(5);

/// Configuration for establishing a driver's session
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Edge connect address override (host:port)
    pub server_addr: Option<String>,

    /// Certificate authority trust mode: "trusted" or "host"
    pub root_cas: String,

    /// Preferred edge region
    pub region: Option<String>,

    /// Bearer credential; falls back to `EDGELINK_AUTHTOKEN`
    pub authtoken: Option<String>,

    /// Client identity strings reported to the edge
    pub client_info: Vec<ClientInfo>,

    pub stop_disconnect_delay: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            server_addr: None,
            root_cas: RootCas::Trusted.to_string(),
            region: None,
            authtoken: None,
            client_info: vec![ClientInfo {
                name: "edgelink-driver".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                comments: None,
            }],
            stop_disconnect_delay: DEFAULT_STOP_DISCONNECT_DELAY,
        }
    }
}

impl DriverConfig {
    /// Validate the configuration and build the session connect options
    pub fn connect_options(&self) -> Result<ConnectOptions, DriverError> {
        let root_cas = self
            .root_cas
            .parse::<RootCas>()
            .map_err(|e| DriverError::Config(e.to_string()))?;

        let authtoken = self.authtoken.clone().or_else(|| {
            std::env::var(AUTHTOKEN_ENV)
                .ok()
                .filter(|token| !token.is_empty())
        });

        Ok(ConnectOptions {
            server_addr: self.server_addr.clone(),
            root_cas,
            region: self.region.clone(),
            authtoken,
            client_info: self.client_info.clone(),
        })
    }
}
