//! Edgelink Agent - runs the connection drivers against the in-process edge
//!
//! This binary connects the agent and tunnel drivers, applies the endpoints
//! and tunnels declared in a configuration file once, serves health probes,
//! and tears everything down on Ctrl+C or when the edge asks it to stop.

mod config;
mod probes;

use anyhow::{Context, Result};
use clap::Parser;
use config::{load_config_file, ConfigFile, EdgeConfig, EndpointConfig, TunnelConfig};
use edgelink_driver::{AgentDriver, DriverConfig, HealthAggregator, TunnelDriver};
use edgelink_session::local::LocalConnector;
use edgelink_session::{ClientInfo, Session};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Edgelink agent - keeps declared endpoints and tunnels live on the edge
#[derive(Parser, Debug)]
#[command(name = "edgelink-agent")]
#[command(about = "Edgelink agent - keeps declared endpoints and tunnels live on the edge")]
#[command(version)]
#[command(long_about = r#"
Edgelink Agent opens one session for agent endpoints and one for raw tunnels,
creates everything declared in the configuration file, and serves /healthz and
/readyz until it is stopped.

EXAMPLES:
  # Start agent with a config file
  edgelink-agent --config edgelink.yaml

  # Trust the host certificate store and use a specific region
  edgelink-agent --config edgelink.yaml --root-cas host --region eu

ENVIRONMENT VARIABLES:
  EDGELINK_SERVER_ADDR   Edge connect address override
  EDGELINK_ROOT_CAS      Certificate authority trust mode (trusted, host)
  EDGELINK_REGION        Edge region
  EDGELINK_AUTHTOKEN     Authentication token
  EDGELINK_HEALTH_ADDR   Health probe listen address
"#)]
struct Args {
    /// Edge connect address override (e.g., connect.edge.example:443)
    #[arg(long, env = "EDGELINK_SERVER_ADDR")]
    server_addr: Option<String>,

    /// Certificate authority trust mode: trusted or host
    #[arg(long, env = "EDGELINK_ROOT_CAS")]
    root_cas: Option<String>,

    /// Edge region
    #[arg(long, env = "EDGELINK_REGION")]
    region: Option<String>,

    /// Authentication token
    #[arg(long, env = "EDGELINK_AUTHTOKEN", hide_env_values = true)]
    authtoken: Option<String>,

    /// Address to serve /healthz and /readyz on
    #[arg(long, env = "EDGELINK_HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Host the in-process edge binds public listeners on
    #[arg(long, default_value = "127.0.0.1")]
    bind_host: String,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Merge CLI args with the config file, giving precedence to CLI args
fn build_driver_config(args: &Args, edge: &EdgeConfig) -> Result<DriverConfig> {
    let authtoken = match (&args.authtoken, &edge.authtoken_env) {
        (Some(token), _) => Some(token.clone()),
        (None, Some(env_var)) => Some(
            std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?,
        ),
        (None, None) => None,
    };

    let defaults = DriverConfig::default();
    Ok(DriverConfig {
        server_addr: args.server_addr.clone().or_else(|| edge.server_addr.clone()),
        root_cas: args
            .root_cas
            .clone()
            .or_else(|| edge.root_cas.clone())
            .unwrap_or(defaults.root_cas),
        region: args.region.clone().or_else(|| edge.region.clone()),
        authtoken,
        client_info: vec![ClientInfo {
            name: "edgelink-agent".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            comments: None,
        }],
        stop_disconnect_delay: defaults.stop_disconnect_delay,
    })
}

async fn apply_endpoints<S: Session>(
    driver: &AgentDriver<S>,
    endpoints: &BTreeMap<String, EndpointConfig>,
) {
    for (name, endpoint) in endpoints {
        let client_certs = match endpoint
            .client_certificates
            .iter()
            .map(|files| files.load())
            .collect::<Result<Vec<_>>>()
        {
            Ok(certs) => certs,
            Err(e) => {
                let reason = format!("{:#}", e);
                error!(name = %name, error = %reason, "Failed to load client certificates");
                continue;
            }
        };

        match driver
            .create_agent_endpoint(
                name,
                &endpoint.spec,
                endpoint.traffic_policy.as_deref(),
                &client_certs,
            )
            .await
        {
            Ok(result) => info!(name = %name, url = %result.url, "Endpoint ready"),
            Err(e) => error!(name = %name, error = %e, "Failed to create endpoint"),
        }
    }
}

async fn apply_tunnels<S: Session>(driver: &TunnelDriver<S>, tunnels: &BTreeMap<String, TunnelConfig>) {
    for (name, tunnel) in tunnels {
        if let Err(e) = driver
            .create_tunnel(name, tunnel.labels.clone(), &tunnel.destination)
            .await
        {
            error!(name = %name, error = %e, "Failed to create tunnel");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Setup logging first
    setup_logging(&args.log_level)?;

    info!("Edgelink agent starting...");

    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let config =
        build_driver_config(&args, &file.edge).context("Failed to build driver configuration")?;
    let connector = LocalConnector::new().with_bind_host(args.bind_host.clone());
    let health = Arc::new(HealthAggregator::new());

    let agent = AgentDriver::connect(&connector, config.clone())
        .await
        .context("Failed to start agent driver")?;
    health.register("agent-driver", agent.health());

    let tunnels = if file.tunnels.is_empty() {
        None
    } else {
        Some(
            TunnelDriver::connect(&connector, config.clone())
                .await
                .context("Failed to start tunnel driver")?,
        )
    };

    apply_endpoints(&agent, &file.endpoints).await;
    if let Some(driver) = &tunnels {
        apply_tunnels(driver, &file.tunnels).await;
    }

    let probes = tokio::spawn(probes::serve(args.health_addr, health.clone()));
    let shutdown = agent.shutdown_token();

    let remote_stop = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            false
        }
        _ = shutdown.cancelled() => {
            info!("Edge requested shutdown");
            true
        }
        result = probes => {
            match result {
                Ok(Ok(())) => info!("Health probe server stopped"),
                Ok(Err(e)) => {
                    error!("Health probe error: {:#}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("Health probe task panicked: {}", e);
                    return Err(e.into());
                }
            }
            false
        }
    };

    if remote_stop {
        // The driver disconnects on its own once the acknowledgement is out.
        tokio::time::sleep(config.stop_disconnect_delay).await;
    } else {
        for name in file.endpoints.keys() {
            if let Err(e) = agent.delete_agent_endpoint(name).await {
                warn!(name = %name, error = %e, "Failed to delete endpoint");
            }
        }
        if let Err(e) = agent.shutdown().await {
            warn!(error = %e, "Failed to close agent session");
        }
    }

    if let Some(driver) = &tunnels {
        for name in file.tunnels.keys() {
            if let Err(e) = driver.delete_tunnel(name).await {
                warn!(name = %name, error = %e, "Failed to delete tunnel");
            }
        }
        if let Err(e) = driver.shutdown().await {
            warn!(error = %e, "Failed to close tunnel session");
        }
    }

    info!("Agent stopped");
    Ok(())
}
