use anyhow::{Context, Result};
use edgelink_driver::EndpointSpec;
use edgelink_session::{ClientCertificate, Labels};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Edge session configuration
    #[serde(default)]
    pub edge: EdgeConfig,

    /// Agent endpoints keyed by name
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointConfig>,

    /// Raw tunnels keyed by name
    #[serde(default)]
    pub tunnels: BTreeMap<String, TunnelConfig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Edge connect address override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_addr: Option<String>,

    /// Certificate authority trust mode ("trusted" or "host")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cas: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Environment variable name for the auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authtoken_env: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(flatten)]
    pub spec: EndpointSpec,

    /// Inline traffic policy document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_policy: Option<String>,

    /// Client certificates presented to the upstream
    #[serde(default)]
    pub client_certificates: Vec<CertificateFiles>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CertificateFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CertificateFiles {
    pub fn load(&self) -> Result<ClientCertificate> {
        let cert_chain = fs::read(&self.cert)
            .with_context(|| format!("Failed to read certificate: {}", self.cert.display()))?;
        let private_key = fs::read(&self.key)
            .with_context(|| format!("Failed to read private key: {}", self.key.display()))?;

        Ok(ClientCertificate {
            cert_chain,
            private_key,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub labels: Labels,

    /// In-cluster destination (host:port)
    pub destination: String,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn parse_config(contents: &str) -> Result<ConfigFile> {
    let config: ConfigFile = serde_yaml::from_str(contents)?;

    for (name, tunnel) in &config.tunnels {
        validate_address(&tunnel.destination, name)?;
    }

    Ok(config)
}

/// Validate address format (should be host:port)
pub fn validate_address(addr: &str, name: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "Invalid destination for '{}': '{}' (expected format: host:port)",
            name,
            addr
        );
    };

    if host.is_empty() {
        anyhow::bail!(
            "Invalid destination for '{}': '{}' (host cannot be empty)",
            name,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in destination for '{}': {}", name, addr))?;

    Ok(())
}
