use edgelink_session::SessionError;
use thiserror::Error;

/// Errors returned by the connection drivers
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Invalid driver configuration: {0}")]
    Config(String),

    #[error("Failed to connect to the edge: {0}")]
    Connect(#[source] SessionError),

    #[error("Driver is shutting down")]
    ShuttingDown,

    #[error("Invalid upstream URL '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Failed to connect to destination {address}: {source}")]
    DestinationUnreachable {
        address: String,
        source: std::io::Error,
    },
}
