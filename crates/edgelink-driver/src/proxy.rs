use crate::error::DriverError;
use edgelink_session::{SessionError, Tunnel};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Pause after a failed accept before asking the tunnel again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accept connections from `tunnel` until it is closed or `stop` fires,
/// proxying each one to `destination` on its own task.
///
/// Accept errors other than [`SessionError::Closed`] are logged and retried
/// without limit.
pub(crate) async fn run_proxy<T: Tunnel>(
    tunnel: Arc<T>,
    destination: String,
    stop: CancellationToken,
) {
    tracing::info!(
        tunnel_id = %tunnel.id(),
        destination = %destination,
        "Tunnel proxy started"
    );

    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = tunnel.accept() => accepted,
        };

        match accepted {
            Ok(conn) => {
                let tunnel_id = tunnel.id().to_string();
                let destination = destination.clone();
                tokio::spawn(async move {
                    if let Err(e) = proxy_connection(conn, &destination).await {
                        tracing::warn!(
                            tunnel_id = %tunnel_id,
                            destination = %destination,
                            error = %e,
                            "Tunnel connection failed"
                        );
                    }
                });
            }
            Err(SessionError::Closed) => {
                tracing::debug!(tunnel_id = %tunnel.id(), "Tunnel closed");
                break;
            }
            Err(e) => {
                tracing::error!(
                    tunnel_id = %tunnel.id(),
                    error = %e,
                    "Tunnel accept error"
                );
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }

    tracing::info!(tunnel_id = %tunnel.id(), "Tunnel proxy stopped");
}

/// Proxy one tunnel connection to `destination` over TCP.
///
/// Both directions are copied concurrently; as soon as either finishes the
/// tunnel connection is shut down and the destination socket dropped.
pub(crate) async fn proxy_connection<C>(conn: C, destination: &str) -> Result<(), DriverError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let server = TcpStream::connect(destination).await.map_err(|e| {
        DriverError::DestinationUnreachable {
            address: destination.to_string(),
            source: e,
        }
    })?;

    tracing::debug!(destination = %destination, "Connected to destination, starting proxy");

    let (mut client_read, mut client_write) = tokio::io::split(conn);
    let (mut server_read, mut server_write) = server.into_split();

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut server_write) => {
            if let Err(e) = result {
                tracing::debug!(destination = %destination, error = %e, "Error proxying tunnel -> destination");
            }
        }
        result = tokio::io::copy(&mut server_read, &mut client_write) => {
            if let Err(e) = result {
                tracing::debug!(destination = %destination, error = %e, "Error proxying destination -> tunnel");
            }
        }
    }

    let mut conn = client_read.unsplit(client_write);
    let _ = conn.shutdown().await;
    drop(conn);
    drop(server_write);
    drop(server_read);

    tracing::debug!(destination = %destination, "Tunnel connection closed");
    Ok(())
}
