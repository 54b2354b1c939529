use crate::error::{HarnessError, Result};
use tokio::net::TcpListener;
use tracing::debug;

pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Binds a TCP listener on loopback. A port of "0" lets the OS pick one.
///
/// Bind failures (address in use, permission, malformed port) come back as
/// [`HarnessError::Bind`] carrying the underlying `io::Error`.
pub async fn open_loopback_listener(port: &str) -> Result<TcpListener> {
    let addr = format!("{}:{}", LOOPBACK_HOST, port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| HarnessError::Bind {
            addr: addr.clone(),
            source,
        })?;
    debug!(requested = %addr, bound = ?listener.local_addr().ok(), "Loopback listener bound");
    Ok(listener)
}

/// The port a listener actually bound, as a decimal string.
pub fn bound_port(listener: &TcpListener) -> Result<String> {
    Ok(listener.local_addr()?.port().to_string())
}
