use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::error::Error;
use crate::types::DeviceAddress;

/// Check that the device accepts connections on its command port.
///
/// Opens and immediately drops a TCP connection; no request is sent.
/// Returns the connect latency.
pub async fn probe(address: &DeviceAddress, timeout: Duration) -> Result<Duration, Error> {
    let endpoint = address.command_endpoint();
    let started = Instant::now();

    let stream = tokio::time::timeout(timeout, TcpStream::connect(&endpoint))
        .await
        .map_err(|_| Error::connection(&endpoint, "connect timed out"))?
        .map_err(|e| Error::connection(&endpoint, e))?;
    let elapsed = started.elapsed();
    drop(stream);

    tracing::debug!(device = %address, elapsed_ms = elapsed.as_millis(), "probe succeeded");
    Ok(elapsed)
}
