//! Connection helpers shared by nodes and switches.

use std::time::Duration;

use tokio::net::TcpStream;

/// Connect to a loopback port, retrying until the listener is up.
///
/// Startup order is not coordinated: switches and nodes all launch at
/// once and dial their parent immediately, so refused connections during
/// bring-up are expected.
pub async fn connect_retry(port: u16, retry_ms: u64) -> TcpStream {
    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => return stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(retry_ms)).await,
        }
    }
}
