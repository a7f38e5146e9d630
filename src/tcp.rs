//! Kernel-level TCP socket tuning.
//!
//! The connection types that can be tuned implement [`TcpTuning`] explicitly;
//! callers apply the configured options through the trait instead of probing
//! concrete types.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::config::AdvancedConfig;

/// Socket options the tunnel cares about. All setters are best-effort: a
/// refusing kernel is not a reason to drop a working connection.
pub trait TcpTuning {
    fn set_nodelay(&self, on: bool);
    fn set_keepalive(&self, period: Duration);
    fn set_rx_buf(&self, bytes: usize);
    fn set_tx_buf(&self, bytes: usize);
}

impl TcpTuning for TcpStream {
    fn set_nodelay(&self, on: bool) {
        let _ = TcpStream::set_nodelay(self, on);
    }

    fn set_keepalive(&self, period: Duration) {
        let keepalive = TcpKeepalive::new().with_time(period);
        let _ = SockRef::from(self).set_tcp_keepalive(&keepalive);
    }

    fn set_rx_buf(&self, bytes: usize) {
        let _ = SockRef::from(self).set_recv_buffer_size(bytes);
    }

    fn set_tx_buf(&self, bytes: usize) {
        let _ = SockRef::from(self).set_send_buffer_size(bytes);
    }
}

/// Applies the `advanced` config section to a connection.
pub fn apply(conn: &impl TcpTuning, advanced: &AdvancedConfig) {
    conn.set_nodelay(advanced.tcp_nodelay);
    if advanced.tcp_keepalive > 0 {
        conn.set_keepalive(Duration::from_secs(advanced.tcp_keepalive));
    }
    if advanced.tcp_read_buffer > 0 {
        conn.set_rx_buf(advanced.tcp_read_buffer);
    }
    if advanced.tcp_write_buffer > 0 {
        conn.set_tx_buf(advanced.tcp_write_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_apply_on_live_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();

        let advanced = AdvancedConfig {
            tcp_nodelay: true,
            tcp_keepalive: 15,
            tcp_read_buffer: 256 * 1024,
            tcp_write_buffer: 256 * 1024,
        };
        apply(&client, &advanced);
        assert!(client.nodelay().unwrap());
    }
}
