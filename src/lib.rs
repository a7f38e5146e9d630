//! PicoTun: obfuscating reverse-tunnel data plane.
//!
//! A client behind a restrictive network keeps a pool of long-lived,
//! multiplexed, encrypted transports open to a server; the server exposes
//! TCP/UDP ports and pushes every accepted connection back through the
//! tunnel, where the client dials the real target. On the wire the opening
//! exchange looks like a browser WebSocket upgrade; everything after it is
//! per-frame AES-256-GCM with size-hiding padding and first-write
//! fragmentation.
//!
//! ## Pipeline
//!
//! ```text
//! client: dial -> fragment -> mimic -> encrypt -> (snappy) -> mux
//! server: accept -> validate -> 101 -> encrypt -> (snappy) -> mux
//! ```
//!
//! Forward streams are client-opened; reverse streams are server-opened.
//! Every logical stream starts with a `[2B len][scheme://host:port]` target
//! header.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use picotun::{Config, TunnelServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("server.toml".as_ref())?;
//!     let server = TunnelServer::new(config);
//!     server.serve(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod comp;
pub mod config;
pub mod crypto_conn;
pub mod forward;
pub mod fragment;
pub mod mimic;
pub mod mux;
pub mod obfs;
pub mod pool;
pub mod relay;
pub mod server;
pub mod stats;
pub mod tcp;
pub mod util;

pub use client::TunnelClient;
pub use comp::CompressedStream;
pub use config::{Config, Mode, PathConfig};
pub use crypto_conn::EncryptedConn;
pub use fragment::{dial_tcp, FragmentConfig, FragmentedStream};
pub use mimic::MimicConfig;
pub use mux::{MuxConfig, MuxSession, MuxStream};
pub use obfs::ObfsConfig;
pub use server::{SessionRegistry, TunnelServer};
pub use stats::{Stats, GLOBAL_STATS};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any byte stream usable as a tunnel transport layer.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

/// Type-erased transport; the session pipeline composes wrappers at runtime.
pub type BoxedTransport = Box<dyn TransportStream>;

/// Tunnel error types.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Fatal misconfiguration, detected before the data plane starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The mimicry handshake was rejected or malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A peer violated the wire protocol; the connection must drop.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No session is currently registered / pooled.
    #[error("no active sessions")]
    NoLiveSession,

    /// Every candidate session failed to open a stream.
    #[error("all sessions exhausted")]
    AllSessionsExhausted,

    /// The mux session closed underneath an operation.
    #[error("session closed")]
    SessionClosed,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::Config("bad psk".to_string());
        assert_eq!(err.to_string(), "invalid configuration: bad psk");
        assert_eq!(TunnelError::NoLiveSession.to_string(), "no active sessions");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: TunnelError = io.into();
        assert!(matches!(err, TunnelError::Io(_)));
    }
}
