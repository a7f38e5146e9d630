//! First-write fragmentation (anti-DPI).
//!
//! DPI boxes reconstruct the SNI / handshake from the first packet of a flow.
//! With TCP_NODELAY set, splitting the first large write into two segments
//! separated by a millisecond-scale delay leaves the inspector with a partial
//! record it cannot parse, while the server reassembles transparently.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::Sleep;

use crate::obfs::secure_rand_range;

/// Fragmentation knobs. Sizes are bytes, delays milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentConfig {
    pub enabled: bool,
    pub min_size: usize,
    pub max_size: usize,
    pub min_delay: u64,
    pub max_delay: u64,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_size: 64,
            max_size: 191,
            min_delay: 1,
            max_delay: 2,
        }
    }
}

impl FragmentConfig {
    pub fn apply_defaults(&mut self) {
        let d = Self::default();
        if self.min_size == 0 {
            self.min_size = d.min_size;
        }
        if self.max_size == 0 {
            self.max_size = d.max_size;
        }
        if self.min_delay == 0 {
            self.min_delay = d.min_delay;
        }
        if self.max_delay == 0 {
            self.max_delay = d.max_delay;
        }
    }
}

/// Wraps a connection so the first oversized write is delivered as two
/// segments with a short random delay between them. Everything afterwards
/// passes straight through.
pub struct FragmentedStream<S> {
    inner: S,
    fragment_size: usize,
    delay: Duration,
    fragmented: bool,
    gate: Option<Pin<Box<Sleep>>>,
}

impl<S> FragmentedStream<S> {
    /// Samples the fragment size and inter-segment delay from `cfg`.
    pub fn new(inner: S, cfg: &FragmentConfig) -> Self {
        let fragment_size = secure_rand_range(cfg.min_size, cfg.max_size);
        let delay_ms = secure_rand_range(cfg.min_delay as usize, cfg.max_delay as usize);
        Self {
            inner,
            fragment_size,
            delay: Duration::from_millis(delay_ms as u64),
            fragmented: false,
            gate: None,
        }
    }

    #[cfg(test)]
    fn with_split(inner: S, fragment_size: usize, delay: Duration) -> Self {
        Self {
            inner,
            fragment_size,
            delay,
            fragmented: false,
            gate: None,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // The inter-segment delay gates the write that follows the first
        // fragment, forcing it into its own TCP segment.
        if let Some(gate) = &mut this.gate {
            ready!(gate.as_mut().poll(cx));
            this.gate = None;
        }

        if !this.fragmented {
            if buf.len() > this.fragment_size {
                let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..this.fragment_size]))?;
                this.fragmented = true;
                this.gate = Some(Box::pin(tokio::time::sleep(this.delay)));
                return Poll::Ready(Ok(n));
            }
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
            this.fragmented = true;
            return Poll::Ready(Ok(n));
        }

        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Dials `addr` with TCP_NODELAY set on the socket *before* connect, using a
/// nonblocking connect bounded by `timeout`. Falls back to a standard connect
/// (NODELAY applied afterwards) if the pre-connect path fails.
pub async fn dial_tcp(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err: Option<io::Error> = None;
    let addrs: Vec<SocketAddr> = lookup_host(addr).await?.collect();

    for sa in &addrs {
        match tokio::time::timeout(timeout, connect_nodelay_first(*sa)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => last_err = Some(io::ErrorKind::TimedOut.into()),
        }
    }

    // Standard connect as a fallback; NODELAY after the fact still keeps the
    // fragments in separate segments.
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).ok();
            Ok(stream)
        }
        Ok(Err(e)) => Err(last_err.unwrap_or(e)),
        Err(_) => Err(last_err.unwrap_or_else(|| io::ErrorKind::TimedOut.into())),
    }
}

async fn connect_nodelay_first(sa: SocketAddr) -> io::Result<TcpStream> {
    let domain = Domain::for_address(sa);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;

    match socket.connect(&SockAddr::from(sa)) {
        Ok(()) => {}
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock
                || e.raw_os_error() == Some(libc_einprogress()) => {}
        Err(e) => return Err(e),
    }

    let stream = TcpStream::from_std(socket.into())?;
    stream.writable().await?;
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    // Connect may report readiness on refusal without a queued error; a
    // peer_addr probe distinguishes the two.
    stream.peer_addr()?;
    Ok(stream)
}

#[cfg(unix)]
const fn libc_einprogress() -> i32 {
    115 // EINPROGRESS on Linux; harmless mismatch elsewhere (kind check first)
}

#[cfg(not(unix))]
const fn libc_einprogress() -> i32 {
    -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_first_large_write_splits() {
        let (a, mut b) = duplex(64 * 1024);
        let mut frag = FragmentedStream::with_split(a, 100, Duration::from_millis(1));

        let data: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        let n = frag.write(&data).await.unwrap();
        assert_eq!(n, 100);
        let n2 = frag.write(&data[100..]).await.unwrap();
        assert_eq!(n2, 400);

        let mut got = vec![0u8; 500];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn test_write_all_reassembles() {
        let (a, mut b) = duplex(64 * 1024);
        let mut frag = FragmentedStream::with_split(a, 64, Duration::from_millis(1));

        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        frag.write_all(&data).await.unwrap();

        let mut got = vec![0u8; 1000];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn test_small_first_write_passes_through() {
        let (a, mut b) = duplex(64 * 1024);
        let mut frag = FragmentedStream::with_split(a, 100, Duration::from_millis(1));

        assert_eq!(frag.write(&[7u8; 50]).await.unwrap(), 50);
        // Fragmentation is one-shot: a later large write is untouched.
        assert_eq!(frag.write(&[9u8; 400]).await.unwrap(), 400);

        let mut got = vec![0u8; 450];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got[..50], &[7u8; 50][..]);
        assert_eq!(&got[50..], &[9u8; 400][..]);
    }

    #[tokio::test]
    async fn test_dial_timeout() {
        // RFC 5737 TEST-NET-1 address; nothing should be listening.
        let err = dial_tcp("192.0.2.1:9", Duration::from_millis(200))
            .await
            .unwrap_err();
        let _ = err; // kind varies by platform (timeout vs unreachable)
    }
}
