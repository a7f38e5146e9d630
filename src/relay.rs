//! Bidirectional relay and stream target-header helpers.
//!
//! Byte counts are recorded per read while the transfer runs, not on
//! completion, so the stats surface always reflects live throughput.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::mux::MuxStream;
use crate::pool::PooledBuf;
use crate::stats::GLOBAL_STATS;
use crate::util::split_target;

/// Bounds on the stream target header (`[2B BE len][target]`).
pub const MAX_TARGET_LEN: usize = 4096;

/// Deadline for reading a stream's target header.
pub const TARGET_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for dialing the target a stream names.
pub const TARGET_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes the `[2B BE len][target]` header that opens every logical stream.
pub async fn send_target<W: AsyncWrite + Unpin>(w: &mut W, target: &str) -> io::Result<()> {
    let bytes = target.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_TARGET_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("target length {} out of range", bytes.len()),
        ));
    }
    let mut frame = Vec::with_capacity(2 + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    frame.extend_from_slice(bytes);
    w.write_all(&frame).await?;
    w.flush().await
}

/// Reads and validates a stream target header.
pub async fn read_target<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<String> {
    let mut hdr = [0u8; 2];
    r.read_exact(&mut hdr).await?;
    let len = u16::from_be_bytes(hdr) as usize;
    if len == 0 || len > MAX_TARGET_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("target length {} out of range", len),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF8 target"))
}

/// Copies `r` into `w` through a pooled buffer, bumping `counter` after each
/// read. Sends a shutdown downstream at EOF so half-closes propagate.
async fn copy_metered<R, W>(mut r: R, mut w: W, counter: &AtomicU64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut pooled = PooledBuf::take();
    let buf = pooled.as_read_buf();
    let mut total = 0u64;
    loop {
        let n = r.read(buf).await?;
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        total += n as u64;
    }
    let _ = w.shutdown().await;
    Ok(total)
}

/// Bidirectional copy between two byte streams. Returns when either
/// direction finishes; dropping the halves closes both endpoints.
pub async fn relay<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    GLOBAL_STATS.active_conns.fetch_add(1, Ordering::Relaxed);
    GLOBAL_STATS.total_conns.fetch_add(1, Ordering::Relaxed);

    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    let up = copy_metered(ar, bw, &GLOBAL_STATS.bytes_sent);
    let down = copy_metered(br, aw, &GLOBAL_STATS.bytes_recv);
    tokio::pin!(up);
    tokio::pin!(down);
    tokio::select! {
        _ = &mut up => {}
        _ = &mut down => {}
    }

    GLOBAL_STATS.active_conns.fetch_add(-1, Ordering::Relaxed);
}

/// Relays between a mux stream and a connected UDP socket: each chunk read
/// from the stream becomes one datagram and vice versa.
pub async fn relay_stream_udp(stream: MuxStream, udp: UdpSocket) {
    GLOBAL_STATS.active_conns.fetch_add(1, Ordering::Relaxed);
    GLOBAL_STATS.total_conns.fetch_add(1, Ordering::Relaxed);

    let udp = Arc::new(udp);
    let (rd, wr) = tokio::io::split(stream);

    let to_udp = pump_stream_to_udp(rd, Arc::clone(&udp));
    let from_udp = pump_udp_to_stream(udp, wr);
    tokio::pin!(to_udp);
    tokio::pin!(from_udp);
    tokio::select! {
        _ = &mut to_udp => {}
        _ = &mut from_udp => {}
    }

    GLOBAL_STATS.active_conns.fetch_add(-1, Ordering::Relaxed);
}

async fn pump_stream_to_udp(
    mut rd: tokio::io::ReadHalf<MuxStream>,
    udp: Arc<UdpSocket>,
) -> io::Result<()> {
    let mut pooled = PooledBuf::take();
    let buf = pooled.as_read_buf();
    loop {
        let n = rd.read(buf).await?;
        if n == 0 {
            return Ok(());
        }
        udp.send(&buf[..n]).await?;
        GLOBAL_STATS.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }
}

async fn pump_udp_to_stream(
    udp: Arc<UdpSocket>,
    mut wr: tokio::io::WriteHalf<MuxStream>,
) -> io::Result<()> {
    let mut buf = vec![0u8; 65535];
    loop {
        let n = udp.recv(&mut buf).await?;
        wr.write_all(&buf[..n]).await?;
        GLOBAL_STATS.bytes_recv.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Drives one accepted stream end to end: read the target header under its
/// deadline, dial locally, then relay until either side finishes. Invalid
/// headers and failed dials drop the stream silently, as the protocol
/// requires: no feedback channel exists on purpose.
pub async fn serve_target_stream(mut stream: MuxStream, verbose: bool) {
    let target =
        match tokio::time::timeout(TARGET_HEADER_TIMEOUT, read_target(&mut stream)).await {
            Ok(Ok(t)) => t,
            Ok(Err(e)) => {
                if verbose {
                    log::debug!("[STREAM] bad target header: {}", e);
                }
                return;
            }
            Err(_) => {
                if verbose {
                    log::debug!("[STREAM] target header timed out");
                }
                return;
            }
        };

    let (network, addr) = split_target(&target);
    if verbose {
        log::info!("[STREAM] dial {}://{}", network, addr);
    }

    match network {
        "udp" => {
            let udp = match UdpSocket::bind("0.0.0.0:0").await {
                Ok(s) => s,
                Err(_) => return,
            };
            if tokio::time::timeout(TARGET_DIAL_TIMEOUT, udp.connect(addr))
                .await
                .map_or(true, |r| r.is_err())
            {
                if verbose {
                    log::debug!("[STREAM] udp connect failed: {}", addr);
                }
                return;
            }
            relay_stream_udp(stream, udp).await;
        }
        _ => {
            let remote =
                match tokio::time::timeout(TARGET_DIAL_TIMEOUT, TcpStream::connect(addr)).await {
                    Ok(Ok(r)) => r,
                    _ => {
                        if verbose {
                            log::debug!("[STREAM] dial failed: {}", addr);
                        }
                        return;
                    }
                };
            relay(stream, remote).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_target_header_roundtrip() {
        let (mut a, mut b) = duplex(1024);
        send_target(&mut a, "tcp://127.0.0.1:8080").await.unwrap();
        let got = read_target(&mut b).await.unwrap();
        assert_eq!(got, "tcp://127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_target_length_bounds() {
        let (mut a, _b) = duplex(16 * 1024);
        assert!(send_target(&mut a, "").await.is_err());
        let long = "x".repeat(MAX_TARGET_LEN + 1);
        assert!(send_target(&mut a, &long).await.is_err());
        let max = "x".repeat(MAX_TARGET_LEN);
        assert!(send_target(&mut a, &max).await.is_ok());
    }

    #[tokio::test]
    async fn test_read_target_rejects_zero_length() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        assert!(read_target(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_relay_moves_bytes_both_ways() {
        let (a1, a2) = duplex(64 * 1024);
        let (b1, b2) = duplex(64 * 1024);

        let relay_task = tokio::spawn(relay(a2, b1));

        let (mut left, mut right) = (a1, b2);
        left.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong").await.unwrap();
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(left);
        drop(right);
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_counts_bytes() {
        let before = GLOBAL_STATS.bytes_sent.load(Ordering::Relaxed)
            + GLOBAL_STATS.bytes_recv.load(Ordering::Relaxed);

        let (a1, a2) = duplex(64 * 1024);
        let (b1, b2) = duplex(64 * 1024);
        let relay_task = tokio::spawn(relay(a2, b1));

        let (mut left, mut right) = (a1, b2);
        left.write_all(&[9u8; 1000]).await.unwrap();
        let mut buf = vec![0u8; 1000];
        right.read_exact(&mut buf).await.unwrap();
        drop(left);
        drop(right);
        relay_task.await.unwrap();

        let after = GLOBAL_STATS.bytes_sent.load(Ordering::Relaxed)
            + GLOBAL_STATS.bytes_recv.load(Ordering::Relaxed);
        assert!(after >= before + 1000);
    }
}
