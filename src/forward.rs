//! Reverse forwarders: server-side listeners whose traffic rides the tunnel
//! back to the client, which dials the real target.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::mux::MuxStream;
use crate::relay::{relay, send_target};
use crate::server::SessionRegistry;

/// UDP flows idle longer than this are evicted.
const UDP_FLOW_IDLE: Duration = Duration::from_secs(120);

/// Stale-flow sweep interval.
const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Per-flow datagram queue toward the tunnel.
const UDP_FLOW_QUEUE: usize = 64;

/// Accepts TCP connections on `listener` and pushes each one through the
/// tunnel toward `target`.
pub async fn reverse_tcp(
    registry: SessionRegistry,
    listener: TcpListener,
    target: String,
    cancel: CancellationToken,
) {
    let bind = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    log::info!("[RTCP] {} -> client -> {}", bind, target);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((local, _)) => {
                    tokio::spawn(handle_reverse_tcp(registry.clone(), local, target.clone()));
                }
                Err(e) => {
                    log::warn!("[RTCP] accept {}: {}", bind, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_reverse_tcp(registry: SessionRegistry, local: TcpStream, target: String) {
    let mut stream = match registry.open_stream().await {
        Ok(s) => s,
        Err(_) => {
            // The pool may be mid-reconnect; one brief retry.
            tokio::time::sleep(Duration::from_secs(2)).await;
            match registry.open_stream().await {
                Ok(s) => s,
                Err(e) => {
                    log::debug!("[RTCP] no session for {}: {}", target, e);
                    return;
                }
            }
        }
    };

    if let Err(e) = send_target(&mut stream, &format!("tcp://{}", target)).await {
        log::warn!("[RTCP] send target failed: {}", e);
        return;
    }

    relay(local, stream).await;
}

struct UdpFlow {
    to_stream: mpsc::Sender<Bytes>,
    last_seen: Instant,
}

/// Forwards datagrams on `socket` through per-client-address tunnel streams
/// toward `target`. Flows are created on first datagram and evicted after
/// two minutes idle.
pub async fn reverse_udp(
    registry: SessionRegistry,
    socket: UdpSocket,
    target: String,
    cancel: CancellationToken,
) {
    let bind = socket
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    log::info!("[RUDP] {} -> client -> {}", bind, target);

    let socket = Arc::new(socket);
    let flows: Arc<tokio::sync::Mutex<HashMap<SocketAddr, UdpFlow>>> =
        Arc::new(tokio::sync::Mutex::new(HashMap::new()));

    // Stale flow sweeper. Removing a flow drops its queue sender; the writer
    // task then shuts the stream down.
    {
        let flows = Arc::clone(&flows);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(UDP_SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        let mut map = flows.lock().await;
                        map.retain(|addr, flow| {
                            let live = flow.last_seen.elapsed() <= UDP_FLOW_IDLE;
                            if !live {
                                log::debug!("[RUDP] evicting stale flow {}", addr);
                            }
                            live
                        });
                    }
                }
            }
        });
    }

    let mut buf = vec![0u8; 65535];
    loop {
        let (n, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("[RUDP] recv {}: {}", bind, e);
                    continue;
                }
            }
        };
        if n == 0 {
            continue;
        }

        let sender = {
            let mut map = flows.lock().await;
            match map.get_mut(&peer) {
                Some(flow) => {
                    flow.last_seen = Instant::now();
                    flow.to_stream.clone()
                }
                None => {
                    let stream = match registry.open_stream().await {
                        Ok(s) => s,
                        Err(_) => continue,
                    };
                    match start_flow(stream, &target, Arc::clone(&socket), peer).await {
                        Some(to_stream) => {
                            map.insert(
                                peer,
                                UdpFlow {
                                    to_stream: to_stream.clone(),
                                    last_seen: Instant::now(),
                                },
                            );
                            to_stream
                        }
                        None => continue,
                    }
                }
            }
        };

        // Bounded queue: a wedged flow back-pressures only its own client.
        let _ = sender.send(Bytes::copy_from_slice(&buf[..n])).await;
    }
}

/// Sends the target header and spawns the two per-flow pumps. Returns the
/// datagram queue feeding the tunnel stream.
async fn start_flow(
    mut stream: MuxStream,
    target: &str,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
) -> Option<mpsc::Sender<Bytes>> {
    if send_target(&mut stream, &format!("udp://{}", target))
        .await
        .is_err()
    {
        return None;
    }

    let (rd, wr) = tokio::io::split(stream);
    let (to_stream, mut queue) = mpsc::channel::<Bytes>(UDP_FLOW_QUEUE);

    // Datagrams from the local socket into the tunnel.
    tokio::spawn(async move {
        let mut wr = wr;
        while let Some(pkt) = queue.recv().await {
            if wr.write_all(&pkt).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    // Replies from the tunnel back to the UDP peer. One stream read chunk
    // corresponds to one datagram.
    tokio::spawn(async move {
        let mut rd = rd;
        let mut buf = vec![0u8; 65535];
        loop {
            match rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.send_to(&buf[..n], peer).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Some(to_stream)
}
