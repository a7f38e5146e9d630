//! End-to-end tests: a real server and client on loopback, exercising TCP
//! forwarding, the compressed pipeline, pool behavior and the decoy surface.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use picotun::config::{Config, Mode, PathConfig};
use picotun::{TunnelClient, TunnelServer};

const TEST_PSK: &str = "test-integration-psk";

/// TCP server that echoes back whatever it receives.
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = conn.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

async fn start_udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

fn server_config(compression: &str) -> Config {
    let mut cfg = Config {
        mode: Mode::Server,
        listen: "127.0.0.1:0".to_string(),
        psk: TEST_PSK.to_string(),
        compression: compression.to_string(),
        ..Default::default()
    };
    cfg.obfs.enabled = true;
    cfg.obfs.min_padding = 4;
    cfg.obfs.max_padding = 16;
    cfg.normalize();
    cfg
}

fn client_config(server_addr: SocketAddr, pool: usize, compression: &str) -> Config {
    let mut cfg = Config {
        mode: Mode::Client,
        psk: TEST_PSK.to_string(),
        compression: compression.to_string(),
        ..Default::default()
    };
    cfg.paths.push(PathConfig {
        transport: "httpmux".to_string(),
        addr: server_addr.to_string(),
        connection_pool: pool,
        retry_interval: 1,
        dial_timeout: 5,
    });
    cfg.obfs.enabled = true;
    cfg.obfs.min_padding = 4;
    cfg.obfs.max_padding = 16;
    cfg.normalize();
    cfg
}

struct Tunnel {
    client: TunnelClient,
    forward_tcp: Vec<SocketAddr>,
    forward_udp: Vec<SocketAddr>,
    cancel: CancellationToken,
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Brings up a full server + client pair and waits for the pool to form.
async fn start_tunnel(mut server_cfg: Config, client_pool: usize, compression: &str) -> Tunnel {
    let cancel = CancellationToken::new();

    server_cfg.compression = compression.to_string();
    let server = TunnelServer::new(server_cfg);
    let listeners = server.bind().await.expect("server bind");
    let server_addr = listeners.http_addr().unwrap();
    let forward_tcp = listeners.tcp_forward_addrs();
    let forward_udp = listeners.udp_forward_addrs();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move { server.run(listeners, cancel).await });
    }

    let client =
        TunnelClient::new(client_config(server_addr, client_pool, compression)).unwrap();
    {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run(cancel).await });
    }

    // Wait for at least one session to establish.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while client.session_count().await == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "client failed to establish a session"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Tunnel {
        client,
        forward_tcp,
        forward_udp,
        cancel,
    }
}

#[tokio::test]
async fn test_basic_tcp_forward() {
    let echo = start_echo_server().await;
    let mut cfg = server_config("");
    cfg.forward.tcp = vec![format!("127.0.0.1:0->{}", echo)];

    let tunnel = start_tunnel(cfg, 2, "").await;
    let bind = tunnel.forward_tcp[0];

    let msg = b"Hello RsTunnel Integration Test!";
    let mut conn = TcpStream::connect(bind).await.unwrap();
    conn.write_all(msg).await.unwrap();

    let mut got = vec![0u8; msg.len()];
    tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut got))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&got, msg);
}

#[tokio::test]
async fn test_snappy_pipeline() {
    let echo = start_echo_server().await;
    let mut cfg = server_config("snappy");
    cfg.forward.tcp = vec![format!("127.0.0.1:0->{}", echo)];

    let tunnel = start_tunnel(cfg, 2, "snappy").await;
    let bind = tunnel.forward_tcp[0];

    let msg = "Snappy compressed data test 🎯".as_bytes();
    let mut conn = TcpStream::connect(bind).await.unwrap();
    conn.write_all(msg).await.unwrap();

    let mut got = vec![0u8; msg.len()];
    tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut got))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(got, msg);
}

#[tokio::test]
async fn test_pool_concurrency() {
    let echo = start_echo_server().await;
    let mut cfg = server_config("");
    cfg.forward.tcp = vec![format!("127.0.0.1:0->{}", echo)];

    let tunnel = start_tunnel(cfg, 3, "").await;
    let bind = tunnel.forward_tcp[0];

    // Give the staggered workers a moment to fill the pool.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut tasks = Vec::new();
    for i in 0..5 {
        tasks.push(tokio::spawn(async move {
            let msg = format!("pool-test-{}", i);
            let mut conn = TcpStream::connect(bind).await?;
            conn.write_all(msg.as_bytes()).await?;
            let mut got = vec![0u8; msg.len()];
            conn.read_exact(&mut got).await?;
            assert_eq!(got, msg.as_bytes());
            Ok::<_, std::io::Error>(())
        }));
    }
    let all = async {
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(10), all)
        .await
        .expect("concurrent echoes timed out");

    assert!(
        tunnel.client.session_count().await >= 2,
        "pool failed to stabilize at two or more sessions"
    );
}

#[tokio::test]
async fn test_udp_forward() {
    let echo = start_udp_echo_server().await;
    let mut cfg = server_config("");
    cfg.forward.udp = vec![format!("127.0.0.1:0->{}", echo)];

    let tunnel = start_tunnel(cfg, 2, "").await;
    let bind = tunnel.forward_udp[0];

    let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    local.connect(bind).await.unwrap();

    // First datagram sets up the flow; a response proves the whole loop.
    let mut got = [0u8; 64];
    let mut received = 0;
    for _ in 0..5 {
        local.send(b"udp-roundtrip").await.unwrap();
        match tokio::time::timeout(Duration::from_secs(2), local.recv(&mut got)).await {
            Ok(Ok(n)) => {
                received = n;
                break;
            }
            _ => continue,
        }
    }
    assert_eq!(&got[..received], b"udp-roundtrip");
}

#[tokio::test]
async fn test_decoy_for_plain_http() {
    let cfg = server_config("");
    let server = TunnelServer::new(cfg);
    let listeners = server.bind().await.unwrap();
    let addr = listeners.http_addr().unwrap();
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move { server.run(listeners, cancel).await });
    }

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"GET / HTTP/1.1\r\nHost: whatever.example\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), conn.read_to_end(&mut response))
        .await
        .expect("decoy read timed out")
        .unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "got: {}", text);
    assert!(text.contains("Server: nginx/1.18.0"));
    assert!(text.contains("Welcome to nginx!"));
    cancel.cancel();
}

#[tokio::test]
async fn test_open_stream_forward_direction() {
    // No forward mappings; drive a client-opened stream directly.
    let echo = start_echo_server().await;
    let cfg = server_config("");
    let tunnel = start_tunnel(cfg, 1, "").await;

    let mut stream = tunnel
        .client
        .open_stream(&format!("tcp://{}", echo))
        .await
        .expect("open forward stream");

    stream.write_all(b"forward-path").await.unwrap();
    let mut got = [0u8; 12];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut got))
        .await
        .expect("forward echo timed out")
        .unwrap();
    assert_eq!(&got, b"forward-path");
}
