//! Tunnel server: mimicry-validating accept loop, session registry keyed by
//! peer address, and reverse forwarder wiring.
//!
//! Accepted connections that pass validation are hijacked: the socket gets a
//! fixed `101 Switching Protocols`, then the encrypted frame stream starts
//! directly on the same connection. Everything else receives an nginx decoy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::comp::CompressedStream;
use crate::config::Config;
use crate::crypto_conn::EncryptedConn;
use crate::forward;
use crate::mimic::{self, PrefixedStream};
use crate::mux::{MuxConfig, MuxSession, MuxStream};
use crate::relay;
use crate::stats::GLOBAL_STATS;
use crate::util::split_map;
use crate::{tcp, BoxedTransport, TunnelError};

/// Sessions with more streams than this are skipped when picking one for a
/// new reverse connection.
const SESSION_STREAM_CAP: usize = 200;

/// Sessions idle (zero streams) longer than this are zombies: mobile clients
/// that changed IPs leave connections "open" but unused.
const ZOMBIE_IDLE: Duration = Duration::from_secs(3 * 60);

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

struct RegisteredSession {
    session: MuxSession,
    created_at: Instant,
    idle_since: Option<Instant>,
}

/// Client sessions indexed by remote peer address. One live session per peer
/// key: a rebind closes the prior session.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<tokio::sync::RwLock<HashMap<String, RegisteredSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, key: String, session: MuxSession) {
        let mut map = self.inner.write().await;
        let old = map.insert(
            key,
            RegisteredSession {
                session,
                created_at: Instant::now(),
                idle_since: None,
            },
        );
        GLOBAL_STATS.active_sessions.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = old {
            GLOBAL_STATS.active_sessions.fetch_add(-1, Ordering::Relaxed);
            old.session.close();
        }
    }

    async fn remove(&self, key: &str, session: &MuxSession) {
        let mut map = self.inner.write().await;
        if map.get(key).map_or(false, |r| r.session.ptr_eq(session)) {
            map.remove(key);
            GLOBAL_STATS.active_sessions.fetch_add(-1, Ordering::Relaxed);
        }
    }

    /// Picks a live session and opens a stream on it. Closed sessions are
    /// skipped, as are sessions over the soft stream cap; a non-closed
    /// session that fails to open is a zombie and gets closed on the spot.
    pub async fn open_stream(&self) -> Result<MuxStream, TunnelError> {
        let candidates: Vec<MuxSession> = {
            let map = self.inner.read().await;
            map.values().map(|r| r.session.clone()).collect()
        };
        if candidates.is_empty() {
            return Err(TunnelError::NoLiveSession);
        }

        let mut any_failed = false;
        for session in &candidates {
            if session.is_closed() {
                continue;
            }
            if session.num_streams() > SESSION_STREAM_CAP {
                continue;
            }
            match session.open_stream().await {
                Ok(stream) => return Ok(stream),
                Err(_) => {
                    // open_stream failed but is_closed was false: zombie.
                    any_failed = true;
                    session.close();
                }
            }
        }
        if any_failed {
            Err(TunnelError::AllSessionsExhausted)
        } else {
            Err(TunnelError::NoLiveSession)
        }
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    async fn close_all(&self) {
        let mut map = self.inner.write().await;
        for (_, registered) in map.drain() {
            registered.session.close();
            GLOBAL_STATS.active_sessions.fetch_add(-1, Ordering::Relaxed);
        }
    }

    /// One reaper pass: drop closed sessions, close and drop zombies.
    async fn reap(&self, verbose: bool) {
        let now = Instant::now();
        let mut map = self.inner.write().await;
        let mut dead_keys = Vec::new();

        for (key, registered) in map.iter_mut() {
            if registered.session.is_closed() {
                dead_keys.push(key.clone());
                continue;
            }
            if registered.session.num_streams() == 0 {
                match registered.idle_since {
                    None => registered.idle_since = Some(now),
                    Some(since) if now.duration_since(since) > ZOMBIE_IDLE => {
                        registered.session.close();
                        dead_keys.push(key.clone());
                        if verbose {
                            log::debug!(
                                "[CLEANUP] removed zombie session {} (age: {}s)",
                                key,
                                now.duration_since(registered.created_at).as_secs()
                            );
                        }
                    }
                    Some(_) => {}
                }
            } else {
                registered.idle_since = None;
            }
        }

        for key in dead_keys {
            if map.remove(&key).is_some() {
                GLOBAL_STATS.active_sessions.fetch_add(-1, Ordering::Relaxed);
                if verbose {
                    log::debug!("[CLEANUP] removed dead session {}", key);
                }
            }
        }
    }
}

/// Pre-bound server sockets, so callers learn the actual ports before the
/// accept loops start (`:0` binds in tests and configs).
pub struct BoundListeners {
    pub http: TcpListener,
    pub tcp_forwards: Vec<(TcpListener, String)>,
    pub udp_forwards: Vec<(UdpSocket, String)>,
}

impl BoundListeners {
    pub fn http_addr(&self) -> std::io::Result<SocketAddr> {
        self.http.local_addr()
    }

    pub fn tcp_forward_addrs(&self) -> Vec<SocketAddr> {
        self.tcp_forwards
            .iter()
            .filter_map(|(l, _)| l.local_addr().ok())
            .collect()
    }

    pub fn udp_forward_addrs(&self) -> Vec<SocketAddr> {
        self.udp_forwards
            .iter()
            .filter_map(|(s, _)| s.local_addr().ok())
            .collect()
    }
}

/// The tunnel server.
pub struct TunnelServer {
    cfg: Arc<Config>,
    registry: SessionRegistry,
}

impl TunnelServer {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg: Arc::new(cfg),
            registry: SessionRegistry::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Binds the listen address and every forward mapping.
    pub async fn bind(&self) -> Result<BoundListeners, TunnelError> {
        let http = TcpListener::bind(&self.cfg.listen).await.map_err(|e| {
            TunnelError::Config(format!("listen {}: {}", self.cfg.listen, e))
        })?;

        let mut tcp_forwards = Vec::new();
        for mapping in &self.cfg.forward.tcp {
            match split_map(mapping) {
                Some((bind, target)) => {
                    let listener = TcpListener::bind(&bind).await.map_err(|e| {
                        TunnelError::Config(format!("reverse tcp {}: {}", bind, e))
                    })?;
                    tcp_forwards.push((listener, target));
                }
                None => log::warn!("[SERVER] ignoring malformed mapping {:?}", mapping),
            }
        }

        let mut udp_forwards = Vec::new();
        for mapping in &self.cfg.forward.udp {
            match split_map(mapping) {
                Some((bind, target)) => {
                    let socket = UdpSocket::bind(&bind).await.map_err(|e| {
                        TunnelError::Config(format!("reverse udp {}: {}", bind, e))
                    })?;
                    udp_forwards.push((socket, target));
                }
                None => log::warn!("[SERVER] ignoring malformed mapping {:?}", mapping),
            }
        }

        Ok(BoundListeners {
            http,
            tcp_forwards,
            udp_forwards,
        })
    }

    /// Convenience: bind then run.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        let listeners = self.bind().await?;
        self.run(listeners, cancel).await
    }

    /// Runs the accept loop, forwarders and registry reaper until
    /// cancellation.
    pub async fn run(
        &self,
        listeners: BoundListeners,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        let prefix = self.cfg.mimic.path_prefix();
        log::info!(
            "[SERVER] listening on {}  tunnel={}  transport={}",
            self.cfg.listen,
            prefix,
            self.cfg.transport
        );

        for (listener, target) in listeners.tcp_forwards {
            tokio::spawn(forward::reverse_tcp(
                self.registry.clone(),
                listener,
                target,
                cancel.clone(),
            ));
        }
        for (socket, target) in listeners.udp_forwards {
            tokio::spawn(forward::reverse_udp(
                self.registry.clone(),
                socket,
                target,
                cancel.clone(),
            ));
        }

        // Registry reaper.
        {
            let registry = self.registry.clone();
            let verbose = self.cfg.verbose;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tick.tick() => registry.reap(verbose).await,
                    }
                }
            });
        }

        let http = listeners.http;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = http.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let cfg = Arc::clone(&self.cfg);
                        let registry = self.registry.clone();
                        tokio::spawn(handle_conn(cfg, registry, stream, peer));
                    }
                    Err(e) => {
                        log::warn!("[SERVER] accept: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        // Stop accepting, give in-flight upgrades a moment to settle, then
        // drop every registered session. Bounded so shutdown never hangs.
        let settle = async {
            while !self.registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), settle).await.ok();
        self.registry.close_all().await;
        Ok(())
    }
}

/// Validates one accepted connection and, on success, runs its mux session
/// until it dies.
async fn handle_conn(
    cfg: Arc<Config>,
    registry: SessionRegistry,
    mut stream: TcpStream,
    peer: SocketAddr,
) {
    tcp::apply(&stream, &cfg.advanced);

    let head = match tokio::time::timeout(
        Duration::from_secs(10),
        mimic::read_request_head(&mut stream),
    )
    .await
    {
        Ok(Ok(head)) => head,
        _ => return,
    };

    if let Err(reason) = mimic::validate_request(&head, &cfg.mimic) {
        if cfg.verbose {
            log::debug!(
                "[REJECT] {} {} from {} ({})",
                head.method,
                head.path,
                peer,
                reason
            );
        }
        let _ = stream.write_all(&mimic::decoy_response(&head.path)).await;
        let _ = stream.shutdown().await;
        return;
    }

    if cfg.verbose {
        log::debug!("[TUNNEL] accepted from {}", peer);
    }
    if stream.write_all(mimic::SWITCH_RESPONSE).await.is_err() {
        return;
    }

    // Hijack: the request bytes past the head belong to the first frame.
    let prefixed = PrefixedStream::new(head.remainder, stream);
    let encrypted = EncryptedConn::new(prefixed, &cfg.psk, cfg.obfs.clone());
    let transport: BoxedTransport = if cfg.compression_enabled() {
        Box::new(CompressedStream::new(encrypted))
    } else {
        Box::new(encrypted)
    };
    let session = MuxSession::server(transport, MuxConfig::from_smux(&cfg.smux));

    let key = peer.to_string();
    registry.insert(key.clone(), session.clone()).await;
    log::info!("[SESSION] new mux session from {}", peer);

    // Forward direction: client-opened streams name a target to dial here.
    loop {
        match session.accept_stream().await {
            Ok(stream) => {
                tokio::spawn(relay::serve_target_stream(stream, cfg.verbose));
            }
            Err(_) => break,
        }
    }

    log::info!("[SESSION] closed {}", peer);
    registry.remove(&key, &session).await;
    session.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::MuxConfig;

    fn dummy_session() -> MuxSession {
        let (a, _b) = tokio::io::duplex(64 * 1024);
        MuxSession::client(Box::new(a), MuxConfig::default())
    }

    #[tokio::test]
    async fn test_registry_rebind_closes_prior() {
        let registry = SessionRegistry::new();
        let first = dummy_session();
        let second = dummy_session();

        registry.insert("1.2.3.4:5".to_string(), first.clone()).await;
        registry.insert("1.2.3.4:5".to_string(), second.clone()).await;

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_registry_remove_checks_identity() {
        let registry = SessionRegistry::new();
        let current = dummy_session();
        let stale = dummy_session();

        registry.insert("k".to_string(), current.clone()).await;
        // A stale handle must not evict the live session.
        registry.remove("k", &stale).await;
        assert_eq!(registry.len().await, 1);

        registry.remove("k", &current).await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_registry_reap_drops_closed() {
        let registry = SessionRegistry::new();
        let session = dummy_session();
        registry.insert("k".to_string(), session.clone()).await;

        session.close();
        registry.reap(false).await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_open_stream_empty_registry() {
        let registry = SessionRegistry::new();
        match registry.open_stream().await {
            Err(TunnelError::NoLiveSession) => {}
            other => panic!("expected NoLiveSession, got {:?}", other.map(|_| ())),
        }
    }
}
