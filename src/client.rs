//! Tunnel client: a pool of concurrent mux sessions with multi-path
//! failover, latency-based path selection, adaptive framing and a warm
//! standby session.
//!
//! Pipeline per session: dial (fragmented) -> mimicry handshake -> encrypted
//! connection -> optional snappy -> mux. Workers keep the pool at its target
//! size, cycling through paths when one looks blocked.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::comp::CompressedStream;
use crate::config::{Config, PathConfig};
use crate::crypto_conn::EncryptedConn;
use crate::fragment::{self, FragmentedStream};
use crate::mimic;
use crate::mux::{MuxConfig, MuxSession, MuxStream};
use crate::relay::{self, send_target};
use crate::stats::GLOBAL_STATS;
use crate::util::parse_addr;
use crate::{tcp, BoxedTransport, TunnelError};

/// Adaptive frame size ladder: start small (DPI-safe), ramp up for speed.
const FRAME_SIZES: [usize; 5] = [16384, 32768, 65536, 131072, 262144];

/// Sessions older than this get recycled; long-lived flows attract
/// ISP throttling.
const SESSION_MAX_AGE: Duration = Duration::from_secs(20 * 60);

/// Consecutive short failures before a worker abandons its path.
const MAX_FAILS_BEFORE_SWITCH: u32 = 3;

/// Sessions dying under this lived "short"; the frame level steps down.
const SHORT_SESSION: Duration = Duration::from_secs(30);

/// Sessions living past this step the frame level up.
const STABLE_SESSION: Duration = Duration::from_secs(120);

/// RTT sentinel for unreachable paths, never selectable.
const UNREACHABLE_RTT_NS: i64 = 999_000_000_000;

struct PooledSession {
    session: MuxSession,
    created_at: Instant,
}

struct ClientInner {
    cfg: Config,
    paths: Vec<PathConfig>,
    sessions: tokio::sync::RwLock<Vec<PooledSession>>,
    sess_idx: AtomicU64,
    frame_level: AtomicI32,
    path_latency: Vec<AtomicI64>,
    standby_tx: mpsc::Sender<MuxSession>,
    standby_rx: tokio::sync::Mutex<mpsc::Receiver<MuxSession>>,
}

/// The client session pool. Cheap to clone.
#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<ClientInner>,
}

impl TunnelClient {
    pub fn new(cfg: Config) -> Result<Self, TunnelError> {
        let paths = cfg.paths.clone();
        if paths.is_empty() {
            return Err(TunnelError::Config("no paths configured".to_string()));
        }
        // Single-slot mailbox: the standby builder blocks until a worker
        // adopts the warm session.
        let (standby_tx, standby_rx) = mpsc::channel(1);
        let path_latency = paths.iter().map(|_| AtomicI64::new(0)).collect();
        Ok(Self {
            inner: Arc::new(ClientInner {
                cfg,
                paths,
                sessions: tokio::sync::RwLock::new(Vec::new()),
                sess_idx: AtomicU64::new(0),
                frame_level: AtomicI32::new(0),
                path_latency,
                standby_tx,
                standby_rx: tokio::sync::Mutex::new(standby_rx),
            }),
        })
    }

    /// Runs the pool until cancellation. Spawns the workers, the warm-standby
    /// builder, the latency prober and the health-check timers.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        let inner = &self.inner;
        let pool_size = inner.paths[0].connection_pool.max(1);

        if inner.cfg.smux.frame_size >= 32 * 1024 {
            inner.frame_level.store(4, Ordering::Relaxed);
        }

        log::info!(
            "[CLIENT] pool={} paths={} profile={}",
            pool_size,
            inner.paths.len(),
            inner.cfg.profile
        );
        for (i, path) in inner.paths.iter().enumerate() {
            log::info!("[CLIENT]   path[{}]: {} ({})", i, path.addr, path.transport);
        }

        tokio::spawn(health_check(Arc::clone(inner), cancel.clone()));
        tokio::spawn(standby_manager(Arc::clone(inner), cancel.clone()));
        tokio::spawn(latency_prober(Arc::clone(inner), cancel.clone()));

        for id in 0..pool_size {
            tokio::spawn(pool_worker(Arc::clone(inner), id, cancel.clone()));
            // Staggered start: a synchronized connection burst is a DPI
            // signature of its own.
            if id + 1 < pool_size {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        cancel.cancelled().await;
        log::info!("[CLIENT] stopping...");
        let sessions = self.inner.sessions.write().await;
        for pooled in sessions.iter() {
            pooled.session.close();
        }
        Ok(())
    }

    /// Opens a forward stream over the pool, round-robin across live
    /// sessions, and sends the target header.
    pub async fn open_stream(&self, target: &str) -> Result<MuxStream, TunnelError> {
        let pool: Vec<MuxSession> = {
            let sessions = self.inner.sessions.read().await;
            sessions.iter().map(|p| p.session.clone()).collect()
        };
        if pool.is_empty() {
            return Err(TunnelError::NoLiveSession);
        }

        for _ in 0..pool.len() {
            let idx = (self.inner.sess_idx.fetch_add(1, Ordering::Relaxed) as usize) % pool.len();
            let session = &pool[idx];
            if session.is_closed() {
                continue;
            }
            let mut stream = match session.open_stream().await {
                Ok(s) => s,
                Err(_) => continue,
            };
            if send_target(&mut stream, target).await.is_err() {
                continue;
            }
            return Ok(stream);
        }
        Err(TunnelError::AllSessionsExhausted)
    }

    /// Live session count (includes sessions pending cleanup).
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Current adaptive frame level, 0..=4.
    pub fn frame_level(&self) -> i32 {
        self.inner.frame_level.load(Ordering::Relaxed)
    }
}

// ─── worker loop ───

async fn pool_worker(inner: Arc<ClientInner>, id: usize, cancel: CancellationToken) {
    let mut path_idx = best_path(&inner);
    let mut fail_count = 0u32;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let path = inner.paths[path_idx].clone();
        let retry = Duration::from_secs(path.retry_interval.max(1));

        // Warm standby first: instant recovery without a handshake.
        if let Some(standby) = try_take_standby(&inner).await {
            if !standby.is_closed() {
                log::info!("[POOL#{}] using warm standby session", id);
                add_session(&inner, standby.clone()).await;
                serve_session(&inner, &standby, &cancel).await;
                remove_session(&inner, &standby).await;
                standby.close();
                fail_count = 0;
                continue;
            }
        }

        let started = Instant::now();
        let result = connect_and_serve(&inner, id, &path, &cancel).await;
        let lived = started.elapsed();
        if cancel.is_cancelled() {
            return;
        }

        if let Err(e) = result {
            let alive = inner.sessions.read().await.len();

            if lived < SHORT_SESSION {
                fail_count += 1;
                adjust_frame_level(&inner, -1);
            } else {
                fail_count = 0;
                if lived > STABLE_SESSION {
                    adjust_frame_level(&inner, 1);
                }
            }

            if fail_count >= MAX_FAILS_BEFORE_SWITCH && inner.paths.len() > 1 {
                let old_idx = path_idx;
                let mut new_idx = best_path(&inner);
                if new_idx == path_idx {
                    new_idx = (path_idx + 1) % inner.paths.len();
                }
                path_idx = new_idx;
                fail_count = 0;
                log::info!(
                    "[POOL#{}] path[{}] seems blocked, switching to path[{}] {}",
                    id,
                    old_idx,
                    path_idx,
                    inner.paths[path_idx].addr
                );
                if path_idx == 0 {
                    log::info!("[POOL#{}] all paths tried, backing off 10s", id);
                    GLOBAL_STATS.reconnects.fetch_add(1, Ordering::Relaxed);
                    if sleep_or_cancelled(Duration::from_secs(10), &cancel).await {
                        return;
                    }
                    continue;
                }
            } else {
                log::info!(
                    "[POOL#{}] disconnected from {} ({}) alive={} retry={:?}",
                    id,
                    path.addr,
                    e,
                    alive,
                    retry
                );
            }

            GLOBAL_STATS.reconnects.fetch_add(1, Ordering::Relaxed);
        } else {
            fail_count = 0;
        }

        if sleep_or_cancelled(retry, &cancel).await {
            return;
        }
    }
}

/// Builds one session on `path`, registers it, then accepts reverse streams
/// until the session dies.
async fn connect_and_serve(
    inner: &Arc<ClientInner>,
    id: usize,
    path: &PathConfig,
    cancel: &CancellationToken,
) -> Result<(), TunnelError> {
    let session = build_session(inner, path).await?;
    add_session(inner, session.clone()).await;

    let count = inner.sessions.read().await.len();
    let level = inner.frame_level.load(Ordering::Relaxed) as usize;
    log::info!(
        "[POOL#{}] connected to {} (pool: {}, frame: {}B)",
        id,
        path.addr,
        count,
        FRAME_SIZES[level]
    );

    serve_session(inner, &session, cancel).await;
    remove_session(inner, &session).await;
    session.close();
    Err(TunnelError::SessionClosed)
}

/// Accepts server-initiated streams until the session fails or the process
/// shuts down.
async fn serve_session(inner: &Arc<ClientInner>, session: &MuxSession, cancel: &CancellationToken) {
    let verbose = inner.cfg.verbose;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = session.accept_stream() => match accepted {
                Ok(stream) => {
                    tokio::spawn(relay::serve_target_stream(stream, verbose));
                }
                Err(_) => return,
            }
        }
    }
}

/// Dial -> mimic -> encrypt -> (compress) -> mux, in that order.
async fn build_session(
    inner: &Arc<ClientInner>,
    path: &PathConfig,
) -> Result<MuxSession, TunnelError> {
    let cfg = &inner.cfg;
    let addr = parse_addr(&path.addr, &path.transport);
    let dial_timeout = Duration::from_secs(path.dial_timeout.max(1));
    let level = inner.frame_level.load(Ordering::Relaxed).clamp(0, 4) as usize;

    if cfg.verbose {
        log::debug!(
            "[POOL] connecting to {} ({}) frame={}B",
            addr,
            path.transport,
            FRAME_SIZES[level]
        );
    }

    let stream = fragment::dial_tcp(&addr, dial_timeout).await.map_err(|e| {
        GLOBAL_STATS.failed_dials.fetch_add(1, Ordering::Relaxed);
        TunnelError::Io(e)
    })?;
    tcp::apply(&stream, &cfg.advanced);

    let fragmenting = cfg.fragment.enabled
        && matches!(path.transport.as_str(), "httpmux" | "wsmux");
    let raw: BoxedTransport = if fragmenting {
        Box::new(FragmentedStream::new(stream, &cfg.fragment))
    } else {
        Box::new(stream)
    };

    let upgraded = mimic::client_handshake(raw, &cfg.mimic)
        .await
        .map_err(|e| TunnelError::Handshake(e.to_string()))?;

    let encrypted = EncryptedConn::new(upgraded, &cfg.psk, cfg.obfs.clone());

    let transport: BoxedTransport = if cfg.compression_enabled() {
        Box::new(CompressedStream::new(encrypted))
    } else {
        Box::new(encrypted)
    };

    let mut mux_cfg = MuxConfig::from_smux(&cfg.smux);
    mux_cfg.max_frame_size = FRAME_SIZES[level];
    Ok(MuxSession::client(transport, mux_cfg))
}

// ─── pool bookkeeping ───

async fn add_session(inner: &Arc<ClientInner>, session: MuxSession) {
    inner.sessions.write().await.push(PooledSession {
        session,
        created_at: Instant::now(),
    });
}

async fn remove_session(inner: &Arc<ClientInner>, session: &MuxSession) {
    let mut sessions = inner.sessions.write().await;
    if let Some(pos) = sessions.iter().position(|p| p.session.ptr_eq(session)) {
        sessions.remove(pos);
    }
}

async fn try_take_standby(inner: &Arc<ClientInner>) -> Option<MuxSession> {
    let mut rx = inner.standby_rx.try_lock().ok()?;
    rx.try_recv().ok()
}

fn adjust_frame_level(inner: &Arc<ClientInner>, delta: i32) {
    loop {
        let old = inner.frame_level.load(Ordering::Relaxed);
        let new = (old + delta).clamp(0, 4);
        if new == old {
            return;
        }
        if inner
            .frame_level
            .compare_exchange(old, new, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            log::info!(
                "[ADAPTIVE] frame {}B -> {}B (level {} -> {})",
                FRAME_SIZES[old as usize],
                FRAME_SIZES[new as usize],
                old,
                new
            );
            return;
        }
    }
}

/// Index of the path with the lowest measured RTT. Unmeasured and
/// unreachable paths are skipped; with no measurements at all, path 0.
fn best_path(inner: &Arc<ClientInner>) -> usize {
    if inner.paths.len() <= 1 {
        return 0;
    }
    let mut best = 0;
    let mut best_rtt = 0i64;
    for (i, latency) in inner.path_latency.iter().enumerate() {
        let rtt = latency.load(Ordering::Relaxed);
        if rtt <= 0 || rtt >= UNREACHABLE_RTT_NS {
            continue;
        }
        if best_rtt == 0 || rtt < best_rtt {
            best = i;
            best_rtt = rtt;
        }
    }
    best
}

// ─── background tasks ───

/// Keeps one pre-built session ready for instant promotion.
async fn standby_manager(inner: Arc<ClientInner>, cancel: CancellationToken) {
    // Let the primary pool establish first.
    if sleep_or_cancelled(Duration::from_secs(5), &cancel).await {
        return;
    }
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let path = inner.paths[best_path(&inner)].clone();
        match build_session(&inner, &path).await {
            Ok(session) => {
                log::info!("[STANDBY] warm session ready");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        session.close();
                        return;
                    }
                    sent = inner.standby_tx.send(session.clone()) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                if sleep_or_cancelled(Duration::from_secs(2), &cancel).await {
                    return;
                }
            }
            Err(_) => {
                if sleep_or_cancelled(Duration::from_secs(5), &cancel).await {
                    return;
                }
            }
        }
    }
}

/// Measures TCP RTT to every path every 30 seconds.
async fn latency_prober(inner: Arc<ClientInner>, cancel: CancellationToken) {
    if sleep_or_cancelled(Duration::from_secs(3), &cancel).await {
        return;
    }
    loop {
        for (i, path) in inner.paths.iter().enumerate() {
            if cancel.is_cancelled() {
                return;
            }
            let addr = parse_addr(&path.addr, &path.transport);
            let started = Instant::now();
            let probe = tokio::time::timeout(
                Duration::from_secs(5),
                tokio::net::TcpStream::connect(&addr),
            )
            .await;
            let rtt_ns = match probe {
                Ok(Ok(_conn)) => started.elapsed().as_nanos() as i64,
                _ => UNREACHABLE_RTT_NS,
            };
            inner.path_latency[i].store(rtt_ns, Ordering::Relaxed);
        }

        if inner.cfg.verbose && inner.paths.len() > 1 {
            let mut line = String::from("[LATENCY]");
            for (i, latency) in inner.path_latency.iter().enumerate() {
                let ns = latency.load(Ordering::Relaxed);
                if ns >= UNREACHABLE_RTT_NS {
                    line.push_str(&format!(" path[{}]=unreachable", i));
                } else {
                    line.push_str(&format!(" path[{}]={}ms", i, ns / 1_000_000));
                }
            }
            log::debug!("{}", line);
        }

        if sleep_or_cancelled(Duration::from_secs(30), &cancel).await {
            return;
        }
    }
}

/// Two timers: a 3 s cleanup dropping closed sessions, and a 60 s recycler
/// closing the single oldest over-age session to limit disruption.
async fn health_check(inner: Arc<ClientInner>, cancel: CancellationToken) {
    let mut clean_tick = tokio::time::interval(Duration::from_secs(3));
    let mut recycle_tick = tokio::time::interval(Duration::from_secs(60));
    clean_tick.tick().await;
    recycle_tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = clean_tick.tick() => {
                let mut sessions = inner.sessions.write().await;
                let before = sessions.len();
                sessions.retain(|p| {
                    if p.session.is_closed() {
                        p.session.close();
                        false
                    } else {
                        true
                    }
                });
                let removed = before - sessions.len();
                if removed > 0 && inner.cfg.verbose {
                    log::debug!("[POOL] cleaned {} dead (alive: {})", removed, sessions.len());
                }
            }
            _ = recycle_tick.tick() => {
                let sessions = inner.sessions.read().await;
                let now = Instant::now();
                let oldest = sessions
                    .iter()
                    .filter(|p| !p.session.is_closed())
                    .filter(|p| now.duration_since(p.created_at) > SESSION_MAX_AGE)
                    .min_by_key(|p| p.created_at);
                if let Some(pooled) = oldest {
                    pooled.session.close();
                    if inner.cfg.verbose {
                        let age = now.duration_since(pooled.created_at).as_secs();
                        log::debug!("[RECYCLE] closed session (age: {}s), fresh connection incoming", age);
                    }
                }
            }
        }
    }
}

/// Sleeps, returning true if cancellation fired first.
async fn sleep_or_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
