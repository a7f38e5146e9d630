//! Stream multiplexer.
//!
//! Many logical streams over one reliable byte stream, with keepalive-driven
//! liveness and bounded buffering. The frame header is ten bytes:
//!
//!   `[1B version][1B command][4B BE length][4B BE stream_id]`
//!
//! Commands: SYN opens a stream, FIN closes one direction, PSH carries data,
//! NOP is a keepalive. Client-initiated stream ids are odd, server-initiated
//! even, so the two sides never collide.
//!
//! Receive bounding follows the classic smux-v1 discipline: each stream has a
//! bounded chunk queue and the session recv loop stops draining the transport
//! while a queue is full, pushing backpressure into TCP. Writes flow through
//! a bounded session queue drained by a single writer task, so each mux frame
//! reaches the encrypted connection as exactly one write (one AEAD frame).

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};

use crate::config::SmuxConfig;
use crate::{BoxedTransport, TunnelError};

const HDR_LEN: usize = 10;

const CMD_SYN: u8 = 0;
const CMD_FIN: u8 = 1;
const CMD_PSH: u8 = 2;
const CMD_NOP: u8 = 3;

/// Hard bound on accepted frame payloads, independent of the local frame
/// size: the peer's adaptive level may be higher than ours.
const MAX_WIRE_FRAME: usize = 1024 * 1024;

/// Pending-accept backlog.
const ACCEPT_BACKLOG: usize = 128;

/// Multiplexer tuning.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub version: u8,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub max_frame_size: usize,
    pub max_receive_buffer: usize,
    pub max_stream_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::from_smux(&SmuxConfig::default())
    }
}

impl MuxConfig {
    /// Derives runtime settings from the shared smux config section. The
    /// keepalive timeout must stay generous for high-latency lossy links:
    /// six intervals, never under 30 seconds.
    pub fn from_smux(sc: &SmuxConfig) -> Self {
        let interval = Duration::from_secs(sc.keepalive.max(1));
        let timeout = (interval * 6).max(Duration::from_secs(30));
        Self {
            version: if sc.version == 0 { 2 } else { sc.version },
            keepalive_interval: interval,
            keepalive_timeout: timeout,
            max_frame_size: sc.frame_size.clamp(1024, MAX_WIRE_FRAME),
            max_receive_buffer: sc.max_recv,
            max_stream_buffer: sc.max_stream,
        }
    }

    fn stream_queue_chunks(&self) -> usize {
        (self.max_stream_buffer / self.max_frame_size).clamp(4, 1024)
    }

    fn session_queue_frames(&self) -> usize {
        (self.max_receive_buffer / self.max_frame_size).clamp(16, 256)
    }
}

#[derive(Debug)]
struct Frame {
    cmd: u8,
    sid: u32,
    data: Bytes,
}

impl Frame {
    fn control(cmd: u8, sid: u32) -> Self {
        Self {
            cmd,
            sid,
            data: Bytes::new(),
        }
    }

    fn psh(sid: u32, data: Bytes) -> Self {
        Self {
            cmd: CMD_PSH,
            sid,
            data,
        }
    }
}

struct StreamHandle {
    data_tx: mpsc::Sender<Bytes>,
}

struct Shared {
    cfg: MuxConfig,
    out_tx: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u32, StreamHandle>>,
    next_sid: AtomicU32,
    last_recv: Mutex<Instant>,
    closed: CancellationToken,
}

impl Shared {
    fn touch(&self) {
        *self.last_recv.lock().expect("mux clock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_recv.lock().expect("mux clock poisoned").elapsed()
    }
}

/// One multiplexed session over a transport. Cheap to clone; all clones
/// address the same underlying session.
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<Shared>,
    accept_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<MuxStream>>>,
}

impl MuxSession {
    /// Client role: initiates odd stream ids.
    pub fn client(conn: BoxedTransport, cfg: MuxConfig) -> Self {
        Self::start(conn, cfg, 1)
    }

    /// Server role: initiates even stream ids.
    pub fn server(conn: BoxedTransport, cfg: MuxConfig) -> Self {
        Self::start(conn, cfg, 2)
    }

    fn start(conn: BoxedTransport, cfg: MuxConfig, first_sid: u32) -> Self {
        let (out_tx, out_rx) = mpsc::channel(cfg.session_queue_frames());
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let shared = Arc::new(Shared {
            cfg,
            out_tx,
            streams: Mutex::new(HashMap::new()),
            next_sid: AtomicU32::new(first_sid),
            last_recv: Mutex::new(Instant::now()),
            closed: CancellationToken::new(),
        });

        let (rd, wr) = tokio::io::split(conn);

        let recv_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let token = recv_shared.closed.clone();
            tokio::select! {
                _ = token.cancelled() => {}
                res = recv_loop(Arc::clone(&recv_shared), rd, accept_tx) => {
                    if let Err(e) = res {
                        log::debug!("[MUX] recv loop ended: {}", e);
                    }
                }
            }
            token.cancel();
            // Dropping the handles EOFs every pending stream reader.
            recv_shared.streams.lock().expect("mux streams poisoned").clear();
        });

        let send_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let token = send_shared.closed.clone();
            tokio::select! {
                _ = token.cancelled() => {}
                res = send_loop(send_shared.cfg.version, wr, out_rx) => {
                    if let Err(e) = res {
                        log::debug!("[MUX] send loop ended: {}", e);
                    }
                }
            }
            token.cancel();
        });

        let ka_shared = Arc::clone(&shared);
        tokio::spawn(keepalive_loop(ka_shared));

        Self {
            shared,
            accept_rx: Arc::new(tokio::sync::Mutex::new(accept_rx)),
        }
    }

    /// Opens a new outbound stream.
    pub async fn open_stream(&self) -> Result<MuxStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        let sid = self.shared.next_sid.fetch_add(2, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::channel(self.shared.cfg.stream_queue_chunks());
        self.shared
            .streams
            .lock()
            .expect("mux streams poisoned")
            .insert(sid, StreamHandle { data_tx });

        if self
            .shared
            .out_tx
            .send(Frame::control(CMD_SYN, sid))
            .await
            .is_err()
        {
            self.shared
                .streams
                .lock()
                .expect("mux streams poisoned")
                .remove(&sid);
            return Err(TunnelError::SessionClosed);
        }
        Ok(MuxStream::new(sid, data_rx, Arc::clone(&self.shared)))
    }

    /// Waits for the next peer-initiated stream.
    pub async fn accept_stream(&self) -> Result<MuxStream, TunnelError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.shared.closed.cancelled() => Err(TunnelError::SessionClosed),
            stream = rx.recv() => stream.ok_or(TunnelError::SessionClosed),
        }
    }

    /// True when `other` is a clone of this same session.
    pub fn ptr_eq(&self, other: &MuxSession) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Number of streams currently routed by this session.
    pub fn num_streams(&self) -> usize {
        self.shared.streams.lock().expect("mux streams poisoned").len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Tears the session down; all streams error out or EOF.
    pub fn close(&self) {
        self.shared.closed.cancel();
        self.shared.streams.lock().expect("mux streams poisoned").clear();
    }
}

async fn recv_loop(
    shared: Arc<Shared>,
    mut rd: tokio::io::ReadHalf<BoxedTransport>,
    accept_tx: mpsc::Sender<MuxStream>,
) -> io::Result<()> {
    let mut hdr = [0u8; HDR_LEN];
    loop {
        rd.read_exact(&mut hdr).await?;
        shared.touch();

        let version = hdr[0];
        let cmd = hdr[1];
        let len = u32::from_be_bytes([hdr[2], hdr[3], hdr[4], hdr[5]]) as usize;
        let sid = u32::from_be_bytes([hdr[6], hdr[7], hdr[8], hdr[9]]);

        if version != shared.cfg.version {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("mux version mismatch: {}", version),
            ));
        }
        if len > MAX_WIRE_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("mux frame too large: {}", len),
            ));
        }

        let data = if len > 0 {
            let mut buf = vec![0u8; len];
            rd.read_exact(&mut buf).await?;
            shared.touch();
            Bytes::from(buf)
        } else {
            Bytes::new()
        };

        match cmd {
            CMD_NOP => {}
            CMD_SYN => {
                let new_stream = {
                    let mut streams = shared.streams.lock().expect("mux streams poisoned");
                    if !streams.contains_key(&sid) {
                        let (data_tx, data_rx) = mpsc::channel(shared.cfg.stream_queue_chunks());
                        streams.insert(sid, StreamHandle { data_tx });
                        Some(data_rx)
                    } else {
                        None
                    }
                };
                if let Some(data_rx) = new_stream {
                    let stream = MuxStream::new(sid, data_rx, Arc::clone(&shared));
                    if accept_tx.send(stream).await.is_err() {
                        return Ok(()); // acceptor gone, session unwinding
                    }
                }
            }
            CMD_PSH => {
                let tx = shared
                    .streams
                    .lock()
                    .expect("mux streams poisoned")
                    .get(&sid)
                    .map(|h| h.data_tx.clone());
                if let Some(tx) = tx {
                    // A full queue stalls the whole recv loop by design:
                    // backpressure propagates into the transport.
                    let _ = tx.send(data).await;
                }
                // Data for unknown/closed streams is discarded.
            }
            CMD_FIN => {
                shared
                    .streams
                    .lock()
                    .expect("mux streams poisoned")
                    .remove(&sid);
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown mux command: {}", other),
                ));
            }
        }
    }
}

async fn send_loop(
    version: u8,
    mut wr: tokio::io::WriteHalf<BoxedTransport>,
    mut out_rx: mpsc::Receiver<Frame>,
) -> io::Result<()> {
    let mut buf = Vec::with_capacity(HDR_LEN + 32 * 1024);
    while let Some(frame) = out_rx.recv().await {
        buf.clear();
        buf.push(version);
        buf.push(frame.cmd);
        buf.extend_from_slice(&(frame.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&frame.sid.to_be_bytes());
        buf.extend_from_slice(&frame.data);
        // One contiguous write per mux frame, so the encrypted layer seals
        // exactly one wire frame for it.
        wr.write_all(&buf).await?;
        wr.flush().await?;
    }
    Ok(())
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let token = shared.closed.clone();
    let mut tick = tokio::time::interval(shared.cfg.keepalive_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tick.tick() => {}
        }
        if shared.idle_for() > shared.cfg.keepalive_timeout {
            log::warn!(
                "[MUX] keepalive timeout ({}s silent), killing session",
                shared.idle_for().as_secs()
            );
            token.cancel();
            shared.streams.lock().expect("mux streams poisoned").clear();
            return;
        }
        tokio::select! {
            _ = token.cancelled() => return,
            sent = shared.out_tx.send(Frame::control(CMD_NOP, 0)) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// One logical byte stream within a session.
///
/// Reading drains the stream's inbound chunk queue; writing enqueues PSH
/// frames chunked to the session's max frame size. Dropping the stream sends
/// a best-effort FIN.
pub struct MuxStream {
    sid: u32,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Bytes>,
    carry: Bytes,
    tx: PollSender<Frame>,
    fin_sent: bool,
}

impl MuxStream {
    fn new(sid: u32, rx: mpsc::Receiver<Bytes>, shared: Arc<Shared>) -> Self {
        let tx = PollSender::new(shared.out_tx.clone());
        Self {
            sid,
            shared,
            rx,
            carry: Bytes::new(),
            tx,
            fin_sent: false,
        }
    }

    /// Stream id, for logging.
    pub fn id(&self) -> u32 {
        self.sid
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.carry.is_empty() {
                let n = this.carry.len().min(buf.remaining());
                buf.put_slice(&this.carry[..n]);
                let _ = this.carry.split_to(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => {
                    this.carry = chunk;
                    // Loop: empty chunks are skipped rather than read as EOF.
                }
                None => return Poll::Ready(Ok(())), // FIN or session closed
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.shared.closed.is_cancelled() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(this.tx.poll_reserve(cx))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        let n = buf.len().min(this.shared.cfg.max_frame_size);
        this.tx
            .send_item(Frame::psh(this.sid, Bytes::copy_from_slice(&buf[..n])))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames already queued are flushed by the session writer task.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.fin_sent || this.shared.closed.is_cancelled() {
            return Poll::Ready(Ok(()));
        }
        ready!(this.tx.poll_reserve(cx))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        this.tx
            .send_item(Frame::control(CMD_FIN, this.sid))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        this.fin_sent = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if let Ok(mut streams) = self.shared.streams.lock() {
            streams.remove(&self.sid);
        }
        if !self.fin_sent && !self.shared.closed.is_cancelled() {
            let _ = self.shared.out_tx.try_send(Frame::control(CMD_FIN, self.sid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pair(cfg: MuxConfig) -> (MuxSession, MuxSession) {
        let (a, b) = duplex(512 * 1024);
        let client = MuxSession::client(Box::new(a), cfg.clone());
        let server = MuxSession::server(Box::new(b), cfg);
        (client, server)
    }

    #[tokio::test]
    async fn test_open_accept_echo() {
        let (client, server) = pair(MuxConfig::default());

        let srv = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn test_multiple_streams_interleave() {
        let (client, server) = pair(MuxConfig::default());

        let srv = tokio::spawn(async move {
            for _ in 0..4 {
                let mut stream = server.accept_stream().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    stream.read_to_end(&mut buf).await.unwrap();
                    stream.write_all(&buf).await.unwrap();
                    stream.shutdown().await.unwrap();
                });
            }
        });

        let mut tasks = Vec::new();
        for i in 0..4u8 {
            let session = client.clone();
            tasks.push(tokio::spawn(async move {
                let mut stream = session.open_stream().await.unwrap();
                let msg = vec![i; 1000 + i as usize];
                stream.write_all(&msg).await.unwrap();
                stream.shutdown().await.unwrap();
                let mut got = Vec::new();
                stream.read_to_end(&mut got).await.unwrap();
                assert_eq!(got, msg);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn test_large_transfer_chunked_by_frame_size() {
        let mut cfg = MuxConfig::default();
        cfg.max_frame_size = 4096;
        let (client, server) = pair(cfg);

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 249) as u8).collect();
        let expected = payload.clone();

        let srv = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.unwrap();
            let mut got = vec![0u8; expected.len()];
            stream.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(&payload).await.unwrap();
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_propagates_eof() {
        let (client, server) = pair(MuxConfig::default());

        let mut stream = client.open_stream().await.unwrap();
        let mut accepted = server.accept_stream().await.unwrap();

        stream.write_all(b"bye").await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        let mut got = Vec::new();
        accepted.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bye");
    }

    #[tokio::test]
    async fn test_session_close_fails_streams() {
        let (client, _server) = pair(MuxConfig::default());
        client.close();
        assert!(client.is_closed());
        assert!(client.open_stream().await.is_err());
    }

    #[tokio::test]
    async fn test_keepalive_death_on_silent_peer() {
        // The peer end never responds; session must die after the timeout.
        let (a, _silent) = duplex(64 * 1024);
        let cfg = MuxConfig {
            keepalive_interval: Duration::from_millis(20),
            keepalive_timeout: Duration::from_millis(120),
            ..Default::default()
        };
        let session = MuxSession::client(Box::new(a), cfg);
        assert!(!session.is_closed());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_sessions_stay_alive_with_keepalive() {
        let cfg = MuxConfig {
            keepalive_interval: Duration::from_millis(20),
            keepalive_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (client, server) = pair(cfg);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!client.is_closed());
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_num_streams_tracks_open_and_close() {
        let (client, server) = pair(MuxConfig::default());
        assert_eq!(client.num_streams(), 0);

        let stream = client.open_stream().await.unwrap();
        let _accepted = server.accept_stream().await.unwrap();
        assert_eq!(client.num_streams(), 1);
        assert_eq!(server.num_streams(), 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.num_streams(), 0);
    }
}
