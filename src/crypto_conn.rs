//! Per-frame AES-256-GCM encryption wrapper.
//!
//! A byte-stream connection where every write produces exactly one wire frame
//! and every read yields one frame's plaintext, chunked into the caller's
//! buffer. All mux control frames, data and keepalives ride inside; nothing
//! on the wire is cleartext after the handshake.
//!
//! Wire format:
//!   `[4B big-endian frame_length][12B nonce][ciphertext + 16B GCM tag]`
//!
//! Padding is applied before encryption (see [`crate::obfs`]) so frame sizes
//! do not reveal payload sizes. An empty PSK degrades to length-framed
//! passthrough, kept only for test parity; `Config::validate` refuses it.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use crate::obfs::{self, ObfsConfig};
use crate::pool::PooledBuf;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Frames above this are rejected outright; prevents memory exhaustion from
/// spoofed length headers.
const MAX_FRAME: usize = 2 * 1024 * 1024;

/// Largest payload accepted per write call; larger writes are split by the
/// partial-write return.
const MAX_WRITE_CHUNK: usize = 512 * 1024;

/// With padding enabled the original length travels in a 2-byte header, so
/// a padded payload can never exceed this.
const MAX_PADDED_CHUNK: usize = u16::MAX as usize;

enum ReadState {
    Header { buf: [u8; 4], filled: usize },
    Body { buf: PooledBuf, filled: usize },
}

enum WriteState {
    Idle,
    Flushing {
        frame: PooledBuf,
        written: usize,
        consumed: usize,
        jitter: Option<Duration>,
    },
    Jitter {
        sleep: Pin<Box<Sleep>>,
        consumed: usize,
    },
}

/// Framed AEAD connection over any byte stream.
pub struct EncryptedConn<S> {
    inner: S,
    cipher: Option<Aes256Gcm>,
    obfs: ObfsConfig,

    read: ReadState,
    // Leftover plaintext from a frame larger than the caller's buffer.
    // Owned allocation, never a pool buffer: the pool buffers are returned
    // before the read call completes.
    carry: Vec<u8>,
    carry_pos: usize,

    write: WriteState,
}

impl<S> EncryptedConn<S> {
    /// Wraps `inner` with per-frame AES-256-GCM. The key is SHA-256 of the
    /// PSK. An empty PSK yields length-framed passthrough with a loud
    /// warning.
    pub fn new(inner: S, psk: &str, obfs: ObfsConfig) -> Self {
        let cipher = if psk.is_empty() {
            log::warn!("[CRYPTO] PSK is empty, traffic is NOT encrypted!");
            None
        } else {
            let key = Sha256::digest(psk.as_bytes());
            // 32-byte digest always satisfies the AES-256 key length.
            Some(Aes256Gcm::new_from_slice(&key).expect("sha256 digest is a valid aes-256 key"))
        };
        Self {
            inner,
            cipher,
            obfs,
            read: ReadState::Header {
                buf: [0; 4],
                filled: 0,
            },
            carry: Vec::new(),
            carry_pos: 0,
            write: WriteState::Idle,
        }
    }

    /// Assembles one complete wire frame for `payload` in a pool buffer.
    fn seal_frame(&self, payload: &[u8]) -> io::Result<PooledBuf> {
        let cap = 4 + NONCE_LEN + 2 + payload.len() + self.obfs.max_padding + TAG_LEN;
        let mut frame = PooledBuf::with_capacity(cap);
        frame.extend_from_slice(&[0u8; 4]);

        match &self.cipher {
            Some(cipher) => {
                let mut nonce = [0u8; NONCE_LEN];
                OsRng.fill_bytes(&mut nonce);
                frame.extend_from_slice(&nonce);

                let ct_start = frame.len();
                if self.obfs.enabled {
                    obfs::pad_into(payload, &self.obfs, &mut frame);
                } else {
                    frame.extend_from_slice(payload);
                }

                let tag = cipher
                    .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut frame[ct_start..])
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "aead seal failed"))?;
                frame.extend_from_slice(tag.as_slice());
            }
            None => {
                if self.obfs.enabled {
                    obfs::pad_into(payload, &self.obfs, &mut frame);
                } else {
                    frame.extend_from_slice(payload);
                }
            }
        }

        let pkt_len = (frame.len() - 4) as u32;
        frame[..4].copy_from_slice(&pkt_len.to_be_bytes());
        Ok(frame)
    }

    /// Decrypts and unpads a complete frame body, copying into `out` and
    /// stashing any remainder in the carry buffer. Returns false when the
    /// frame held no payload bytes (pure padding).
    fn open_frame(&mut self, body: PooledBuf, out: &mut ReadBuf<'_>) -> io::Result<bool> {
        let plain: PooledBuf = match &self.cipher {
            Some(cipher) => {
                if body.len() < NONCE_LEN + TAG_LEN {
                    return Err(protocol_err("frame shorter than nonce + tag"));
                }
                let (nonce, rest) = body.split_at(NONCE_LEN);
                let ct_len = rest.len() - TAG_LEN;
                let mut pt = PooledBuf::with_capacity(ct_len);
                pt.extend_from_slice(&rest[..ct_len]);
                cipher
                    .decrypt_in_place_detached(
                        Nonce::from_slice(nonce),
                        b"",
                        &mut pt[..],
                        Tag::from_slice(&rest[ct_len..]),
                    )
                    .map_err(|_| protocol_err("aead open failed: tag mismatch"))?;
                pt
            }
            None => body,
        };

        let payload = if self.obfs.enabled {
            obfs::unpad(&plain).ok_or_else(|| protocol_err("invalid padding header"))?
        } else {
            &plain[..]
        };

        if payload.is_empty() {
            return Ok(false);
        }

        let n = payload.len().min(out.remaining());
        out.put_slice(&payload[..n]);
        if n < payload.len() {
            self.carry.clear();
            self.carry_pos = 0;
            self.carry.extend_from_slice(&payload[n..]);
        }
        Ok(true)
    }
}

fn protocol_err(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

impl<S: AsyncRead + Unpin> AsyncRead for EncryptedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            // Carry-over from a previous frame is served without touching the
            // underlying connection.
            if this.carry_pos < this.carry.len() {
                let n = (this.carry.len() - this.carry_pos).min(out.remaining());
                out.put_slice(&this.carry[this.carry_pos..this.carry_pos + n]);
                this.carry_pos += n;
                if this.carry_pos == this.carry.len() {
                    this.carry.clear();
                    this.carry_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            let body_ready = match &mut this.read {
                ReadState::Header { buf, filled } => {
                    while *filled < 4 {
                        let mut rb = ReadBuf::new(&mut buf[*filled..]);
                        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                        let n = rb.filled().len();
                        if n == 0 {
                            if *filled == 0 {
                                return Poll::Ready(Ok(())); // clean EOF between frames
                            }
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        *filled += n;
                    }
                    let pkt_len = u32::from_be_bytes(*buf) as usize;
                    if pkt_len == 0 || pkt_len > MAX_FRAME {
                        return Poll::Ready(Err(protocol_err(&format!(
                            "invalid frame length: {}",
                            pkt_len
                        ))));
                    }
                    false
                }
                ReadState::Body { buf, filled } => {
                    let want = buf.len();
                    while *filled < want {
                        let mut rb = ReadBuf::new(&mut buf[*filled..]);
                        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                        let n = rb.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        *filled += n;
                    }
                    true
                }
            };

            if body_ready {
                let body = match std::mem::replace(
                    &mut this.read,
                    ReadState::Header {
                        buf: [0; 4],
                        filled: 0,
                    },
                ) {
                    ReadState::Body { buf, .. } => buf,
                    ReadState::Header { .. } => unreachable!(),
                };
                if this.open_frame(body, out)? {
                    return Poll::Ready(Ok(()));
                }
                // Pure-padding frame: keep reading.
            } else if let ReadState::Header { buf, .. } = &this.read {
                let pkt_len = u32::from_be_bytes(*buf) as usize;
                let mut body = PooledBuf::with_capacity(pkt_len);
                body.resize(pkt_len, 0);
                this.read = ReadState::Body { buf: body, filled: 0 };
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for EncryptedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let max_chunk = if this.obfs.enabled {
            MAX_PADDED_CHUNK
        } else {
            MAX_WRITE_CHUNK
        };
        loop {
            if matches!(this.write, WriteState::Idle) {
                let chunk = &buf[..buf.len().min(max_chunk)];
                let frame = this.seal_frame(chunk)?;
                let jitter = obfs::jitter_delay(&this.obfs, chunk.len());
                this.write = WriteState::Flushing {
                    frame,
                    written: 0,
                    consumed: chunk.len(),
                    jitter,
                };
            }
            match &mut this.write {
                WriteState::Idle => unreachable!(),
                WriteState::Flushing {
                    frame,
                    written,
                    consumed,
                    jitter,
                } => {
                    while *written < frame.len() {
                        let n =
                            ready!(Pin::new(&mut this.inner).poll_write(cx, &frame[*written..]))?;
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "connection poisoned mid-frame",
                            )));
                        }
                        *written += n;
                    }
                    let consumed = *consumed;
                    match jitter.take() {
                        Some(delay) => {
                            this.write = WriteState::Jitter {
                                sleep: Box::pin(tokio::time::sleep(delay)),
                                consumed,
                            };
                        }
                        None => {
                            this.write = WriteState::Idle;
                            return Poll::Ready(Ok(consumed));
                        }
                    }
                }
                WriteState::Jitter { sleep, consumed } => {
                    ready!(sleep.as_mut().poll(cx));
                    let consumed = *consumed;
                    this.write = WriteState::Idle;
                    return Poll::Ready(Ok(consumed));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // A partially written frame must reach the wire before the inner
        // flush; the jitter gate is left for the pending poll_write.
        if let WriteState::Flushing {
            frame,
            written,
            consumed,
            jitter,
        } = &mut this.write
        {
            while *written < frame.len() {
                let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &frame[*written..]))?;
                if n == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection poisoned mid-frame",
                    )));
                }
                *written += n;
            }
            let consumed = *consumed;
            let delay = jitter.take().unwrap_or(Duration::ZERO);
            this.write = WriteState::Jitter {
                sleep: Box::pin(tokio::time::sleep(delay)),
                consumed,
            };
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
