//! Transparent snappy compression between the encrypted connection and the
//! multiplexer.
//!
//! Each write becomes one length-framed block: `[4B BE block_len][1B flag]`
//! followed by the block, flag 1 for a snappy-compressed block and 0 for a
//! stored block (snappy can expand incompressible data, in which case the
//! raw bytes ship instead). Both peers must enable the same codec; the
//! config loader enforces the setting symmetry.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const HDR_LEN: usize = 5;

/// Accepts blocks a little over the largest mux frame; anything bigger is a
/// corrupt or hostile stream.
const MAX_BLOCK: usize = 1024 * 1024;

/// Largest plaintext chunk compressed per write.
const MAX_CHUNK: usize = 256 * 1024;

enum ReadState {
    Header { buf: [u8; HDR_LEN], filled: usize },
    Body { buf: Vec<u8>, filled: usize, compressed: bool },
}

enum WriteState {
    Idle,
    Flushing {
        block: Vec<u8>,
        written: usize,
        consumed: usize,
    },
}

/// Snappy stream wrapper.
pub struct CompressedStream<S> {
    inner: S,
    encoder: snap::raw::Encoder,
    decoder: snap::raw::Decoder,

    read: ReadState,
    out: Vec<u8>,
    out_pos: usize,

    write: WriteState,
}

impl<S> CompressedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            encoder: snap::raw::Encoder::new(),
            decoder: snap::raw::Decoder::new(),
            read: ReadState::Header {
                buf: [0; HDR_LEN],
                filled: 0,
            },
            out: Vec::new(),
            out_pos: 0,
            write: WriteState::Idle,
        }
    }

    fn encode_block(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        let compressed = self
            .encoder
            .compress_vec(chunk)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("snappy: {}", e)))?;

        let (flag, payload): (u8, &[u8]) = if compressed.len() < chunk.len() {
            (1, compressed.as_slice())
        } else {
            (0, chunk)
        };

        let mut block = Vec::with_capacity(HDR_LEN + payload.len());
        block.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        block.push(flag);
        block.extend_from_slice(payload);
        Ok(block)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CompressedStream<S> {
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
            if this.out_pos < this.out.len() {
                let n = (this.out.len() - this.out_pos).min(out.remaining());
                out.put_slice(&this.out[this.out_pos..this.out_pos + n]);
                this.out_pos += n;
                if this.out_pos == this.out.len() {
                    this.out.clear();
                    this.out_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            let body_ready = match &mut this.read {
                ReadState::Header { buf, filled } => {
                    while *filled < HDR_LEN {
                        let mut rb = ReadBuf::new(&mut buf[*filled..]);
                        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                        let n = rb.filled().len();
                        if n == 0 {
                            if *filled == 0 {
                                return Poll::Ready(Ok(())); // clean EOF
                            }
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        *filled += n;
                    }
                    false
                }
                ReadState::Body { buf, filled, .. } => {
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
                let (body, compressed) = match std::mem::replace(
                    &mut this.read,
                    ReadState::Header {
                        buf: [0; HDR_LEN],
                        filled: 0,
                    },
                ) {
                    ReadState::Body {
                        buf, compressed, ..
                    } => (buf, compressed),
                    ReadState::Header { .. } => unreachable!(),
                };
                this.out = if compressed {
                    this.decoder.decompress_vec(&body).map_err(|e| {
                        io::Error::new(io::ErrorKind::InvalidData, format!("snappy: {}", e))
                    })?
                } else {
                    body
                };
                this.out_pos = 0;
                // Zero-length blocks fall through to the next header.
            } else if let ReadState::Header { buf, .. } = &this.read {
                let block_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                let compressed = match buf[4] {
                    0 => false,
                    1 => true,
                    other => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("bad compression flag: {}", other),
                        )))
                    }
                };
                if block_len > MAX_BLOCK {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("compressed block too large: {}", block_len),
                    )));
                }
                this.read = ReadState::Body {
                    buf: vec![0; block_len],
                    filled: 0,
                    compressed,
                };
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CompressedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        loop {
            if matches!(this.write, WriteState::Idle) {
                let chunk = &buf[..buf.len().min(MAX_CHUNK)];
                let block = this.encode_block(chunk)?;
                this.write = WriteState::Flushing {
                    block,
                    written: 0,
                    consumed: chunk.len(),
                };
            }
            match &mut this.write {
                WriteState::Idle => unreachable!(),
                WriteState::Flushing {
                    block,
                    written,
                    consumed,
                } => {
                    while *written < block.len() {
                        let n =
                            ready!(Pin::new(&mut this.inner).poll_write(cx, &block[*written..]))?;
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                        }
                        *written += n;
                    }
                    let consumed = *consumed;
                    this.write = WriteState::Idle;
                    return Poll::Ready(Ok(consumed));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let WriteState::Flushing { block, written, .. } = &mut this.write {
            while *written < block.len() {
                let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &block[*written..]))?;
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                *written += n;
            }
            // The consumed count was already reported or will be on the next
            // poll_write with the same buffer; the block itself is done.
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_roundtrip() {
        let (a, b) = duplex(256 * 1024);
        let mut tx = CompressedStream::new(a);
        let mut rx = CompressedStream::new(b);

        let msg = "Hello, compressed world! 🎯 This is a test of the snappy layer.".as_bytes();
        tx.write_all(msg).await.unwrap();

        let mut got = vec![0u8; msg.len()];
        rx.read_exact(&mut got).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_compressible_data_shrinks_on_wire() {
        let (a, mut wire) = duplex(256 * 1024);
        let mut tx = CompressedStream::new(a);

        let msg = vec![b'a'; 10_000];
        tx.write_all(&msg).await.unwrap();

        let mut raw = vec![0u8; 16 * 1024];
        let n = wire.read(&mut raw).await.unwrap();
        assert!(n < msg.len() / 2, "block not compressed: {} bytes", n);
        assert_eq!(raw[4], 1);
    }

    #[tokio::test]
    async fn test_incompressible_data_stored() {
        use rand::RngCore;
        let (a, b) = duplex(256 * 1024);
        let mut tx = CompressedStream::new(a);
        let mut rx = CompressedStream::new(b);

        let mut msg = vec![0u8; 4096];
        rand::rngs::OsRng.fill_bytes(&mut msg);
        tx.write_all(&msg).await.unwrap();

        let mut got = vec![0u8; msg.len()];
        rx.read_exact(&mut got).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_large_payload_chunked() {
        let (a, b) = duplex(1024 * 1024);
        let mut tx = CompressedStream::new(a);
        let mut rx = CompressedStream::new(b);

        let msg: Vec<u8> = (0..600_000u32).map(|i| (i % 253) as u8).collect();
        let expected = msg.clone();
        let writer = tokio::spawn(async move {
            tx.write_all(&msg).await.unwrap();
        });

        let mut got = vec![0u8; expected.len()];
        rx.read_exact(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_oversized_block_rejected() {
        let (mut inject, b) = duplex(1024);
        let mut hdr = ((MAX_BLOCK + 1) as u32).to_be_bytes().to_vec();
        hdr.push(1);
        inject.write_all(&hdr).await.unwrap();

        let mut rx = CompressedStream::new(b);
        let mut buf = [0u8; 16];
        let err = rx.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
