//! Bidirectional copy with live byte accounting
//!
//! Each direction adds to a shared counter as soon as bytes are written, so
//! a stats poll sees traffic on long-lived connections before they close.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Default relay buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Result of a bidirectional copy operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes transferred from client to upstream
    pub client_to_upstream: u64,
    /// Bytes transferred from upstream to client
    pub upstream_to_client: u64,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

struct BidirectionalCopy<'a, A, B> {
    a: &'a mut A,
    b: &'a mut B,
    a_to_b: TransferState<'a>,
    b_to_a: TransferState<'a>,
}

/// State for one direction of transfer
struct TransferState<'a> {
    buf: Box<[u8]>,
    read_done: bool,
    write_done: bool,
    finished: bool,
    pos: usize,
    cap: usize,
    bytes_transferred: u64,
    live: &'a AtomicU64,
}

impl<'a> TransferState<'a> {
    fn new(buf_size: usize, live: &'a AtomicU64) -> Self {
        Self {
            buf: vec![0u8; buf_size].into_boxed_slice(),
            read_done: false,
            write_done: false,
            finished: false,
            pos: 0,
            cap: 0,
            bytes_transferred: 0,
            live,
        }
    }

    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            if self.pos < self.cap {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };
                self.pos += n;
                self.bytes_transferred += n as u64;
                self.live.fetch_add(n as u64, Ordering::Relaxed);

                if self.pos == self.cap {
                    self.pos = 0;
                    self.cap = 0;
                }
            } else if self.read_done {
                if !self.write_done {
                    match writer.as_mut().poll_flush(cx) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    match writer.as_mut().poll_shutdown(cx) {
                        Poll::Ready(Ok(())) => self.write_done = true,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                return Poll::Ready(Ok(()));
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

impl<A, B> std::future::Future for BidirectionalCopy<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    type Output = io::Result<CopyResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if !this.a_to_b.finished {
            match this
                .a_to_b
                .poll_transfer(cx, Pin::new(&mut *this.a), Pin::new(&mut *this.b))
            {
                Poll::Ready(Ok(())) => this.a_to_b.finished = true,
                Poll::Ready(Err(e)) => {
                    debug!("client->upstream transfer error: {}", e);
                    this.a_to_b.finished = true;
                }
                Poll::Pending => {}
            }
        }

        if !this.b_to_a.finished {
            match this
                .b_to_a
                .poll_transfer(cx, Pin::new(&mut *this.b), Pin::new(&mut *this.a))
            {
                Poll::Ready(Ok(())) => this.b_to_a.finished = true,
                Poll::Ready(Err(e)) => {
                    debug!("upstream->client transfer error: {}", e);
                    this.b_to_a.finished = true;
                }
                Poll::Pending => {}
            }
        }

        if this.a_to_b.finished && this.b_to_a.finished {
            Poll::Ready(Ok(CopyResult {
                client_to_upstream: this.a_to_b.bytes_transferred,
                upstream_to_client: this.b_to_a.bytes_transferred,
            }))
        } else {
            Poll::Pending
        }
    }
}

/// Copy in both directions until both reach EOF or fail
///
/// `inbound` accumulates client-to-upstream bytes and `outbound`
/// upstream-to-client bytes while the copy runs.
pub async fn relay<A, B>(
    client: &mut A,
    upstream: &mut B,
    inbound: &AtomicU64,
    outbound: &AtomicU64,
) -> io::Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    BidirectionalCopy {
        a: client,
        b: upstream,
        a_to_b: TransferState::new(DEFAULT_BUFFER_SIZE, inbound),
        b_to_a: TransferState::new(DEFAULT_BUFFER_SIZE, outbound),
    }
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_relay_counts_both_directions() {
        let (mut client_outer, mut client_inner) = duplex(1024);
        let (mut upstream_inner, mut upstream_outer) = duplex(1024);

        let inbound = AtomicU64::new(0);
        let outbound = AtomicU64::new(0);

        let peers = async {
            client_outer.write_all(b"hello").await.unwrap();
            client_outer.shutdown().await.unwrap();

            let mut got = [0u8; 5];
            upstream_outer.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"hello");

            upstream_outer.write_all(b"world!").await.unwrap();
            upstream_outer.shutdown().await.unwrap();

            let mut back = Vec::new();
            client_outer.read_to_end(&mut back).await.unwrap();
            assert_eq!(back, b"world!");
        };

        let copy = relay(&mut client_inner, &mut upstream_inner, &inbound, &outbound);
        let (result, ()) = tokio::join!(copy, peers);
        let result = result.unwrap();

        assert_eq!(result.client_to_upstream, 5);
        assert_eq!(result.upstream_to_client, 6);
        assert_eq!(result.total(), 11);
        assert_eq!(inbound.load(Ordering::Relaxed), 5);
        assert_eq!(outbound.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn test_copy_result_total() {
        let result = CopyResult {
            client_to_upstream: 100,
            upstream_to_client: 200,
        };
        assert_eq!(result.total(), 300);
    }
}
