//! Presents a session as a TCP-like byte stream.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::config::MAX_CHUNK_SIZE;
use crate::dial;
use crate::session::Session;

/// A bidirectional byte stream over a tunnel session, usable wherever a
/// TCP-like `AsyncRead + AsyncWrite` stream is expected.
///
/// Reads pull one data-channel frame at a time into an internal buffer and
/// serve it out in caller-sized pieces. Writes are chunked at the maximum
/// message size and honor the channel's backpressure. Shutdown drains the
/// buffered amount (bounded), closes the peer, and on dialed streams issues
/// the DELETE for the signaling resource.
pub struct WhetStream {
    session: Arc<Session>,
    buf: Vec<u8>,
    buf_pos: usize,
    buf_len: usize,
    read_eof: bool,
    closed: bool,
    read_fut: Option<BoxFuture<'static, (Vec<u8>, usize)>>,
    write_fut: Option<(usize, BoxFuture<'static, io::Result<()>>)>,
    shutdown_fut: Option<BoxFuture<'static, ()>>,
}

impl WhetStream {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            buf: Vec::new(),
            buf_pos: 0,
            buf_len: 0,
            read_eof: false,
            closed: false,
            read_fut: None,
            write_fut: None,
            shutdown_fut: None,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// There is no underlying socket; both addresses are unknown.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Idempotent close: drain, tear down the session, release the
    /// signaling resource.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        close_session(&self.session).await;
    }
}

async fn close_session(session: &Arc<Session>) {
    if !session.is_closed() {
        session.drain().await;
    }
    session.close().await;
    dial::notify_delete(session).await;
}

impl AsyncRead for WhetStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.buf_pos < self.buf_len {
                let n = (self.buf_len - self.buf_pos).min(out.remaining());
                out.put_slice(&self.buf[self.buf_pos..self.buf_pos + n]);
                self.buf_pos += n;
                return Poll::Ready(Ok(()));
            }
            if self.read_eof {
                return Poll::Ready(Ok(()));
            }

            if self.read_fut.is_none() {
                let session = self.session.clone();
                self.read_fut = Some(Box::pin(async move {
                    let mut frame = vec![0u8; MAX_CHUNK_SIZE];
                    let n = session.receive_raw(&mut frame).await;
                    (frame, n)
                }));
            }
            let Some(fut) = self.read_fut.as_mut() else {
                return Poll::Ready(Ok(()));
            };
            match fut.as_mut().poll(cx) {
                Poll::Ready((frame, n)) => {
                    self.read_fut = None;
                    if n == 0 {
                        self.read_eof = true;
                        return Poll::Ready(Ok(()));
                    }
                    self.buf = frame;
                    self.buf_pos = 0;
                    self.buf_len = n;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WhetStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed",
            )));
        }
        if self.write_fut.is_none() {
            let n = data.len().min(MAX_CHUNK_SIZE);
            let chunk = data[..n].to_vec();
            let session = self.session.clone();
            self.write_fut = Some((
                n,
                Box::pin(async move {
                    session
                        .send_raw(&chunk)
                        .await
                        .map_err(|err| io::Error::new(io::ErrorKind::BrokenPipe, err))
                }),
            ));
        }
        let Some((n, fut)) = self.write_fut.as_mut() else {
            return Poll::Pending;
        };
        let n = *n;
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.write_fut = None;
                Poll::Ready(result.map(|()| n))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // send_raw queues directly into the channel; there is nothing
        // further to flush.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.shutdown_fut.is_none() {
            if self.closed {
                return Poll::Ready(Ok(()));
            }
            self.closed = true;
            let session = self.session.clone();
            self.shutdown_fut = Some(Box::pin(async move {
                close_session(&session).await;
            }));
        }
        let Some(fut) = self.shutdown_fut.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match fut.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.shutdown_fut = None;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for WhetStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhetStream")
            .field("session", &self.session.id())
            .field("buffered", &(self.buf_len - self.buf_pos))
            .field("closed", &self.closed)
            .finish()
    }
}
