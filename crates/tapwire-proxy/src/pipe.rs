use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::connection::ConnContext;

const PIPE_BUFFER_BYTES: usize = 64 * 1024;

/// The CONNECT handler's half of a tunnel: the byte channel it copies the
/// hijacked socket into, and a completion signal that resolves once the
/// interceptor side has dropped its end (i.e. all inner exchanges are
/// done), so disconnect hooks can fire strictly after them.
pub(crate) struct PipeHandle {
    pub(crate) client_io: DuplexStream,
    pub(crate) session_closed: oneshot::Receiver<()>,
}

/// The interceptor's half: an in-memory duplex stream with a
/// non-consuming peek, carrying the CONNECT target, the client's remote
/// address, and the owning connection context.
pub(crate) struct PipeConn {
    io: DuplexStream,
    peeked: Vec<u8>,
    connect_authority: String,
    client_addr: SocketAddr,
    context: Arc<ConnContext>,
    _session: oneshot::Sender<()>,
}

pub(crate) fn pipe_pair(
    connect_authority: String,
    client_addr: SocketAddr,
    context: Arc<ConnContext>,
) -> (PipeHandle, PipeConn) {
    let (client_io, server_io) = duplex(PIPE_BUFFER_BYTES);
    let (session_tx, session_rx) = oneshot::channel();
    let handle = PipeHandle {
        client_io,
        session_closed: session_rx,
    };
    let conn = PipeConn {
        io: server_io,
        peeked: Vec::new(),
        connect_authority,
        client_addr,
        context,
        _session: session_tx,
    };
    (handle, conn)
}

impl PipeConn {
    /// Returns the next `len` bytes without consuming them; subsequent
    /// reads see the same bytes again.
    pub(crate) async fn peek(&mut self, len: usize) -> io::Result<&[u8]> {
        while self.peeked.len() < len {
            let mut chunk = [0_u8; 256];
            let read = self.io.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "tunnel closed before peek completed",
                ));
            }
            self.peeked.extend_from_slice(&chunk[..read]);
        }
        Ok(&self.peeked[..len])
    }

    pub(crate) fn connect_authority(&self) -> &str {
        &self.connect_authority
    }

    pub(crate) fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub(crate) fn context(&self) -> &Arc<ConnContext> {
        &self.context
    }
}

impl AsyncRead for PipeConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.peeked.is_empty() {
            let take = this.peeked.len().min(buf.remaining());
            buf.put_slice(&this.peeked[..take]);
            this.peeked.drain(..take);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Mock listener for the embedded TLS server: `accept` blocks on the
/// hand-off channel the interceptor pushes classified pipes into, and
/// yields `None` only when every sender is gone.
pub(crate) struct PipeListener {
    receiver: mpsc::Receiver<PipeConn>,
}

impl PipeListener {
    pub(crate) async fn accept(&mut self) -> Option<PipeConn> {
        self.receiver.recv().await
    }
}

pub(crate) fn pipe_listener(capacity: usize) -> (mpsc::Sender<PipeConn>, PipeListener) {
    let (sender, receiver) = mpsc::channel(capacity);
    (sender, PipeListener { receiver })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::pipe_pair;
    use crate::connection::ConnContext;

    fn test_pair() -> (super::PipeHandle, super::PipeConn) {
        let remote = "127.0.0.1:4242".parse().expect("addr");
        pipe_pair(
            "origin:443".to_string(),
            remote,
            Arc::new(ConnContext::new(remote)),
        )
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let (mut handle, mut conn) = test_pair();
        handle.client_io.write_all(b"hello").await.expect("write");

        let peeked = conn.peek(3).await.expect("peek").to_vec();
        assert_eq!(peeked, b"hel");

        let mut read = [0_u8; 5];
        conn.read_exact(&mut read).await.expect("read");
        assert_eq!(&read, b"hello");
    }

    #[tokio::test]
    async fn closing_the_client_end_fails_a_pending_peek() {
        let (handle, mut conn) = test_pair();
        drop(handle.client_io);
        let error = conn.peek(3).await.expect_err("peek must fail");
        assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn dropping_the_pipe_resolves_the_session_signal() {
        let (handle, conn) = test_pair();
        drop(conn);
        // the sender side is gone, so the receiver resolves with an error
        assert!(handle.session_closed.await.is_err());
    }
}
