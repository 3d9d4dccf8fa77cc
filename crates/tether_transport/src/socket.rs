//! Shared-socket I/O halves.
//!
//! The reader, the writer and the liveness guard all need the same socket
//! at the same time, and the guard must be able to peek without consuming.
//! These halves drive a shared `TcpStream` through its readiness API.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Read half over a shared socket.
#[derive(Debug, Clone)]
pub(crate) struct SocketReader {
    socket: Arc<TcpStream>,
}

/// Write half over a shared socket.
#[derive(Debug, Clone)]
pub(crate) struct SocketWriter {
    socket: Arc<TcpStream>,
}

pub(crate) fn split(socket: &Arc<TcpStream>) -> (SocketReader, SocketWriter) {
    (
        SocketReader {
            socket: Arc::clone(socket),
        },
        SocketWriter {
            socket: Arc::clone(socket),
        },
    )
}

impl AsyncRead for SocketReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            ready!(self.socket.poll_read_ready(cx))?;
            match self.socket.try_read(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

impl AsyncWrite for SocketWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            ready!(self.socket.poll_write_ready(cx))?;
            match self.socket.try_write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                result => return Poll::Ready(result),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The socket closes once every half has been dropped.
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn halves_share_one_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = Arc::new(client.unwrap());
        let (mut server, _) = accepted.unwrap();

        let (mut reader, mut writer) = split(&client);
        writer.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        let mut peeked = [0u8; 4];
        let n = client.peek(&mut peeked).await.unwrap();
        assert!(n > 0);
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
