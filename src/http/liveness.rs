use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Whether an inbound connection is still usable.
#[derive(Debug, Clone, Default)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.0.store(true, Ordering::Release);
    }
}

struct CloseOnDrop(Liveness);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.mark_closed();
    }
}

/// IO wrapper flagging its [`Liveness`] closed on EOF, on any IO error, on shutdown and on drop.
#[pin_project]
pub struct TrackedIo<IO> {
    #[pin]
    inner: IO,
    guard: CloseOnDrop,
}

impl<IO> TrackedIo<IO> {
    pub fn new(inner: IO) -> (Self, Liveness) {
        let liveness = Liveness::new();
        let io = Self {
            inner,
            guard: CloseOnDrop(liveness.clone()),
        };
        (io, liveness)
    }

    pub fn get_ref(&self) -> &IO {
        &self.inner
    }
}

fn track<T>(liveness: &Liveness, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
    if let Poll::Ready(Err(_)) = poll {
        liveness.mark_closed();
    }
    poll
}

impl<IO: AsyncRead> AsyncRead for TrackedIo<IO> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let wanted = buf.remaining() > 0;

        let poll = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            if wanted && buf.filled().len() == before {
                this.guard.0.mark_closed();
            }
        }
        track(&this.guard.0, poll)
    }
}

impl<IO: AsyncWrite> AsyncWrite for TrackedIo<IO> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        track(&this.guard.0, this.inner.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        track(&this.guard.0, this.inner.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        let poll = this.inner.poll_shutdown(cx);
        if poll.is_ready() {
            this.guard.0.mark_closed();
        }
        poll
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        track(&this.guard.0, this.inner.poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_eof_marks_closed() {
        let (client, server) = tokio::io::duplex(64);
        let (mut tracked, liveness) = TrackedIo::new(server);

        let mut client = client;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tracked.read_exact(&mut buf).await.unwrap();
        assert!(!liveness.is_closed());

        drop(client);
        assert_eq!(tracked.read(&mut buf).await.unwrap(), 0);
        assert!(liveness.is_closed());
    }

    #[tokio::test]
    async fn test_drop_marks_closed() {
        let (_client, server) = tokio::io::duplex(64);
        let (tracked, liveness) = TrackedIo::new(server);
        assert!(!liveness.is_closed());
        drop(tracked);
        assert!(liveness.is_closed());
    }
}
