//! Client connection idle deadline
//!
//! Wraps an accepted socket so that a connection sitting idle in both
//! directions fails with `TimedOut` and gets closed. CONNECT tunnels manage
//! their own lifecycle, so the deadline can be switched off mid-connection
//! through an [`IdleToken`] once the tunnel is installed.

use std::{
    future::Future,
    io::{self, IoSlice},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{self, Instant, Sleep},
};

/// Handle that switches the paired [`IdleStream`]'s deadline off
#[derive(Clone)]
pub struct IdleToken {
    armed: Arc<AtomicBool>,
}

impl IdleToken {
    /// Stops the deadline from firing for the rest of the connection
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Relaxed);
    }
}

/// Stream that fails with `TimedOut` when both directions sit idle
///
/// One deadline is shared by reads and writes; progress in either direction
/// pushes it forward. The shared `Sleep` remembers a single waker, which is
/// fine here because hyper drives both directions from one task.
#[pin_project]
pub struct IdleStream<S> {
    #[pin]
    stream: S,
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
    active: bool,
    armed: Arc<AtomicBool>,
}

impl<S> IdleStream<S> {
    /// Wraps `stream`, returning the stream and its disarm token
    pub fn new(stream: S, timeout: Duration) -> (IdleStream<S>, IdleToken) {
        let armed = Arc::new(AtomicBool::new(true));
        let token = IdleToken { armed: armed.clone() };

        let stream = IdleStream {
            stream,
            timeout,
            sleep: Box::pin(time::sleep_until(Instant::now())),
            active: false,
            armed,
        };

        (stream, token)
    }
}

fn poll_deadline(
    sleep: &mut Pin<Box<Sleep>>,
    active: &mut bool,
    armed: &AtomicBool,
    timeout: Duration,
    cx: &mut Context<'_>,
) -> io::Result<()> {
    if !armed.load(Ordering::Relaxed) {
        return Ok(());
    }

    if !*active {
        sleep.as_mut().reset(Instant::now() + timeout);
        *active = true;
    }

    match sleep.as_mut().poll(cx) {
        Poll::Ready(()) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        Poll::Pending => Ok(()),
    }
}

impl<S> AsyncRead for IdleStream<S>
where
    S: AsyncRead,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();

        let r = this.stream.poll_read(cx, buf);
        match r {
            Poll::Ready(..) => *this.active = false,
            Poll::Pending => poll_deadline(this.sleep, this.active, this.armed, *this.timeout, cx)?,
        }
        r
    }
}

impl<S> AsyncWrite for IdleStream<S>
where
    S: AsyncWrite,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();

        let r = this.stream.poll_write(cx, buf);
        match r {
            Poll::Ready(..) => *this.active = false,
            Poll::Pending => poll_deadline(this.sleep, this.active, this.armed, *this.timeout, cx)?,
        }
        r
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();

        let r = this.stream.poll_write_vectored(cx, bufs);
        match r {
            Poll::Ready(..) => *this.active = false,
            Poll::Pending => poll_deadline(this.sleep, this.active, this.armed, *this.timeout, cx)?,
        }
        r
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn read_times_out_when_armed() {
        let (client, _server) = tokio::io::duplex(64);
        let (mut stream, _token) = IdleStream::new(client, Duration::from_millis(50));

        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn disarmed_stream_keeps_waiting() {
        let (client, mut server) = tokio::io::duplex(64);
        let (mut stream, token) = IdleStream::new(client, Duration::from_millis(50));
        token.disarm();

        let write = tokio::spawn(async move {
            time::sleep(Duration::from_millis(150)).await;
            use tokio::io::AsyncWriteExt;
            server.write_all(b"late").await.unwrap();
        });

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late");
        write.await.unwrap();
    }
}
