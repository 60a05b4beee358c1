//! A thin wrapper that keeps a [`LoopbackScheduler`]'s live-session count
//! accurate by decrementing it when the wrapped pipe is dropped, the way
//! `picomux::Stream` itself enqueues a FIN frame via `scopeguard::defer!`
//! when its own task ends.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{AsyncRead, AsyncWrite};
use pin_project::pin_project;
use sillad::Pipe;

use crate::scheduler::LoopbackScheduler;

#[pin_project(PinnedDrop)]
pub struct TrackedPipe<P: Pipe> {
    #[pin]
    inner: P,
    scheduler: Arc<LoopbackScheduler>,
}

impl<P: Pipe> TrackedPipe<P> {
    pub fn new(inner: P, scheduler: Arc<LoopbackScheduler>) -> Self {
        scheduler.note_session_opened();
        Self { inner, scheduler }
    }
}

#[pin_project::pinned_drop]
impl<P: Pipe> PinnedDrop for TrackedPipe<P> {
    fn drop(self: Pin<&mut Self>) {
        self.scheduler.note_session_closed();
    }
}

impl<P: Pipe> AsyncRead for TrackedPipe<P> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<P: Pipe> AsyncWrite for TrackedPipe<P> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_close(cx)
    }
}

impl<P: Pipe> Pipe for TrackedPipe<P> {
    fn shared_secret(&self) -> Option<&[u8]> {
        self.inner.shared_secret()
    }

    fn protocol(&self) -> &str {
        self.inner.protocol()
    }

    fn remote_addr(&self) -> Option<&str> {
        self.inner.remote_addr()
    }
}
