//! Recording reader used by the mock target to keep every byte a client sent.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

pin_project! {
    /// A wrapper around an AsyncRead that appends everything it yields to an
    /// in-memory buffer.
    pub struct CaptureReader<R> {
        #[pin]
        inner: R,
        captured: Vec<u8>,
    }
}

impl<R> CaptureReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            captured: Vec::new(),
        }
    }

    pub fn captured(&self) -> &[u8] {
        &self.captured
    }

    /// Consumes the wrapper and returns the reader and the recorded bytes.
    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.captured)
    }
}

impl<R: AsyncRead> AsyncRead for CaptureReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let res = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            this.captured.extend_from_slice(&buf.filled()[before..]);
        }
        res
    }
}
