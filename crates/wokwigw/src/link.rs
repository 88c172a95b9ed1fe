//! In-memory byte-stream pair handed to the network-stack collaborator.
//!
//! One end (`near`) is given to the collaborator as a guest attachment; the relay owns the other
//! (`far`). Closing either end is idempotent and the peer observes EOF.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// Per-direction buffer of the in-memory pipe.
pub const DEFAULT_LINK_CAPACITY: usize = 64 * 1024;

pub struct DuplexLink;

impl DuplexLink {
    /// Create a connected `(near, far)` pair.
    pub fn pair(capacity: usize) -> (LinkEnd, LinkEnd) {
        let (near, far) = tokio::io::duplex(capacity);
        (LinkEnd::new(near), LinkEnd::new(far))
    }
}

#[derive(Debug)]
pub struct LinkEnd {
    inner: Option<DuplexStream>,
}

impl LinkEnd {
    fn new(stream: DuplexStream) -> Self {
        Self {
            inner: Some(stream),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Release this end. Safe to call any number of times.
    pub fn close(&mut self) {
        self.inner = None;
    }

    fn stream(&mut self) -> io::Result<Pin<&mut DuplexStream>> {
        match self.inner.as_mut() {
            Some(stream) => Ok(Pin::new(stream)),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "link end closed")),
        }
    }
}

impl AsyncRead for LinkEnd {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => stream.poll_read(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl AsyncWrite for LinkEnd {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream() {
            Ok(stream) => stream.poll_write(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => stream.poll_flush(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.inner.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            // Already closed; shutting down again is a no-op.
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn carries_bytes_both_ways() {
        let (mut near, mut far) = DuplexLink::pair(DEFAULT_LINK_CAPACITY);

        near.write_all(&42u32.to_be_bytes()).await.unwrap();
        assert_eq!(far.read_u32().await.unwrap(), 42);

        far.write_all(&33u32.to_be_bytes()).await.unwrap();
        assert_eq!(near.read_u32().await.unwrap(), 33);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_peer_sees_eof() {
        let (mut near, mut far) = DuplexLink::pair(DEFAULT_LINK_CAPACITY);

        far.close();
        far.close();
        assert!(far.is_closed());
        far.shutdown().await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(near.read(&mut buf).await.unwrap(), 0);

        let err = far.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        let err = far.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn closing_unblocks_pending_peer_read() {
        let (mut near, mut far) = DuplexLink::pair(DEFAULT_LINK_CAPACITY);

        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            near.read_to_end(&mut buf).await.map(|_| buf)
        });

        far.write_all(b"tail").await.unwrap();
        far.close();

        let buf = reader.await.unwrap().unwrap();
        assert_eq!(buf, b"tail");
    }
}
