//! Length-prefixed framing used on the stack-facing end of a [`crate::link::DuplexLink`].
//!
//! Wire format, repeated:
//!
//! ```text
//! length (u32 BE) | payload (length bytes)
//! ```
//!
//! No padding, no checksum. The WebSocket side needs no prefix because WebSocket messages are
//! already delimited.

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use crate::{
    relay::{FrameSink, FrameSource},
    RelayError,
};

pub const PREFIX_LEN: usize = 4;

/// Largest payload accepted in either direction unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed inside a length prefix ({got} of {PREFIX_LEN} bytes)")]
    TruncatedHeader { got: usize },

    #[error("stream closed inside a frame body ({got} of {expected} bytes)")]
    TruncatedBody { expected: usize, got: usize },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(u32::MAX as usize),
        }
    }

    fn check_len(&self, len: usize) -> Result<(), FrameError> {
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

fn declared_len(src: &[u8]) -> usize {
    u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }
        let len = declared_len(src);
        self.check_len(len)?;

        let total = PREFIX_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        Ok(Some(src.split_to(len)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        match src.len() {
            0 => Ok(None),
            got if got < PREFIX_LEN => Err(FrameError::TruncatedHeader { got }),
            got => Err(FrameError::TruncatedBody {
                expected: declared_len(src),
                got: got - PREFIX_LEN,
            }),
        }
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: T, dst: &mut BytesMut) -> Result<(), FrameError> {
        let frame = frame.as_ref();
        self.check_len(frame.len())?;

        dst.reserve(PREFIX_LEN + frame.len());
        dst.put_u32(frame.len() as u32);
        dst.extend_from_slice(frame);
        Ok(())
    }
}

#[async_trait]
impl<R> FrameSource for FramedRead<R, FrameCodec>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        match self.next().await {
            Some(Ok(frame)) => Ok(Some(frame.to_vec())),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<W> FrameSink for FramedWrite<W, FrameCodec>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), RelayError> {
        SinkExt::send(self, frame).await.map_err(Into::into)
    }

    async fn close(&mut self) {
        let _ = SinkExt::<Vec<u8>>::close(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn encode(codec: &mut FrameCodec, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode(payload, &mut buf).unwrap();
        buf
    }

    #[test]
    fn encodes_big_endian_prefix() {
        let mut codec = FrameCodec::default();
        let buf = encode(&mut codec, b"abc");
        assert_eq!(&buf[..], &[0, 0, 0, 3, b'a', b'b', b'c']);

        let buf = encode(&mut codec, b"");
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn round_trips_boundary_lengths() {
        let mut codec = FrameCodec::default();
        for len in [0usize, 1, 1514, 65535] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut buf = encode(&mut codec, &payload);
            let frame = codec.decode(&mut buf).unwrap().expect("complete frame");
            assert_eq!(&frame[..], &payload[..], "len={len}");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn waits_for_partial_prefix_and_body() {
        let mut codec = FrameCodec::default();
        let full = encode(&mut codec, b"hello world");

        let mut buf = BytesMut::from(&full[..2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[2..8]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[8..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"hello world");
    }

    #[test]
    fn eof_on_frame_boundary_is_clean() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn eof_inside_prefix_is_truncated_header() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 1][..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::TruncatedHeader { got: 3 }), "{err:?}");
    }

    #[test]
    fn eof_inside_body_is_truncated_body() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, 1, 2, 3][..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(
            matches!(err, FrameError::TruncatedBody { expected: 10, got: 3 }),
            "{err:?}"
        );
    }

    #[test]
    fn rejects_oversized_frames_both_ways() {
        let mut codec = FrameCodec::new(8);

        let mut buf = BytesMut::from(&[0u8, 0, 0, 9][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLarge { len: 9, max: 8 })
        ));

        let mut out = BytesMut::new();
        assert!(matches!(
            codec.encode(&[0u8; 9][..], &mut out),
            Err(FrameError::TooLarge { len: 9, max: 8 })
        ));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn truncated_stream_ends_with_error_and_no_partial_frame() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut frames = FramedRead::new(reader, FrameCodec::default());

        writer.write_all(&[0, 0, 0, 2, 0xAA, 0xBB]).await.unwrap();
        writer.write_all(&[0, 0, 0, 5, 0x01]).await.unwrap();
        drop(writer);

        assert_eq!(frames.recv().await.unwrap(), Some(vec![0xAA, 0xBB]));
        let err = frames.recv().await.unwrap_err();
        assert!(
            matches!(
                err,
                RelayError::Frame(FrameError::TruncatedBody { expected: 5, got: 1 })
            ),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn framed_halves_carry_frames_in_order() {
        let (a, b) = tokio::io::duplex(16);
        let mut sink = FramedWrite::new(a, FrameCodec::default());
        let mut source = FramedRead::new(b, FrameCodec::default());

        let writer = tokio::spawn(async move {
            for i in 0..50u8 {
                FrameSink::send(&mut sink, vec![i; i as usize])
                    .await
                    .unwrap();
            }
            FrameSink::close(&mut sink).await;
        });

        for i in 0..50u8 {
            assert_eq!(source.recv().await.unwrap(), Some(vec![i; i as usize]));
        }
        assert_eq!(source.recv().await.unwrap(), None);
        writer.await.unwrap();
    }
}
