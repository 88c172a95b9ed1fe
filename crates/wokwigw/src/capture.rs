//! Passive packet capture to a libpcap file.
//!
//! One sink is opened per backend at setup and shared by every connection's relay tasks.
//! Capture never affects the data path: a failed write is logged and the record skipped.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
    sync::Mutex,
};
use wokwigw_pcap::{LinkType, DEFAULT_SNAPLEN};

use crate::{relay::FrameSink, RelayError};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("error creating PCAP file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error writing PCAP header: {0}")]
    Header(#[source] std::io::Error),

    #[error("error writing to PCAP file: {0}")]
    Write(#[source] std::io::Error),

    #[error("error flushing PCAP file: {0}")]
    Flush(#[source] std::io::Error),
}

#[derive(Debug)]
pub struct PacketCaptureSink {
    path: PathBuf,
    snaplen: u32,
    writer: Mutex<Option<BufWriter<File>>>,
    records: AtomicU64,
}

impl PacketCaptureSink {
    /// Create (truncating) `path` and write the Ethernet global header.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .await
            .map_err(|source| CaptureError::Create {
                path: path.clone(),
                source,
            })?;

        let mut writer = BufWriter::new(file);
        let header = wokwigw_pcap::file_header(DEFAULT_SNAPLEN, LinkType::Ethernet);
        writer
            .write_all(&header)
            .await
            .map_err(CaptureError::Header)?;
        writer.flush().await.map_err(CaptureError::Header)?;

        Ok(Self {
            path,
            snaplen: DEFAULT_SNAPLEN,
            writer: Mutex::new(Some(writer)),
            records: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records successfully written so far.
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// Append one frame, timestamped now. Ignored once the sink is closed.
    pub async fn record(&self, frame: &[u8]) {
        if let Err(err) = self.try_record(frame).await {
            tracing::warn!(path = %self.path.display(), "{err}");
        }
    }

    async fn try_record(&self, frame: &[u8]) -> Result<(), CaptureError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let record = wokwigw_pcap::packet_record(timestamp, frame, self.snaplen);

        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Ok(());
        };
        writer
            .write_all(&record)
            .await
            .map_err(CaptureError::Write)?;
        self.records.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush and release the file. Later calls are no-ops.
    pub async fn close(&self) -> Result<(), CaptureError> {
        let Some(mut writer) = self.writer.lock().await.take() else {
            return Ok(());
        };
        writer.flush().await.map_err(CaptureError::Flush)?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(CaptureError::Flush)
    }
}

/// Sink decorator that records each frame the inner sink accepted.
pub struct Captured<K> {
    inner: K,
    capture: Option<Arc<PacketCaptureSink>>,
}

impl<K> Captured<K> {
    pub fn new(inner: K, capture: Option<Arc<PacketCaptureSink>>) -> Self {
        Self { inner, capture }
    }
}

#[async_trait]
impl<K: FrameSink> FrameSink for Captured<K> {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), RelayError> {
        let Some(capture) = &self.capture else {
            return self.inner.send(frame).await;
        };
        let copy = frame.clone();
        self.inner.send(frame).await?;
        capture.record(&copy).await;
        Ok(())
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_header_then_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcap");

        let sink = PacketCaptureSink::create(&path).await.unwrap();
        sink.record(b"first frame").await;
        sink.record(&[0xFF; 70_000]).await;
        sink.record(b"").await;
        assert_eq!(sink.records(), 3);
        sink.close().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let (header, records) = wokwigw_pcap::parse(&bytes).unwrap();
        assert_eq!(header.link_type, LinkType::Ethernet);
        assert_eq!(header.snaplen, DEFAULT_SNAPLEN);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].data, b"first frame");
        assert_eq!(records[1].orig_len, 70_000);
        assert_eq!(records[1].data.len(), DEFAULT_SNAPLEN as usize);
        assert!(records[2].data.is_empty());
        assert!(records[0].timestamp <= records[2].timestamp);
    }

    #[tokio::test]
    async fn records_after_close_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.pcap");

        let sink = PacketCaptureSink::create(&path).await.unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();
        sink.record(b"late").await;
        assert_eq!(sink.records(), 0);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), wokwigw_pcap::FILE_HEADER_LEN);
    }

    struct RefusingSink;

    #[async_trait]
    impl FrameSink for RefusingSink {
        async fn send(&mut self, _: Vec<u8>) -> Result<(), RelayError> {
            Err(RelayError::Closed)
        }
    }

    #[tokio::test]
    async fn only_delivered_frames_are_captured() {
        let dir = tempfile::tempdir().unwrap();
        let capture = Arc::new(
            PacketCaptureSink::create(dir.path().join("refused.pcap"))
                .await
                .unwrap(),
        );

        let mut refused = Captured::new(RefusingSink, Some(capture.clone()));
        let err = refused.send(vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, RelayError::Closed), "{err:?}");
        assert_eq!(capture.records(), 0);

        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(1);
        let mut delivered = Captured::new(tx, Some(capture.clone()));
        delivered.send(vec![4, 5]).await.unwrap();
        assert_eq!(rx.recv().await, Some(vec![4, 5]));
        assert_eq!(capture.records(), 1);
    }

    #[tokio::test]
    async fn create_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("capture.pcap");

        let err = PacketCaptureSink::create(&path).await.unwrap_err();
        assert!(matches!(err, CaptureError::Create { .. }), "{err:?}");
    }
}
