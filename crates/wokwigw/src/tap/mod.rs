//! Host TAP interface: every read yields one whole Ethernet frame, every write sends one.
//!
//! The device is a single process-wide resource; connections share it through an `Arc` and
//! each gets its own [`TapReader`]/[`TapWriter`] pair. Dropping the last reference closes the
//! interface.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    relay::{FrameSink, FrameSource},
    RelayError,
};

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::TapDevice;

#[cfg(not(target_os = "linux"))]
mod unsupported;
#[cfg(not(target_os = "linux"))]
pub use unsupported::TapDevice;

/// Large enough for any frame the kernel hands out, jumbo frames included.
pub const READ_BUFFER_LEN: usize = 65536;

pub struct TapReader {
    device: Arc<TapDevice>,
    buf: Box<[u8]>,
}

impl TapReader {
    pub fn new(device: Arc<TapDevice>) -> Self {
        Self {
            device,
            buf: vec![0u8; READ_BUFFER_LEN].into_boxed_slice(),
        }
    }
}

#[async_trait]
impl FrameSource for TapReader {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        let n = self
            .device
            .recv(&mut self.buf)
            .await
            .map_err(RelayError::Tap)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[..n].to_vec()))
    }
}

pub struct TapWriter {
    device: Arc<TapDevice>,
}

impl TapWriter {
    pub fn new(device: Arc<TapDevice>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl FrameSink for TapWriter {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), RelayError> {
        self.device.send(&frame).await.map_err(RelayError::Tap)?;
        Ok(())
    }

    // The interface outlives the connection; nothing to release per connection.
}
