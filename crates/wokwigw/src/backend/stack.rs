use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::{io::ReadHalf, sync::Mutex, task::JoinHandle};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::Instrument;

use super::{close_capture, open_capture, relay_captured};
use crate::{
    capture::PacketCaptureSink,
    codec::FrameCodec,
    config::StackOptions,
    link::{DuplexLink, LinkEnd, DEFAULT_LINK_CAPACITY},
    relay::{FrameSink, FrameSource},
    stack::{NetworkStack, StackError, StackFactory},
    CleanupErrors, RelayError, SetupError,
};

/// Frames the stack writes to its end of the link.
///
/// The stack drops its end when `accept_guest` returns, so end of stream is where the
/// attachment's outcome is collected: a failed attachment ends the connection with its error.
struct AttachedSource {
    frames: FramedRead<ReadHalf<LinkEnd>, FrameCodec>,
    attachment: Option<JoinHandle<Result<(), StackError>>>,
}

#[async_trait]
impl FrameSource for AttachedSource {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        if let Some(frame) = self.frames.recv().await? {
            return Ok(Some(frame));
        }
        let Some(attachment) = self.attachment.as_mut() else {
            return Ok(None);
        };
        // Still owned by `self` while pending, so a cancelled relay aborts it on drop.
        let outcome = attachment.await;
        self.attachment = None;
        match outcome {
            Ok(Ok(())) => Ok(None),
            Ok(Err(err)) => Err(RelayError::Stack(err)),
            Err(err) if err.is_panic() => Err(RelayError::TaskPanicked),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for AttachedSource {
    fn drop(&mut self) {
        // The relay is over; the attachment has nothing left to serve.
        if let Some(attachment) = self.attachment.take() {
            attachment.abort();
        }
    }
}

#[derive(Clone)]
struct Resources {
    stack: Arc<dyn NetworkStack>,
    capture: Option<Arc<PacketCaptureSink>>,
}

pub struct StackBackend {
    options: StackOptions,
    factory: Arc<dyn StackFactory>,
    resources: Mutex<Option<Resources>>,
    setup_done: AtomicBool,
    shutdown: CancellationToken,
}

impl fmt::Debug for StackBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackBackend")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl StackBackend {
    pub fn new(options: StackOptions, factory: Arc<dyn StackFactory>) -> Self {
        Self {
            options,
            factory,
            resources: Mutex::new(None),
            setup_done: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub(super) async fn setup(&self) -> Result<(), SetupError> {
        if self.setup_done.swap(true, Ordering::AcqRel) {
            return Err(SetupError::AlreadySetUp);
        }

        let stack = self.factory.create(&self.options.stack).await?;
        let capture = match open_capture(self.options.capture_file.as_deref()).await {
            Ok(capture) => capture,
            Err(err) => {
                if let Err(err) = stack.shutdown().await {
                    tracing::warn!("network stack shutdown after failed setup: {err}");
                }
                return Err(err.into());
            }
        };

        *self.resources.lock().await = Some(Resources { stack, capture });
        tracing::info!(
            forwards = self.options.stack.forwards.len(),
            "network stack attached"
        );
        Ok(())
    }

    pub(super) async fn handle_connection<R, W>(&self, source: R, sink: W) -> Result<(), RelayError>
    where
        R: FrameSource + 'static,
        W: FrameSink + 'static,
    {
        let Some(Resources { stack, capture }) = self.resources.lock().await.clone() else {
            return Err(RelayError::NotSetUp);
        };

        let (near, far) = DuplexLink::pair(DEFAULT_LINK_CAPACITY);
        let attachment =
            tokio::spawn(async move { stack.accept_guest(near).await }.in_current_span());

        let codec = FrameCodec::new(self.options.max_frame_len);
        let (far_read, far_write) = tokio::io::split(far);
        let from_stack = AttachedSource {
            frames: FramedRead::new(far_read, codec),
            attachment: Some(attachment),
        };
        let to_stack = FramedWrite::new(far_write, codec);

        relay_captured(&self.shutdown, capture, (source, sink), (from_stack, to_stack)).await
    }

    pub(super) async fn cleanup(&self) -> Result<(), CleanupErrors> {
        self.shutdown.cancel();

        let mut errors = CleanupErrors::default();
        if let Some(Resources { stack, capture }) = self.resources.lock().await.take() {
            if let Err(err) = stack.shutdown().await {
                errors.push(err);
            }
            close_capture(capture, &mut errors).await;
        }
        errors.into_result()
    }
}
