//! The two ways frames leave the gateway.
//!
//! A process runs exactly one [`Backend`]. It is built from configuration, [`Backend::setup`]
//! acquires its transport resource once, every admitted connection goes through
//! [`Backend::handle_connection`], and [`Backend::cleanup`] releases everything at exit.

use std::{net::SocketAddr, path::Path, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    capture::{CaptureError, Captured, PacketCaptureSink},
    config::BackendConfig,
    relay::{relay_in_scope, FrameSink, FrameSource, RelayScope},
    stack::QemuSocketFactory,
    CleanupErrors, RelayError, SetupError,
};

mod bridge;
mod stack;

pub use bridge::BridgeBackend;
pub use stack::StackBackend;

#[derive(Debug)]
pub enum Backend {
    /// User-space network stack reached through an in-memory link per connection.
    Stack(StackBackend),
    /// Host TAP interface shared by every connection.
    Bridge(BridgeBackend),
}

impl Backend {
    /// Stack mode talks to the daemon at the configured endpoint.
    pub fn from_config(config: BackendConfig) -> Self {
        match config {
            BackendConfig::Stack(options) => {
                let factory = QemuSocketFactory::new(options.endpoint.clone(), options.api.clone());
                Self::Stack(StackBackend::new(options, Arc::new(factory)))
            }
            BackendConfig::Bridge(options) => Self::Bridge(BridgeBackend::new(options)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Stack(_) => "stack",
            Self::Bridge(_) => "bridge",
        }
    }

    /// Acquire the transport resource. A second call fails with [`SetupError::AlreadySetUp`].
    pub async fn setup(&self) -> Result<(), SetupError> {
        match self {
            Self::Stack(backend) => backend.setup().await,
            Self::Bridge(backend) => backend.setup().await,
        }
    }

    /// Relay one admitted connection until both directions have finished.
    ///
    /// `source`/`sink` are the client's halves (binary WebSocket messages in production).
    /// Resolves with the first error seen on either side, or `Ok(())` after an orderly close.
    pub async fn handle_connection<R, W>(
        &self,
        source: R,
        sink: W,
        remote: SocketAddr,
    ) -> Result<(), RelayError>
    where
        R: FrameSource + 'static,
        W: FrameSink + 'static,
    {
        let span = tracing::info_span!("connection", %remote, backend = self.name());
        let result = match self {
            Self::Stack(backend) => backend.handle_connection(source, sink).instrument(span).await,
            Self::Bridge(backend) => backend.handle_connection(source, sink).instrument(span).await,
        };
        match &result {
            Ok(()) => tracing::info!(%remote, "connection closed"),
            Err(err) => tracing::warn!(%remote, "connection closed: {err}"),
        }
        result
    }

    /// Tear down live connections and release the transport resource.
    ///
    /// Safe to call when `setup` never ran or failed, and safe to call twice. Every failure is
    /// collected; none hides another.
    pub async fn cleanup(&self) -> Result<(), CleanupErrors> {
        match self {
            Self::Stack(backend) => backend.cleanup().await,
            Self::Bridge(backend) => backend.cleanup().await,
        }
    }
}

async fn open_capture(
    path: Option<&Path>,
) -> Result<Option<Arc<PacketCaptureSink>>, CaptureError> {
    let Some(path) = path else {
        return Ok(None);
    };
    let sink = PacketCaptureSink::create(path).await?;
    tracing::info!(path = %path.display(), "capturing frames");
    Ok(Some(Arc::new(sink)))
}

async fn close_capture(capture: Option<Arc<PacketCaptureSink>>, errors: &mut CleanupErrors) {
    let Some(capture) = capture else {
        return;
    };
    let records = capture.records();
    match capture.close().await {
        Ok(()) => tracing::info!(path = %capture.path().display(), records, "capture file closed"),
        Err(err) => errors.push(err),
    }
}

/// Relay `client` against the `network` side of a backend, each given as `(source, sink)`.
///
/// Client frames go to the network sink and network frames go to the client sink. Every frame
/// either sink accepts is captured.
async fn relay_captured<R, W, NR, NW>(
    shutdown: &CancellationToken,
    capture: Option<Arc<PacketCaptureSink>>,
    (client_source, client_sink): (R, W),
    (network_source, network_sink): (NR, NW),
) -> Result<(), RelayError>
where
    R: FrameSource + 'static,
    W: FrameSink + 'static,
    NR: FrameSource + 'static,
    NW: FrameSink + 'static,
{
    relay_in_scope(
        RelayScope::child_of(shutdown),
        (client_source, Captured::new(client_sink, capture.clone())),
        (network_source, Captured::new(network_sink, capture)),
    )
    .await
}
