use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{close_capture, open_capture, relay_captured};
use crate::{
    capture::PacketCaptureSink,
    config::BridgeOptions,
    relay::{FrameSink, FrameSource},
    tap::{TapDevice, TapReader, TapWriter},
    CleanupErrors, RelayError, SetupError,
};

#[derive(Clone)]
struct Resources {
    device: Arc<TapDevice>,
    capture: Option<Arc<PacketCaptureSink>>,
}

#[derive(Debug)]
pub struct BridgeBackend {
    options: BridgeOptions,
    resources: Mutex<Option<Resources>>,
    setup_done: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources")
            .field("interface", &self.device.name())
            .field("capture", &self.capture.as_ref().map(|c| c.path()))
            .finish()
    }
}

impl BridgeBackend {
    pub fn new(options: BridgeOptions) -> Self {
        Self {
            options,
            resources: Mutex::new(None),
            setup_done: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Name of the TAP interface, once set up.
    pub async fn interface_name(&self) -> Option<String> {
        let resources = self.resources.lock().await;
        resources.as_ref().map(|r| r.device.name().to_string())
    }

    pub(super) async fn setup(&self) -> Result<(), SetupError> {
        if self.setup_done.swap(true, Ordering::AcqRel) {
            return Err(SetupError::AlreadySetUp);
        }

        let device = TapDevice::create(self.options.tap_name.as_deref()).map_err(SetupError::Tap)?;
        tracing::info!(
            interface = device.name(),
            "created TAP interface; bring it up and bridge it to reach the simulated devices"
        );
        let capture = open_capture(self.options.capture_file.as_deref()).await?;

        *self.resources.lock().await = Some(Resources {
            device: Arc::new(device),
            capture,
        });
        Ok(())
    }

    pub(super) async fn handle_connection<R, W>(&self, source: R, sink: W) -> Result<(), RelayError>
    where
        R: FrameSource + 'static,
        W: FrameSink + 'static,
    {
        let Some(Resources { device, capture }) = self.resources.lock().await.clone() else {
            return Err(RelayError::NotSetUp);
        };

        let device_halves = (TapReader::new(device.clone()), TapWriter::new(device));
        self.relay_device((source, sink), device_halves, capture).await
    }

    /// Relay a client against the halves of the shared device.
    async fn relay_device<R, W, DR, DW>(
        &self,
        client: (R, W),
        device: (DR, DW),
        capture: Option<Arc<PacketCaptureSink>>,
    ) -> Result<(), RelayError>
    where
        R: FrameSource + 'static,
        W: FrameSink + 'static,
        DR: FrameSource + 'static,
        DW: FrameSink + 'static,
    {
        relay_captured(&self.shutdown, capture, client, device).await
    }

    pub(super) async fn cleanup(&self) -> Result<(), CleanupErrors> {
        self.shutdown.cancel();

        let mut errors = CleanupErrors::default();
        if let Some(Resources { device, capture }) = self.resources.lock().await.take() {
            // Relays still holding the device drop their references as they unwind.
            tracing::info!(interface = device.name(), "releasing TAP interface");
            drop(device);
            close_capture(capture, &mut errors).await;
        }
        errors.into_result()
    }
}
