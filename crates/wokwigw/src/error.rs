use thiserror::Error;

use crate::{capture::CaptureError, codec::FrameError, stack::StackError};

/// Rejected configuration. Surfaced before any backend is constructed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("arg {0} is not formatted using the syntax '[udp:]localPort:addr:remotePort'")]
    ForwardSyntax(String),

    #[error("invalid local port specified in forward argument ({0})")]
    ForwardLocalPort(String),

    #[error("invalid remote port specified in forward argument ({0})")]
    ForwardRemotePort(String),

    #[error("missing remote host in forward argument ({0})")]
    ForwardRemoteHost(String),

    #[error("port forwarding is not supported in bridge mode ({0} rule(s) given)")]
    ForwardsInBridgeMode(usize),

    #[error("invalid stack endpoint {0:?} (expected tcp://host:port or unix:///path)")]
    StackEndpoint(String),
}

/// Failure to acquire the backend's transport resource. Fatal to startup.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("backend already set up")]
    AlreadySetUp,

    #[error("error creating network: {0}")]
    Stack(#[from] StackError),

    #[error("error creating TAP interface: {0}")]
    Tap(#[source] std::io::Error),

    #[error("error setting up PCAP file: {0}")]
    Capture(#[from] CaptureError),
}

/// Terminal condition of one connection's relay. Never affects other connections.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("websocket error: {0}")]
    WebSocket(#[source] axum::Error),

    #[error("stream framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("TAP interface error: {0}")]
    Tap(#[source] std::io::Error),

    #[error("peer closed")]
    Closed,

    #[error("backend is not set up")]
    NotSetUp,

    #[error("network stack attachment failed: {0}")]
    Stack(#[source] StackError),

    #[error("relay task panicked")]
    TaskPanicked,
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("network stack shutdown failed: {0}")]
    Stack(#[from] StackError),

    #[error("closing capture file failed: {0}")]
    Capture(#[from] CaptureError),
}

/// Every failure seen while releasing backend resources; one failure never hides another.
#[derive(Debug, Default, Error)]
#[error("{} cleanup error(s): {}", .0.len(), join(.0))]
pub struct CleanupErrors(pub Vec<CleanupError>);

impl CleanupErrors {
    pub(crate) fn push(&mut self, err: impl Into<CleanupError>) {
        let err = err.into();
        tracing::warn!("cleanup: {err}");
        self.0.push(err);
    }

    pub(crate) fn into_result(self) -> Result<(), CleanupErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

fn join(errors: &[CleanupError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
