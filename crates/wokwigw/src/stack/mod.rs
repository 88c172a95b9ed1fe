//! The user-space network stack the stack backend attaches guests to.
//!
//! The stack itself (DHCP, DNS, NAT, forwarding) is an external collaborator. The gateway only
//! needs to create one from a [`StackConfig`], hand it one end of a [`LinkEnd`] per connection
//! and shut it down at exit.

use std::{io, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{config::StackConfig, link::LinkEnd};

mod qemu;

pub use qemu::{launch_config, QemuSocketFactory, QemuSocketStack, StackEndpoint};

#[derive(Debug, Error)]
pub enum StackError {
    #[error("cannot reach network stack at {endpoint}: {source}")]
    Connect {
        endpoint: StackEndpoint,
        #[source]
        source: io::Error,
    },

    #[error("network stack API request {url} failed: {source}")]
    Api {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid network stack API URL: {0}")]
    ApiUrl(#[from] url::ParseError),

    #[error("guest attachment failed: {0}")]
    Attachment(#[source] io::Error),

    #[error("{} forward rule(s) could not be withdrawn", .0.len())]
    Withdraw(Vec<StackError>),
}

/// A running network stack that accepts any number of guest attachments.
#[async_trait]
pub trait NetworkStack: Send + Sync {
    /// Serve one guest over `link` until either side closes it.
    ///
    /// The stack reads and writes the link with the 4-byte big-endian length prefix described in
    /// [`crate::codec`]. Returning drops (and so closes) the link.
    async fn accept_guest(&self, link: LinkEnd) -> Result<(), StackError>;

    /// Release everything the stack published on the host. Called once, at gateway exit.
    async fn shutdown(&self) -> Result<(), StackError> {
        Ok(())
    }
}

/// Builds a [`NetworkStack`] during backend setup.
#[async_trait]
pub trait StackFactory: Send + Sync {
    async fn create(&self, config: &StackConfig) -> Result<Arc<dyn NetworkStack>, StackError>;
}
