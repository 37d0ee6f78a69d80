//! Loopback port allocation.
//!
//! An allocator only answers with a port which was free when it looked. No reservation is held:
//! another process may grab the port before the rendezvous listener binds it, in which case the
//! bind fails and the attempt ends. Binding promptly after allocation keeps that window small.

use std::{future::Future, net::Ipv4Addr};

use async_net::TcpListener;
use tracing::{debug, trace};

use crate::{config::BootstrapConfig, error::BootstrapError};

/// Port allocator abstraction.
pub trait PortAllocator {
    /// Returns a port believed free on the loopback interface.
    fn allocate(&self) -> impl Future<Output = Result<u16, BootstrapError>>;
}

/// Scans a port range upward and returns the first port which binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    base_port: u16,
    highest_port: u16,
}

impl PortRange {
    /// Creates a scanner over `base_port..=highest_port`.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] if the range is empty or starts at port zero.
    pub fn new(base_port: u16, highest_port: u16) -> Result<Self, BootstrapError> {
        if base_port == 0 || base_port > highest_port {
            return Err(BootstrapError::Config(format!(
                "invalid port range {base_port}..={highest_port}"
            )));
        }
        Ok(Self {
            base_port,
            highest_port,
        })
    }

    /// Creates a scanner over the range of a validated configuration.
    ///
    /// # Errors
    ///
    /// See [`PortRange::new`].
    pub fn from_config(config: &BootstrapConfig) -> Result<Self, BootstrapError> {
        Self::new(config.base_port, config.highest_port)
    }
}

impl PortAllocator for PortRange {
    async fn allocate(&self) -> Result<u16, BootstrapError> {
        for port in self.base_port..=self.highest_port {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(listener) => {
                    drop(listener);
                    debug!(port, "Found open port");
                    return Ok(port);
                }
                Err(err) => {
                    trace!(port, %err, "Port busy");
                }
            }
        }
        Err(BootstrapError::PortExhaustion {
            first: self.base_port,
            last: self.highest_port,
        })
    }
}

/// Lets the operating system pick an ephemeral port.
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralPort;

impl PortAllocator for EphemeralPort {
    async fn allocate(&self) -> Result<u16, BootstrapError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|err| {
                debug!(%err, "No ephemeral port available");
                BootstrapError::PortExhaustion { first: 0, last: 0 }
            })?;
        let port = listener
            .local_addr()
            .map_err(|_| BootstrapError::PortExhaustion { first: 0, last: 0 })?
            .port();
        debug!(port, "Got ephemeral port");
        Ok(port)
    }
}
