//! Single-shot loopback listener.

use std::{
    net::{Ipv4Addr, SocketAddr},
    pin::pin,
    time::Duration,
};

use async_io::Timer;
use async_net::TcpListener;
use futures::{select, FutureExt};
use tracing::{debug, info};

use crate::{error::BootstrapError, rendezvous::stream::DuplexStream};

/// Listener waiting for the server to dial back.
///
/// Exactly one connection is accepted. The listening socket is released when the listener is
/// dropped, which [`await_connection`](RendezvousListener::await_connection) does on every exit
/// path since it consumes the listener.
#[derive(Debug)]
pub struct RendezvousListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RendezvousListener {
    /// Binds `127.0.0.1:<port>` in listening mode.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Bind`] if the port is taken or cannot be bound.
    pub async fn open(port: u16) -> Result<Self, BootstrapError> {
        let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let bind_error = |source| BootstrapError::Bind { address, source };

        let listener = TcpListener::bind(address).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        debug!(address = %local_addr, "Listening for language server");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Textual address sent to the launcher, `127.0.0.1:<port>`.
    pub fn address(&self) -> String {
        self.local_addr.to_string()
    }

    /// Waits for the first inbound connection, then closes the listening socket.
    ///
    /// Without a timeout the wait is unbounded.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::ConnectTimeout`] if `timeout` elapses first, or
    /// [`BootstrapError::Accept`] if the accept itself fails.
    pub async fn await_connection(
        self,
        timeout: Option<Duration>,
    ) -> Result<DuplexStream, BootstrapError> {
        let address = self.local_addr;
        info!(%address, "Waiting to connect to language server");

        let accept = async {
            let (stream, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(|source| BootstrapError::Accept { address, source })?;
            Ok(DuplexStream::new(stream, peer_addr))
        };

        let Some(timeout) = timeout else {
            return accept.await;
        };

        let mut accept = pin!(accept.fuse());
        let mut expired = Timer::after(timeout).fuse();
        select! {
            conn = accept => conn,
            _ = expired => Err(BootstrapError::ConnectTimeout { address, timeout }),
        }
    }
}

impl Drop for RendezvousListener {
    fn drop(&mut self) {
        debug!(address = %self.local_addr, "Closing rendezvous listener");
    }
}
