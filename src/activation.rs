//! Host integration.
//!
//! [`Activation`] is the object a host creates when the language server client is activated and
//! stops when it is deactivated. It owns the bootstrapper and the teardown token of every session
//! it starts, and hands a [`server_options`](Activation::server_options) factory to the protocol
//! client framework.

use std::sync::{Arc, Weak};

use futures::{future::LocalBoxFuture, FutureExt};
use tracing::{info, warn};

use crate::{
    cancellation::CancellationToken,
    config::BootstrapConfig,
    error::BootstrapError,
    launch::LauncherRegistry,
    port::{PortAllocator, PortRange},
    rendezvous::{ConnectionBootstrapper, Transport},
};

/// Diagnostic command registered on activation.
pub const DIAGNOSTIC_COMMAND: &str = "rendezvous.helloWorld";

/// Acknowledgment shown by the diagnostic command.
pub const DIAGNOSTIC_MESSAGE: &str = "Hello World from the language server client!";

/// Command handler registered with the host.
pub type CommandHandler = Box<dyn Fn() + Send + Sync>;

/// The editor host, as seen from the client.
pub trait Host: Send + Sync {
    /// Registers a command without arguments.
    fn register_command(&self, name: &str, handler: CommandHandler);

    /// Shows an informational notification.
    fn show_information_message(&self, message: &str);

    /// Shows an error notification.
    fn show_error_message(&self, message: &str);
}

/// Factory producing a connected transport each time it is called.
pub type ServerOptions =
    Box<dyn Fn() -> LocalBoxFuture<'static, Result<Transport, BootstrapError>>>;

/// An activated language server client.
///
/// Dropping the activation stops it.
pub struct Activation<P> {
    host: Arc<dyn Host>,
    bootstrapper: Arc<ConnectionBootstrapper<P>>,
    server_kind: String,
    cancellation: CancellationToken,
}

impl Activation<PortRange> {
    /// Activates the client with ports scanned from `base_port` to `highest_port` of `config`.
    ///
    /// # Errors
    ///
    /// See [`Activation::start`]. An invalid port range is reported the same way.
    pub fn start_with_config(
        host: Arc<dyn Host>,
        registry: &LauncherRegistry,
        config: &BootstrapConfig,
    ) -> Result<Self, BootstrapError> {
        Self::activate(host, registry, config, || PortRange::from_config(config))
    }
}

impl<P> Activation<P>
where
    P: PortAllocator + 'static,
{
    /// Activates the client.
    ///
    /// The diagnostic command is registered first, then the launcher capability is resolved. A
    /// missing launcher or an invalid configuration is reported to the host and returned, no
    /// bootstrap is ever attempted in that case.
    ///
    /// Ports come from `allocator` alone: `base_port` and `highest_port` of `config` are not
    /// consulted. Use [`Activation::start_with_config`] to scan the configured range.
    ///
    /// # Errors
    ///
    /// See [`ConnectionBootstrapper::from_registry`].
    pub fn start(
        host: Arc<dyn Host>,
        registry: &LauncherRegistry,
        allocator: P,
        config: &BootstrapConfig,
    ) -> Result<Self, BootstrapError> {
        Self::activate(host, registry, config, || Ok(allocator))
    }

    fn activate(
        host: Arc<dyn Host>,
        registry: &LauncherRegistry,
        config: &BootstrapConfig,
        allocator: impl FnOnce() -> Result<P, BootstrapError>,
    ) -> Result<Self, BootstrapError> {
        info!("Activating language server client");

        let weak_host: Weak<dyn Host> = Arc::downgrade(&host);
        host.register_command(
            DIAGNOSTIC_COMMAND,
            Box::new(move || {
                if let Some(host) = weak_host.upgrade() {
                    host.show_information_message(DIAGNOSTIC_MESSAGE);
                }
            }),
        );

        let bootstrapper = allocator()
            .and_then(|allocator| {
                ConnectionBootstrapper::from_registry(allocator, registry, config)
            })
            .inspect_err(|err| {
                warn!(%err, "Language server will not be available");
                host.show_error_message(&err.user_message());
            })?;

        Ok(Self {
            host,
            bootstrapper: Arc::new(bootstrapper),
            server_kind: config.server_kind.clone(),
            cancellation: CancellationToken::new(),
        })
    }

    /// Returns the transport factory for the protocol client framework.
    ///
    /// Every call runs a new bootstrap session. Failures are reported to the host once, except
    /// cancellations which only happen on deactivation.
    pub fn server_options(&self) -> ServerOptions {
        let bootstrapper = Arc::clone(&self.bootstrapper);
        let host = Arc::clone(&self.host);
        let server_kind = self.server_kind.clone();
        let cancellation = self.cancellation.clone();

        Box::new(move || {
            let bootstrapper = Arc::clone(&bootstrapper);
            let host = Arc::clone(&host);
            let server_kind = server_kind.clone();
            let cancellation = cancellation.clone();
            async move {
                match bootstrapper.bootstrap(&server_kind, &cancellation).await {
                    Ok(stream) => {
                        info!(peer = %stream.peer_addr(), "Returning protocol transports");
                        Ok(stream.into_transport())
                    }
                    Err(err) => {
                        if !matches!(err, BootstrapError::Cancelled { .. }) {
                            host.show_error_message(&err.user_message());
                        }
                        Err(err)
                    }
                }
            }
            .boxed_local()
        })
    }

    /// Stops the client and tears down every pending session.
    ///
    /// Returns `false` if it was already stopped.
    pub fn stop(&self) -> bool {
        let stopped = self.cancellation.cancel();
        if stopped {
            info!("Deactivating language server client");
        }
        stopped
    }

    /// Whether [`stop`](Activation::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl<P> std::fmt::Debug for Activation<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activation")
            .field("server_kind", &self.server_kind)
            .field("launcher", &self.bootstrapper.launcher_name())
            .field("connect_timeout", &self.bootstrapper.connect_timeout())
            .field("stopped", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<P> Drop for Activation<P> {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}
