//! Remote launcher capability.
//!
//! The process-owner which actually spawns the server lives outside of this crate. It is reached
//! through the [`RemoteLauncher`] capability, registered by name in a [`LauncherRegistry`] and
//! resolved once, before any bootstrap attempt.
//!
//! [`dummy`] provides a launcher which never starts anything, [`callback`] adapts a plain closure.

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    future::{self, BoxFuture},
    FutureExt,
};
use thiserror::Error;
use tracing::info;

use crate::error::BootstrapError;

pub mod callback;
pub mod dummy;

/// Well-known name of the launcher capability.
pub const DEFAULT_LAUNCHER_CAPABILITY: &str = "myriac-console";

/// Failure reported by a launcher when the server could not be started.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct LaunchError {
    message: String,
}

impl LaunchError {
    /// Creates a launch error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the description.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for LaunchError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Outcome of a start request, reported asynchronously by the launcher.
///
/// The start request itself never blocks. The report resolves to an error as soon as the launcher
/// knows the server will not come up, which ends the bootstrap without waiting for the timeout.
/// Resolving to `Ok(())` only means the launch was accepted: the server still has to dial back.
#[must_use = "dropping the report ignores launch failures"]
pub struct LaunchReport(BoxFuture<'static, Result<(), LaunchError>>);

impl LaunchReport {
    /// Wraps a future resolving to the launch outcome.
    pub fn new<F>(outcome: F) -> Self
    where
        F: Future<Output = Result<(), LaunchError>> + Send + 'static,
    {
        Self(outcome.boxed())
    }

    /// A report which never resolves, for launchers without a result channel.
    pub fn detached() -> Self {
        Self::new(future::pending())
    }

    /// A report of an accepted launch.
    pub fn accepted() -> Self {
        Self::new(future::ready(Ok(())))
    }

    /// A report of a failed launch.
    pub fn failed(err: LaunchError) -> Self {
        Self::new(future::ready(Err(err)))
    }
}

impl Future for LaunchReport {
    type Output = Result<(), LaunchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx)
    }
}

impl fmt::Debug for LaunchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchReport").finish_non_exhaustive()
    }
}

/// Launcher abstraction.
pub trait RemoteLauncher: Send + Sync {
    /// Asks the process-owner to start a server of the given kind which dials `address`.
    ///
    /// `address` has the form `127.0.0.1:<port>`.
    fn start_server(&self, kind: &str, address: &str) -> LaunchReport;
}

/// Registry of launcher capabilities, looked up by name.
#[derive(Default)]
pub struct LauncherRegistry {
    launchers: BTreeMap<String, Arc<dyn RemoteLauncher>>,
}

impl LauncherRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a launcher, replacing any launcher with the same name.
    pub fn register<L>(&mut self, name: impl Into<String>, launcher: L)
    where
        L: RemoteLauncher + 'static,
    {
        self.launchers.insert(name.into(), Arc::new(launcher));
    }

    /// Resolves a launcher.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::LauncherMissing`] if nothing is registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<ResolvedLauncher, BootstrapError> {
        self.launchers
            .get(name)
            .map(|launcher| ResolvedLauncher {
                name: name.to_owned(),
                launcher: Arc::clone(launcher),
            })
            .ok_or_else(|| BootstrapError::LauncherMissing {
                name: name.to_owned(),
            })
    }
}

impl fmt::Debug for LauncherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.launchers.keys()).finish()
    }
}

/// A launcher resolved from the registry, validated present.
#[derive(Clone)]
pub struct ResolvedLauncher {
    name: String,
    launcher: Arc<dyn RemoteLauncher>,
}

impl ResolvedLauncher {
    /// Name the launcher was resolved under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends the start request for a server of `kind` dialing `address`.
    pub fn request_start(&self, kind: &str, address: SocketAddr) -> LaunchReport {
        let address = address.to_string();
        info!(
            launcher = %self.name,
            kind,
            %address,
            "Requesting launcher to start language server"
        );
        self.launcher.start_server(kind, &address)
    }
}

impl fmt::Debug for ResolvedLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedLauncher")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
