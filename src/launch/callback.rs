//! Launcher backed by a closure.

use std::fmt;

use crate::launch::{LaunchReport, RemoteLauncher};

/// Adapts a host-provided function into a [`RemoteLauncher`].
///
/// Hosts usually expose the process-owner as a plain entry point taking the server kind and the
/// address. Wrap it here to register it in a
/// [`LauncherRegistry`](crate::launch::LauncherRegistry).
pub struct CallbackLauncher<F> {
    start: F,
}

impl<F> CallbackLauncher<F>
where
    F: Fn(&str, &str) -> LaunchReport + Send + Sync,
{
    /// Creates a launcher calling `start` for every start request.
    pub fn new(start: F) -> Self {
        Self { start }
    }
}

impl<F> RemoteLauncher for CallbackLauncher<F>
where
    F: Fn(&str, &str) -> LaunchReport + Send + Sync,
{
    fn start_server(&self, kind: &str, address: &str) -> LaunchReport {
        (self.start)(kind, address)
    }
}

impl<F> fmt::Debug for CallbackLauncher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLauncher").finish_non_exhaustive()
    }
}
