//! Dummy launcher which starts nothing.

use crate::launch::{LaunchReport, RemoteLauncher};

/// Dummy launcher.
///
/// It ignores every start request and never reports back, so a bootstrap using it can only end by
/// timeout or cancellation. Useful when the server is started by hand and told the address
/// through the logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyLauncher;

impl RemoteLauncher for DummyLauncher {
    fn start_server(&self, _kind: &str, _address: &str) -> LaunchReport {
        LaunchReport::detached()
    }
}
