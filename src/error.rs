//! Error taxonomy of a bootstrap attempt.
//!
//! Every error is terminal for the attempt which produced it. Nothing is retried internally, the
//! caller decides whether a new attempt is worth it.

use std::{fmt, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::launch::LaunchError;

/// The step of a bootstrap attempt an error originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    /// Configuration validation, before any I/O.
    Configure,
    /// Lookup of the launcher capability.
    ResolveLauncher,
    /// Search for a free loopback port.
    AllocatePort,
    /// Bind of the rendezvous listener.
    Listen,
    /// Start request sent to the launcher.
    RequestStart,
    /// Wait for the server to dial back.
    AwaitConnection,
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Configure => "configure",
            Self::ResolveLauncher => "resolve launcher",
            Self::AllocatePort => "allocate port",
            Self::Listen => "listen",
            Self::RequestStart => "request start",
            Self::AwaitConnection => "await connection",
        })
    }
}

/// Failure of a bootstrap attempt.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// No free port could be found in the scanned range.
    #[error("no free port between {first} and {last}")]
    PortExhaustion { first: u16, last: u16 },

    /// The rendezvous listener could not be bound.
    #[error("unable to listen on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The launcher capability is not registered.
    #[error("launcher `{name}` is not registered")]
    LauncherMissing { name: String },

    /// The server did not dial back in time.
    #[error("no connection to {address} within {timeout:?}")]
    ConnectTimeout {
        address: SocketAddr,
        timeout: Duration,
    },

    /// The launcher reported that the server failed to start.
    #[error("server for {address} failed to start: {source}")]
    RemoteStart {
        address: SocketAddr,
        #[source]
        source: LaunchError,
    },

    /// Accepting the inbound connection failed.
    #[error("unable to accept connection on {address}: {source}")]
    Accept {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The attempt was torn down before it completed.
    #[error("bootstrap cancelled during {step}")]
    Cancelled { step: BootstrapStep },

    /// Invalid configuration or misuse of a session.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BootstrapError {
    /// Returns the step which failed.
    pub fn step(&self) -> BootstrapStep {
        match self {
            Self::PortExhaustion { .. } => BootstrapStep::AllocatePort,
            Self::Bind { .. } => BootstrapStep::Listen,
            Self::LauncherMissing { .. } => BootstrapStep::ResolveLauncher,
            Self::ConnectTimeout { .. } | Self::Accept { .. } => BootstrapStep::AwaitConnection,
            Self::RemoteStart { .. } => BootstrapStep::RequestStart,
            Self::Cancelled { step } => *step,
            Self::Config(_) => BootstrapStep::Configure,
        }
    }

    /// Formats the single message shown to the user for this failure.
    pub fn user_message(&self) -> String {
        match self.step() {
            BootstrapStep::AllocatePort => {
                format!("Could not find open port for language server: \n\n{self}")
            }
            BootstrapStep::ResolveLauncher => {
                format!("Could not find launcher ({self}); language server will not be available.")
            }
            BootstrapStep::Configure => {
                format!("Language server is misconfigured: \n\n{self}")
            }
            BootstrapStep::Listen
            | BootstrapStep::RequestStart
            | BootstrapStep::AwaitConnection => {
                format!("Could not connect to language server: \n\n{self}")
            }
        }
    }
}
