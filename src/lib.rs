//! Rendezvous provides the client side of a "listen first, get dialed back" connection bootstrap
//! for language servers whose process is owned by somebody else.
//!
//! ## Rendezvous
//!
//! The server is never started by the client. Instead:
//!
//! * the client finds a free loopback port and starts listening on it
//! * it asks the process-owner, through the [`launch::RemoteLauncher`] capability, to start a
//!   server which connects to `127.0.0.1:<port>`
//! * the first inbound connection is accepted, the listening socket is closed, and the stream is
//!   handed to the protocol client as a [`rendezvous::Transport`]
//!
//! Listening always comes before the start request, so the server never dials an address nobody
//! listens on. Every failure ends the attempt and releases the listening socket.
//!
//! ## Launch reports
//!
//! Start requests do not block, but launchers may report a startup failure through the returned
//! [`launch::LaunchReport`], which ends the attempt without waiting for the connect timeout.
//!
//! ## Example
//!
//! See `demos/rendezvous.rs` in the Git repository, which plays both the client and an in-process
//! launcher whose server echoes what it receives.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod activation;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod launch;
pub mod port;
pub mod rendezvous;

pub use error::{BootstrapError, BootstrapStep};
