//! Sub-module where the rendezvous itself is located.
//!
//! [`listener`] binds the loopback port and accepts the single inbound connection.
//!
//! [`stream`] exposes the accepted connection as a reader and writer pair.
//!
//! [`bootstrap`] sequences port allocation, listening, the start request and the wait.

pub mod bootstrap;
pub mod listener;
pub mod stream;

pub use bootstrap::{BootstrapSession, ConnectionBootstrapper, SessionState};
pub use listener::RendezvousListener;
pub use stream::{DuplexStream, Transport};
