//! fleetd keeps a fleet of cooperating manager daemons on a device alive. It polls
//! every configured server, restarts failed ones together with the servers that
//! cascade from them, and carries the binary control-plane protocol the managers
//! use to talk to each other.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared constants and defaults.
pub mod constants;

/// Supervisor control channel.
pub mod control;

/// Cascade closures and start priorities.
pub mod deps;

/// Error handling.
pub mod error;

/// Operator exception list.
pub mod exceptions;

/// Framed control-plane transport.
pub mod ipc;

/// Launching lifecycle commands and signalling processes.
pub mod launcher;

/// Pid file reading.
pub mod pidfile;

/// Process liveness and resource sampling.
pub mod probe;

/// Supervised server definitions.
pub mod registry;

/// The polling supervisor.
pub mod supervisor;

/// In-memory process host for tests.
#[doc(hidden)]
pub mod test_utils;
