//! Binary control-plane transport between clients and manager daemons.
//!
//! Frames are encoded by [`codec`], command ids are typed through [`command`],
//! clients hold one [`connection::ConnectionManager`] per endpoint and daemons
//! answer through a [`server::ControlServer`].
use std::{fs, io, path::PathBuf};

use thiserror::Error;

pub mod codec;
pub mod command;
pub mod connection;
pub mod server;

pub use codec::{Arg, FrameError, Message};
pub use command::{CommandSet, RawCommand};
pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState};
pub use server::ControlServer;

/// Errors raised by the control channel.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed control frame: {0}")]
    Frame(#[from] FrameError),
    #[error("failed to decode control payload: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("HOME environment variable not set")]
    MissingHome,
    #[error("control socket not available")]
    NotAvailable,
    #[error("no response received")]
    NoResponse,
    #[error("connection is shutting down")]
    ShuttingDown,
    #[error("remote reported error: {0}")]
    Server(String),
}

/// Directory under `$HOME` where the supervisor keeps its control socket.
fn runtime_dir() -> Result<PathBuf, ControlError> {
    let home = std::env::var("HOME").map_err(|_| ControlError::MissingHome)?;
    let path = PathBuf::from(home).join(".local/share/fleetd");
    fs::create_dir_all(&path)?;
    Ok(path)
}

/// Returns the default unix socket path of the supervisor control channel.
pub fn default_socket_path() -> Result<PathBuf, ControlError> {
    Ok(runtime_dir()?.join("control.sock"))
}
