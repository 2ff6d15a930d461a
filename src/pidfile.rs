//! Reading the pid files servers write on startup.
use std::{fs, io::ErrorKind, path::Path};

use tracing::{debug, warn};

/// Reads the pid recorded in `path`.
///
/// A missing file is a normal transient state and yields `None`. Unreadable or
/// malformed content is logged and also treated as absent.
pub fn read_pid(path: &Path) -> Option<i32> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("PID file {path:?} not present");
            return None;
        }
        Err(err) => {
            warn!("Failed to read PID file {path:?}: {err}");
            return None;
        }
    };

    match contents.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Some(pid),
        Ok(pid) => {
            warn!("PID file {path:?} holds invalid pid {pid}");
            None
        }
        Err(err) => {
            warn!("PID file {path:?} is malformed: {err}");
            None
        }
    }
}
