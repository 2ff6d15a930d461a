//! Daemon side of a control channel.
use std::{
    collections::HashMap,
    fs, io,
    net::Shutdown,
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, error, info, warn};

use super::{
    ControlError,
    codec::{self, Message, ReadOutcome},
};
use crate::constants::{ACCEPT_POLL_INTERVAL, RECEIVE_POLL_INTERVAL};

/// Answers one inbound message, optionally with a reply frame.
pub type Handler = Arc<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

type Connections = Arc<Mutex<HashMap<u64, UnixStream>>>;

fn lock(connections: &Connections) -> MutexGuard<'_, HashMap<u64, UnixStream>> {
    connections
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Unix socket listener serving framed control messages.
pub struct ControlServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    connections: Connections,
    acceptor: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Binds `path`, replacing a stale socket file, and starts accepting.
    pub fn bind(
        path: impl Into<PathBuf>,
        handler: impl Fn(&Message) -> Option<Message> + Send + Sync + 'static,
    ) -> Result<Self, ControlError> {
        let path = path.into();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let stop = Arc::new(AtomicBool::new(false));
        let connections: Connections = Arc::default();
        let handler: Handler = Arc::new(handler);

        let acceptor = {
            let stop = Arc::clone(&stop);
            let connections = Arc::clone(&connections);
            thread::Builder::new()
                .name("control-accept".into())
                .spawn(move || accept_loop(listener, handler, stop, connections))?
        };

        info!("Control channel listening on {:?}", path);
        Ok(Self {
            path,
            stop,
            connections,
            acceptor: Some(acceptor),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Closes every open client connection while continuing to accept new ones.
    pub fn disconnect_all(&self) {
        for (_, stream) in lock(&self.connections).drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Stops accepting, closes every connection and removes the socket file.
    pub fn shutdown(&mut self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        // Remove the endpoint first so clients do not reconnect while we hang up.
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("Failed to remove control socket {:?}: {err}", self.path),
        }
        if let Some(handle) = self.acceptor.take()
            && handle.join().is_err()
        {
            error!("Control accept thread panicked");
        }
        self.disconnect_all();
        info!("Control channel at {:?} closed", self.path);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: UnixListener,
    handler: Handler,
    stop: Arc<AtomicBool>,
    connections: Connections,
) {
    let next_id = AtomicU64::new(0);
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = register(id, &stream, &connections) {
                    warn!("Rejecting control connection: {err}");
                    continue;
                }
                let handler = Arc::clone(&handler);
                let stop = Arc::clone(&stop);
                let connections = Arc::clone(&connections);
                let spawned = thread::Builder::new()
                    .name(format!("control-conn-{id}"))
                    .spawn(move || {
                        serve_connection(stream, &handler, &stop);
                        lock(&connections).remove(&id);
                    });
                if let Err(err) = spawned {
                    error!("Failed to spawn control connection thread: {err}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                error!("Control listener error: {err}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    debug!("Control accept loop exiting");
}

fn register(id: u64, stream: &UnixStream, connections: &Connections) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(RECEIVE_POLL_INTERVAL))?;
    lock(connections).insert(id, stream.try_clone()?);
    Ok(())
}

fn serve_connection(mut stream: UnixStream, handler: &Handler, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match codec::read_frame(&mut stream, stop) {
            Ok(ReadOutcome::Frame(message)) => {
                debug!(
                    "Control message {:#010x} (request {})",
                    message.opcode, message.request_id
                );
                if let Some(reply) = handler(&message)
                    && let Err(err) = codec::write_frame(&mut stream, &reply)
                {
                    warn!("Failed to write control reply: {err}");
                    break;
                }
            }
            Ok(ReadOutcome::Idle) => {}
            Ok(ReadOutcome::Closed) => break,
            Err(err) => {
                if !stop.load(Ordering::SeqCst) {
                    warn!("Closing control connection: {err}");
                }
                break;
            }
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}
