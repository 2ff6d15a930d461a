//! Client side of a control channel: one connection to one manager endpoint.
//!
//! A background receiver thread owns reconnection and inbound dispatch. Callers
//! send from their own thread and, for synchronous calls, wait on a condition
//! variable until the receiver parks a reply with the matching request id in the
//! single pending-response slot.
use std::{
    collections::HashMap,
    io::Write,
    marker::PhantomData,
    net::Shutdown,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use super::{
    ControlError,
    codec::{self, Arg, Message, ReadOutcome, combine_opcode},
    command::CommandSet,
};
use crate::constants::{
    CALL_WAIT_SLICE, DEFAULT_CALL_TIMEOUT, RECEIVE_POLL_INTERVAL, RECONNECT_POLL_INTERVAL,
};

/// Handler invoked with the positional arguments of an inbound message.
pub type Callback = Arc<dyn Fn(&[Arg<'_>]) + Send + Sync>;

/// Whether the manager currently holds an open socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Timing knobs of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Ceiling on how long a synchronous call waits for its reply.
    pub call_timeout: Duration,
    /// Longest single wait on the response condition before re-checking state.
    pub wait_slice: Duration,
    /// Sleep between reconnect attempts while disconnected.
    pub reconnect_poll: Duration,
    /// Read timeout of the receiver so it notices `stop()` promptly.
    pub receive_poll: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            wait_slice: CALL_WAIT_SLICE,
            reconnect_poll: RECONNECT_POLL_INTERVAL,
            receive_poll: RECEIVE_POLL_INTERVAL,
        }
    }
}

#[derive(Default)]
struct LinkState {
    stream: Option<UnixStream>,
    /// Bumped on every successful connect so stale readers and writers can tell
    /// their socket was replaced.
    generation: u64,
    callbacks: HashMap<u16, Vec<Callback>>,
    pending_response: Option<Message>,
}

struct Shared {
    endpoint: PathBuf,
    class_id: u16,
    settings: ConnectionSettings,
    state: Mutex<LinkState>,
    response_ready: Condvar,
    finished: AtomicBool,
    next_request_id: AtomicU32,
    send_lock: Mutex<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connect(&self) -> Result<(), ControlError> {
        let stream = UnixStream::connect(&self.endpoint)?;
        stream.set_read_timeout(Some(self.settings.receive_poll))?;
        stream.set_write_timeout(Some(self.settings.call_timeout))?;

        let mut state = self.lock();
        if state.stream.is_none() {
            state.stream = Some(stream);
            state.generation += 1;
            info!("Connected to {}", self.endpoint.display());
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), ControlError> {
        if self.lock().stream.is_some() {
            return Ok(());
        }
        if !self.endpoint.exists() {
            return Err(ControlError::NotAvailable);
        }
        self.connect()
    }

    /// Closes the socket if it is still the one identified by `generation`.
    fn disconnect(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        if let Some(stream) = state.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            info!("Disconnected from {}", self.endpoint.display());
        }
    }

    /// Duplicates the current socket handle together with its generation.
    fn clone_stream(&self) -> Result<Option<(u64, UnixStream)>, ControlError> {
        let state = self.lock();
        match state.stream.as_ref() {
            Some(stream) => Ok(Some((state.generation, stream.try_clone()?))),
            None => Ok(None),
        }
    }

    fn current_generation(&self) -> Option<u64> {
        let state = self.lock();
        state.stream.as_ref().map(|_| state.generation)
    }

    fn fresh_request_id(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn dispatch(&self, message: Message) {
        let command_id = message.command_id();
        let callbacks = self
            .lock()
            .callbacks
            .get(&command_id)
            .cloned()
            .unwrap_or_default();

        if callbacks.is_empty() {
            debug!(
                "No handler registered for command {command_id:#06x} from {}",
                self.endpoint.display()
            );
        } else {
            let args = message.args();
            for callback in &callbacks {
                callback(&args);
            }
        }

        self.lock().pending_response = Some(message);
        self.response_ready.notify_all();
    }

    fn try_reconnect(&self) {
        if self.endpoint.exists() {
            match self.connect() {
                Ok(()) => return,
                Err(err) => debug!("Connect to {} failed: {err}", self.endpoint.display()),
            }
        }
        thread::sleep(self.settings.reconnect_poll);
    }

    fn receive_loop(&self) {
        let mut reader: Option<(u64, UnixStream)> = None;

        while !self.finished.load(Ordering::SeqCst) {
            let Some(generation) = self.current_generation() else {
                reader = None;
                self.try_reconnect();
                continue;
            };

            if reader
                .as_ref()
                .is_none_or(|(current, _)| *current != generation)
            {
                reader = match self.clone_stream() {
                    Ok(cloned) => cloned,
                    Err(err) => {
                        warn!("Failed to clone socket for {}: {err}", self.endpoint.display());
                        self.disconnect(generation);
                        None
                    }
                };
            }
            let Some((generation, stream)) = reader.as_mut() else {
                continue;
            };
            let generation = *generation;

            match codec::read_frame(stream, &self.finished) {
                Ok(ReadOutcome::Frame(message)) => self.dispatch(message),
                Ok(ReadOutcome::Idle) => {}
                Ok(ReadOutcome::Closed) => {
                    debug!("{} closed the connection", self.endpoint.display());
                    self.disconnect(generation);
                    reader = None;
                }
                Err(err) => {
                    if !self.finished.load(Ordering::SeqCst) {
                        warn!("Dropping connection to {}: {err}", self.endpoint.display());
                    }
                    self.disconnect(generation);
                    reader = None;
                }
            }
        }
        debug!("Receiver for {} exiting", self.endpoint.display());
    }
}

/// Maintains the connection to one manager endpoint and routes its messages.
///
/// Synchronous calls share a single pending-response slot, so callers must not
/// overlap synchronous calls on the same manager.
pub struct ConnectionManager<C: CommandSet> {
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    _commands: PhantomData<fn() -> C>,
}

impl<C: CommandSet> ConnectionManager<C> {
    /// Creates a manager for `endpoint` with default timings and starts its receiver.
    pub fn new(endpoint: impl Into<PathBuf>, class_id: u16) -> Result<Self, ControlError> {
        Self::with_settings(endpoint, class_id, ConnectionSettings::default())
    }

    pub fn with_settings(
        endpoint: impl Into<PathBuf>,
        class_id: u16,
        settings: ConnectionSettings,
    ) -> Result<Self, ControlError> {
        let endpoint = endpoint.into();
        let shared = Arc::new(Shared {
            endpoint: endpoint.clone(),
            class_id,
            settings,
            state: Mutex::new(LinkState::default()),
            response_ready: Condvar::new(),
            finished: AtomicBool::new(false),
            next_request_id: AtomicU32::new(1),
            send_lock: Mutex::new(()),
        });

        let receiver_shared = Arc::clone(&shared);
        let name = endpoint
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "endpoint".to_string());
        let receiver = thread::Builder::new()
            .name(format!("recv-{name}"))
            .spawn(move || receiver_shared.receive_loop())?;

        Ok(Self {
            shared,
            receiver: Mutex::new(Some(receiver)),
            _commands: PhantomData,
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.shared.endpoint
    }

    pub fn class_id(&self) -> u16 {
        self.shared.class_id
    }

    pub fn state(&self) -> ConnectionState {
        match self.shared.lock().stream {
            Some(_) => ConnectionState::Connected,
            None => ConnectionState::Disconnected,
        }
    }

    /// Registers `callback` for inbound messages carrying `command`. Callbacks for
    /// the same command run in registration order on the receiver thread.
    pub fn on(&self, command: C, callback: impl Fn(&[Arg<'_>]) + Send + Sync + 'static) {
        self.shared
            .lock()
            .callbacks
            .entry(command.id())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Sends one command. Synchronous calls block until the matching reply arrives
    /// and return it; asynchronous calls return `Ok(None)` once the frame is written.
    pub fn invoke(
        &self,
        command: C,
        options: u32,
        request_id: u32,
        int_args: Vec<i32>,
        char_args: Vec<Vec<u8>>,
        synchronous: bool,
    ) -> Result<Option<Message>, ControlError> {
        let shared = &self.shared;
        if shared.finished.load(Ordering::SeqCst) {
            return Err(ControlError::ShuttingDown);
        }
        shared.ensure_connected()?;

        let request_id = if synchronous && request_id == 0 {
            shared.fresh_request_id()
        } else {
            request_id
        };
        let message = Message {
            opcode: combine_opcode(shared.class_id, command.id()),
            options,
            request_id,
            int_args,
            char_args,
        };

        // An oversized message is refused here, before the healthy link is touched.
        let frame = codec::encode(&message)?;

        let Some((generation, mut writer)) = shared.clone_stream()? else {
            return Err(ControlError::NotAvailable);
        };
        {
            let _send = shared
                .send_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Err(err) = writer.write_all(&frame).and_then(|()| writer.flush()) {
                warn!("Send to {} failed: {err}", shared.endpoint.display());
                shared.disconnect(generation);
                return Err(err.into());
            }
        }

        if !synchronous {
            return Ok(None);
        }
        self.wait_for_reply(request_id).map(Some)
    }

    fn wait_for_reply(&self, request_id: u32) -> Result<Message, ControlError> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.settings.call_timeout;
        let mut state = shared.lock();
        loop {
            if let Some(reply) = state
                .pending_response
                .take_if(|pending| pending.request_id == request_id)
            {
                return Ok(reply);
            }
            if shared.finished.load(Ordering::SeqCst) {
                return Err(ControlError::ShuttingDown);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ControlError::NoResponse);
            }
            let slice = (deadline - now).min(shared.settings.wait_slice);
            state = match shared.response_ready.wait_timeout(state, slice) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Fire-and-forget send of `command`.
    pub fn send(
        &self,
        command: C,
        int_args: Vec<i32>,
        char_args: Vec<Vec<u8>>,
    ) -> Result<(), ControlError> {
        self.invoke(command, 0, 0, int_args, char_args, false)
            .map(|_| ())
    }

    /// Sends `command` and waits for its reply.
    pub fn call(
        &self,
        command: C,
        int_args: Vec<i32>,
        char_args: Vec<Vec<u8>>,
    ) -> Result<Message, ControlError> {
        self.invoke(command, 0, 0, int_args, char_args, true)?
            .ok_or(ControlError::NoResponse)
    }

    /// Stops the receiver, closes the socket and wakes every blocked caller.
    pub fn stop(&self) {
        let shared = &self.shared;
        if shared.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stream) = shared.lock().stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        shared.response_ready.notify_all();

        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = receiver
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            warn!("Receiver for {} panicked", shared.endpoint.display());
        }
    }
}

impl<C: CommandSet> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        self.stop();
    }
}
