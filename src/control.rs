//! The supervisor's own control channel, carried over the framed transport.
use std::path::Path;

use strum_macros::{Display, EnumIter, EnumString, FromRepr};
use tracing::{debug, info, warn};

use crate::{
    constants::SUPERVISOR_CLASS_ID,
    ipc::{
        CommandSet, ConnectionManager, ConnectionSettings, ControlError, ControlServer, Message,
    },
    supervisor::{StatusSnapshot, SupervisorHandle},
};

/// Integer status carried by acknowledgement replies.
const ACK_OK: i32 = 0;
const ACK_ERR: i32 = -1;

/// Commands understood by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(u16)]
pub enum ControlCommand {
    Ping = 1,
    Status = 2,
    Restart = 3,
    Shutdown = 4,
}

impl CommandSet for ControlCommand {
    fn id(self) -> u16 {
        self as u16
    }

    fn from_id(id: u16) -> Option<Self> {
        Self::from_repr(id)
    }
}

fn ack(message: &Message, code: i32) -> Message {
    message.reply().with_int(code)
}

/// Answers one control message on behalf of the supervisor behind `handle`.
///
/// Messages with request id zero are acted on without a reply.
pub fn handle_message(handle: &SupervisorHandle, message: &Message) -> Option<Message> {
    let reply = answer(handle, message);
    (message.request_id != 0).then_some(reply)
}

fn answer(handle: &SupervisorHandle, message: &Message) -> Message {
    if message.class_id() != SUPERVISOR_CLASS_ID {
        warn!(
            "Rejecting control message for class {:#06x}",
            message.class_id()
        );
        return ack(message, ACK_ERR);
    }
    let Some(command) = ControlCommand::from_id(message.command_id()) else {
        warn!(
            "Unknown control command {:#06x}",
            message.command_id()
        );
        return ack(message, ACK_ERR);
    };
    debug!("Control command '{command}' (request {})", message.request_id);

    match command {
        ControlCommand::Ping => message.reply().with_str("pong"),
        ControlCommand::Status => match serde_json::to_string(&handle.status()) {
            Ok(json) => message.reply().with_str(json),
            Err(err) => {
                warn!("Failed to encode status snapshot: {err}");
                ack(message, ACK_ERR)
            }
        },
        ControlCommand::Restart => match message.str_arg(0) {
            Some(name) if handle.knows(&name) && handle.request_restart(&name) => {
                info!("Queued restart of '{name}'");
                ack(message, ACK_OK)
            }
            Some(name) => {
                warn!("Refusing restart of unknown server '{name}'");
                ack(message, ACK_ERR)
            }
            None => ack(message, ACK_ERR),
        },
        ControlCommand::Shutdown => {
            handle.request_shutdown();
            ack(message, ACK_OK)
        }
    }
}

/// Serves the supervisor control channel at `path`.
pub fn serve(path: &Path, handle: SupervisorHandle) -> Result<ControlServer, ControlError> {
    ControlServer::bind(path, move |message| handle_message(&handle, message))
}

/// Client for a running supervisor.
pub struct ControlClient {
    manager: ConnectionManager<ControlCommand>,
}

impl ControlClient {
    pub fn connect(path: &Path) -> Result<Self, ControlError> {
        Self::with_settings(path, ConnectionSettings::default())
    }

    pub fn with_settings(path: &Path, settings: ConnectionSettings) -> Result<Self, ControlError> {
        Ok(Self {
            manager: ConnectionManager::with_settings(path, SUPERVISOR_CLASS_ID, settings)?,
        })
    }

    pub fn manager(&self) -> &ConnectionManager<ControlCommand> {
        &self.manager
    }

    pub fn ping(&self) -> Result<(), ControlError> {
        self.manager.call(ControlCommand::Ping, vec![], vec![])?;
        Ok(())
    }

    pub fn status(&self) -> Result<StatusSnapshot, ControlError> {
        let reply = self.manager.call(ControlCommand::Status, vec![], vec![])?;
        let json = reply
            .str_arg(0)
            .ok_or_else(|| ControlError::Server("status reply carried no snapshot".into()))?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn restart(&self, name: &str) -> Result<(), ControlError> {
        let reply = self
            .manager
            .call(ControlCommand::Restart, vec![], vec![name.as_bytes().to_vec()])?;
        expect_ack(&reply, || format!("unknown server '{name}'"))
    }

    pub fn shutdown(&self) -> Result<(), ControlError> {
        let reply = self.manager.call(ControlCommand::Shutdown, vec![], vec![])?;
        expect_ack(&reply, || "shutdown refused".to_string())
    }
}

fn expect_ack(reply: &Message, describe: impl FnOnce() -> String) -> Result<(), ControlError> {
    match reply.int_args.first() {
        Some(&ACK_OK) => Ok(()),
        _ => Err(ControlError::Server(describe())),
    }
}
