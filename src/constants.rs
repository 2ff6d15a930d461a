//! Constants and default values shared by the supervisor and the control transport.
//!
//! This module centralizes the timing values, wire constants and shell settings used
//! throughout fleetd so they are defined in exactly one place.

use std::time::Duration;

// ============================================================================
// Shell Execution Constants
// ============================================================================

/// Default shell used for executing server start/stop/restart commands.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing command strings.
pub const SHELL_COMMAND_FLAG: &str = "-c";

// ============================================================================
// Supervisor Timing
// ============================================================================

/// Delay between two supervisor ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Granularity at which long supervisor sleeps re-check the running flag.
pub const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Time given to servers to honour their stop command before SIGKILL escalation.
pub const DEFAULT_SHUTDOWN_SETTLE: Duration = Duration::from_secs(3);

/// Interval between two SIGKILL sweeps over the still-alive tracked pids.
pub const DEFAULT_KILL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Control Transport
// ============================================================================

/// Magic constant opening every frame ("FLTD").
pub const FRAME_MAGIC: u32 = 0x464C_5444;

/// Size of the preamble: magic plus declared length.
pub const PREAMBLE_LEN: usize = 8;

/// Size of the fixed header: preamble, opcode, options, request id and both counts.
pub const HEADER_LEN: usize = 28;

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Upper bound on how long a synchronous call waits for its reply.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Slice a blocked synchronous caller waits before re-checking its exit conditions.
pub const CALL_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Interval the receiver loop sleeps while the endpoint path is absent.
pub const RECONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read timeout applied to connected sockets so the receiver notices shutdown.
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Sleep between two polls of a non-blocking control listener.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Class id of the supervisor's own control channel.
pub const SUPERVISOR_CLASS_ID: u16 = 0x0001;
