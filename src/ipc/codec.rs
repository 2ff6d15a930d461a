//! Encoding and decoding of control frames.
//!
//! A frame is a fixed header followed by the arguments, every field in the host's
//! native byte order:
//!
//! ```text
//! magic | length | opcode | options | request id | int count | str count
//! int args (i32 each) | str args (u32 length + bytes each)
//! ```
//!
//! The opcode carries the class id in its high 16 bits and the command id in its
//! low 16 bits. The protocol only ever runs between processes on the same host.
use std::{
    io::{self, ErrorKind, Read, Write},
    sync::atomic::{AtomicBool, Ordering},
};

use thiserror::Error;

use crate::constants::{FRAME_MAGIC, HEADER_LEN, MAX_FRAME_LEN, PREAMBLE_LEN};

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("bad frame magic {0:#010x}")]
    BadMagic(u32),
    #[error("frame declares {declared} bytes but {actual} are available")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    TooLarge(usize),
    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),
    #[error("{0} unexpected bytes after the last argument")]
    TrailingBytes(usize),
    #[error("frame I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// One command or reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Command id in the low 16 bits, class id in the high 16 bits.
    pub opcode: u32,
    pub options: u32,
    /// Correlation token; zero means no reply is expected.
    pub request_id: u32,
    pub int_args: Vec<i32>,
    pub char_args: Vec<Vec<u8>>,
}

/// A positional argument as handed to callbacks: integers first, then strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg<'a> {
    Int(i32),
    Str(&'a [u8]),
}

/// Builds an opcode from its class id and command id.
pub const fn combine_opcode(class_id: u16, command_id: u16) -> u32 {
    ((class_id as u32) << 16) | command_id as u32
}

impl Message {
    pub fn new(class_id: u16, command_id: u16) -> Self {
        Self {
            opcode: combine_opcode(class_id, command_id),
            ..Self::default()
        }
    }

    pub fn command_id(&self) -> u16 {
        (self.opcode & 0xFFFF) as u16
    }

    pub fn class_id(&self) -> u16 {
        (self.opcode >> 16) as u16
    }

    pub fn with_request_id(mut self, request_id: u32) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_int(mut self, value: i32) -> Self {
        self.int_args.push(value);
        self
    }

    pub fn with_str(mut self, value: impl AsRef<[u8]>) -> Self {
        self.char_args.push(value.as_ref().to_vec());
        self
    }

    /// An empty reply carrying this message's opcode and request id.
    pub fn reply(&self) -> Self {
        Self {
            opcode: self.opcode,
            request_id: self.request_id,
            ..Self::default()
        }
    }

    /// Integer arguments followed by string arguments.
    pub fn args(&self) -> Vec<Arg<'_>> {
        self.int_args
            .iter()
            .map(|value| Arg::Int(*value))
            .chain(self.char_args.iter().map(|value| Arg::Str(value)))
            .collect()
    }

    /// The string argument at `index`, decoded lossily.
    pub fn str_arg(&self, index: usize) -> Option<String> {
        self.char_args
            .get(index)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    fn encoded_len(&self) -> usize {
        HEADER_LEN
            + 4 * self.int_args.len()
            + self
                .char_args
                .iter()
                .map(|value| 4 + value.len())
                .sum::<usize>()
    }
}

/// Serialises `message` into a frame.
///
/// Fails with [`FrameError::TooLarge`] when the frame would exceed
/// `MAX_FRAME_LEN`, so every encoded frame is one `decode` accepts.
pub fn encode(message: &Message) -> Result<Vec<u8>, FrameError> {
    let length = message.encoded_len();
    if length > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(length));
    }
    let mut frame = Vec::with_capacity(length);
    for word in [
        FRAME_MAGIC,
        length as u32,
        message.opcode,
        message.options,
        message.request_id,
        message.int_args.len() as u32,
        message.char_args.len() as u32,
    ] {
        frame.extend_from_slice(&word.to_ne_bytes());
    }
    for value in &message.int_args {
        frame.extend_from_slice(&value.to_ne_bytes());
    }
    for value in &message.char_args {
        frame.extend_from_slice(&(value.len() as u32).to_ne_bytes());
        frame.extend_from_slice(value);
    }
    Ok(frame)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, count: usize, what: &'static str) -> Result<&'a [u8], FrameError> {
        let end = self
            .position
            .checked_add(count)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(FrameError::Truncated(what))?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn word(&mut self, what: &'static str) -> Result<[u8; 4], FrameError> {
        let mut word = [0u8; 4];
        word.copy_from_slice(self.take(4, what)?);
        Ok(word)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, FrameError> {
        Ok(u32::from_ne_bytes(self.word(what)?))
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, FrameError> {
        Ok(i32::from_ne_bytes(self.word(what)?))
    }
}

/// Validates a preamble and returns the declared frame length.
fn check_preamble(preamble: &[u8; PREAMBLE_LEN]) -> Result<usize, FrameError> {
    let mut cursor = Cursor {
        bytes: preamble,
        position: 0,
    };
    let magic = cursor.u32("magic")?;
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let declared = cursor.u32("length")? as usize;
    if declared > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(declared));
    }
    if declared < HEADER_LEN {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: HEADER_LEN,
        });
    }
    Ok(declared)
}

/// Parses one complete frame.
pub fn decode(bytes: &[u8]) -> Result<Message, FrameError> {
    let preamble: &[u8; PREAMBLE_LEN] = bytes
        .get(..PREAMBLE_LEN)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(FrameError::Truncated("preamble"))?;
    let declared = check_preamble(preamble)?;
    if declared != bytes.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }

    let mut cursor = Cursor {
        bytes,
        position: PREAMBLE_LEN,
    };
    let opcode = cursor.u32("opcode")?;
    let options = cursor.u32("options")?;
    let request_id = cursor.u32("request id")?;
    let int_count = cursor.u32("int count")? as usize;
    let str_count = cursor.u32("str count")? as usize;

    // Each argument needs at least four bytes; reject absurd counts before allocating.
    let remaining = bytes.len() - cursor.position;
    if int_count.saturating_add(str_count).saturating_mul(4) > remaining {
        return Err(FrameError::Truncated("argument counts"));
    }

    let int_args = (0..int_count)
        .map(|_| cursor.i32("int argument"))
        .collect::<Result<Vec<_>, _>>()?;

    let char_args = (0..str_count)
        .map(|_| {
            let len = cursor.u32("str length")? as usize;
            Ok(cursor.take(len, "str argument")?.to_vec())
        })
        .collect::<Result<Vec<_>, FrameError>>()?;

    let trailing = bytes.len() - cursor.position;
    if trailing > 0 {
        return Err(FrameError::TrailingBytes(trailing));
    }

    Ok(Message {
        opcode,
        options,
        request_id,
        int_args,
        char_args,
    })
}

/// Result of waiting for one frame on a stream.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Message),
    /// The read timed out before any byte of a new frame arrived.
    Idle,
    /// The peer closed the stream cleanly between frames.
    Closed,
}

/// Reads one frame from `reader`.
///
/// Read timeouts before the first byte yield [`ReadOutcome::Idle`]. Once a frame has
/// started, timeouts are retried until the frame completes or `stop` is raised.
pub fn read_frame<R: Read>(reader: &mut R, stop: &AtomicBool) -> Result<ReadOutcome, FrameError> {
    let mut preamble = [0u8; PREAMBLE_LEN];
    match fill(reader, &mut preamble, stop, true)? {
        Fill::Complete => {}
        Fill::Idle => return Ok(ReadOutcome::Idle),
        Fill::Closed => return Ok(ReadOutcome::Closed),
    }

    let declared = check_preamble(&preamble)?;
    let mut frame = vec![0u8; declared];
    frame[..PREAMBLE_LEN].copy_from_slice(&preamble);
    match fill(reader, &mut frame[PREAMBLE_LEN..], stop, false)? {
        Fill::Complete => decode(&frame).map(ReadOutcome::Frame),
        Fill::Idle | Fill::Closed => Err(FrameError::Truncated("frame body")),
    }
}

enum Fill {
    Complete,
    Idle,
    Closed,
}

fn fill<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    stop: &AtomicBool,
    at_frame_start: bool,
) -> Result<Fill, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 && at_frame_start => return Ok(Fill::Closed),
            Ok(0) => return Err(FrameError::Truncated("stream closed mid-frame")),
            Ok(read) => filled += read,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if filled == 0 && at_frame_start {
                    return Ok(Fill::Idle);
                }
                if stop.load(Ordering::SeqCst) {
                    return Err(FrameError::Io(io::Error::new(
                        ErrorKind::Interrupted,
                        "stopped mid-frame",
                    )));
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(Fill::Complete)
}

/// Encodes `message` and writes it in one call. Nothing is written when the
/// message does not fit in a frame.
pub fn write_frame<W: Write>(writer: &mut W, message: &Message) -> Result<(), FrameError> {
    let frame = encode(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}
