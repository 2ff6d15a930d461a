//! Typed command identifiers.

/// A family of commands sharing one class id.
///
/// Implemented by `#[repr(u16)]` enums so handlers are registered against a
/// variant instead of a bare opcode.
pub trait CommandSet: Copy + Send + Sync + 'static {
    /// The 16-bit command id placed in the low half of the opcode.
    fn id(self) -> u16;

    /// Maps a received command id back to a variant.
    fn from_id(id: u16) -> Option<Self>;
}

/// Untyped command id for managers whose command table is only known at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawCommand(pub u16);

impl CommandSet for RawCommand {
    fn id(self) -> u16 {
        self.0
    }

    fn from_id(id: u16) -> Option<Self> {
        Some(Self(id))
    }
}
