//! Kermit wire-level building blocks
//!
//! Provides the packet codec layers, negotiation and window bookkeeping:
//! - Block check codes (types 1, 2, 3 and B)
//! - Data-field encoding (control/8th-bit/repeat prefixing)
//! - Packet framing (short and extended lengths)
//! - Send-Init parameters and negotiation
//! - Sliding-window sequence tracking

pub mod attributes;
pub mod checksum;
pub mod codec;
pub mod packet;
pub mod params;
pub mod window;

pub use checksum::BlockCheck;
pub use codec::{DataDecoder, DataEncoder};
pub use packet::{InputPacket, OutputPacket, PacketType, Parsed};
pub use params::{negotiate, Negotiated, SessionParameters};
pub use window::{decide, SlotDecision, Window, WindowSlot};

/// Default packet start marker (SOH)
pub const MARK: u8 = 0x01;

/// Default packet terminator (CR)
pub const EOL: u8 = 0x0D;

/// Channel abort byte; three in a row cancel the transfer
pub const ETX: u8 = 0x03;

/// Wire sequence numbers live in `0..64`
pub const SEQ_MOD: u8 = 64;

/// Hard ceiling on the extended-length data field
pub const MAX_LONG_DATA: usize = 9024;

/// Largest run a repeat prefix can describe
pub const MAX_REPEAT: usize = 94;

/// Convert a six-bit value to its printable wire form (add 32).
#[inline]
pub fn tochar(b: u8) -> u8 {
    b + 32
}

/// Convert a printable wire byte back to its value (subtract 32).
#[inline]
pub fn unchar(c: u8) -> u8 {
    c.wrapping_sub(32)
}

/// Toggle a byte between a control character and its printable twin.
#[inline]
pub fn ctl(b: u8) -> u8 {
    b ^ 0x40
}

/// True when the low seven bits form a control character.
#[inline]
pub(crate) fn is_control(b: u8) -> bool {
    let low = b & 0x7F;
    low < 0x20 || low == 0x7F
}
