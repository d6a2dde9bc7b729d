//! Packet framing
//!
//! Wire layout: `MARK LEN SEQ TYPE DATA… CHECK… EOL`, or for long packets
//! `MARK len-0 SEQ TYPE LENX1 LENX2 HCHECK DATA… CHECK… EOL`. All numeric
//! fields are printable (`tochar`); the data field runs through the codec
//! except for Send-Init bodies, their acknowledgement echo, and Attributes
//! packets.

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::error::TransferError;

use super::checksum::{self, BlockCheck};
use super::codec::{DataDecoder, DataEncoder, Quoting};
use super::{tochar, unchar, MAX_REPEAT};

/// Kermit packet types and their single-letter wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// `S`: Send-Init, opens the session
    SendInit,
    /// `Y`: acknowledgement
    Ack,
    /// `N`: negative acknowledgement
    Nak,
    /// `D`: file data
    Data,
    /// `F`: file header carrying the name
    FileHeader,
    /// `Z`: end of file
    Eof,
    /// `B`: end of transmission (break)
    Break,
    /// `E`: fatal error with diagnostic text
    Error,
    /// `A`: file attributes
    Attributes,
    /// `I`: server initialization (recognized, not served)
    ServerInit,
    /// `X`: display text (recognized, not served)
    Text,
    /// `R`: receive initiate (recognized, not served)
    ReceiveInit,
    /// `C`: host command (recognized, not served)
    Command,
    /// `K`: Kermit command (recognized, not served)
    KermitCmd,
    /// `G`: generic command (recognized, not served)
    GenericCmd,
    /// `T`: reserved
    ReservedT,
    /// `Q`: reserved
    ReservedQ,
}

impl PacketType {
    /// Map a wire type byte, if it is a known packet letter.
    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            b'S' => Some(Self::SendInit),
            b'Y' => Some(Self::Ack),
            b'N' => Some(Self::Nak),
            b'D' => Some(Self::Data),
            b'F' => Some(Self::FileHeader),
            b'Z' => Some(Self::Eof),
            b'B' => Some(Self::Break),
            b'E' => Some(Self::Error),
            b'A' => Some(Self::Attributes),
            b'I' => Some(Self::ServerInit),
            b'X' => Some(Self::Text),
            b'R' => Some(Self::ReceiveInit),
            b'C' => Some(Self::Command),
            b'K' => Some(Self::KermitCmd),
            b'G' => Some(Self::GenericCmd),
            b'T' => Some(Self::ReservedT),
            b'Q' => Some(Self::ReservedQ),
            _ => None,
        }
    }

    /// The wire type byte.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::SendInit => b'S',
            Self::Ack => b'Y',
            Self::Nak => b'N',
            Self::Data => b'D',
            Self::FileHeader => b'F',
            Self::Eof => b'Z',
            Self::Break => b'B',
            Self::Error => b'E',
            Self::Attributes => b'A',
            Self::ServerInit => b'I',
            Self::Text => b'X',
            Self::ReceiveInit => b'R',
            Self::Command => b'C',
            Self::KermitCmd => b'K',
            Self::GenericCmd => b'G',
            Self::ReservedT => b'T',
            Self::ReservedQ => b'Q',
        }
    }

    /// Server-mode operations this engine recognizes but does not serve.
    pub fn is_server_op(self) -> bool {
        matches!(
            self,
            Self::ServerInit
                | Self::Text
                | Self::ReceiveInit
                | Self::Command
                | Self::KermitCmd
                | Self::GenericCmd
        )
    }

    /// Reserved type letters; receiving one is a protocol violation.
    pub fn is_reserved(self) -> bool {
        matches!(self, Self::ReservedT | Self::ReservedQ)
    }
}

/// A parsed and verified inbound packet.
#[derive(Debug, Clone)]
pub struct InputPacket {
    /// Wire sequence number, `0..64`
    pub seq: u8,
    /// Packet type
    pub ptype: PacketType,
    /// Whether the extended-length form carried it
    pub long_packet: bool,
    /// Decoded payload
    pub data: Vec<u8>,
}

/// An outbound packet waiting to be serialized.
#[derive(Debug, Clone)]
pub struct OutputPacket {
    /// Wire sequence number, `0..64`
    pub seq: u8,
    /// Packet type
    pub ptype: PacketType,
    /// Payload; raw unless `encoded` is set
    pub data: Vec<u8>,
    /// Payload already ran through the data-field codec
    pub encoded: bool,
}

impl OutputPacket {
    /// Packet with a raw payload; the framer encodes it on serialize.
    pub fn new(ptype: PacketType, seq: u8, data: Vec<u8>) -> Self {
        Self {
            seq,
            ptype,
            data,
            encoded: false,
        }
    }

    /// Packet whose payload was pre-encoded against the wire-length budget.
    pub fn pre_encoded(ptype: PacketType, seq: u8, data: Vec<u8>) -> Self {
        Self {
            seq,
            ptype,
            data,
            encoded: true,
        }
    }

    /// Packet with no payload.
    pub fn empty(ptype: PacketType, seq: u8) -> Self {
        Self::new(ptype, seq, Vec::new())
    }
}

/// Everything the framer needs from the negotiated session.
#[derive(Debug, Clone, Copy)]
pub struct FrameParams {
    /// Packet start marker
    pub mark: u8,
    /// Packet terminator
    pub eol: u8,
    /// Leading padding bytes the peer asked for
    pub npad: u8,
    /// Padding character
    pub padc: u8,
    /// Session block check for ordinary packets
    pub check: BlockCheck,
    /// Seven-bit channel
    pub seven_bit: bool,
    /// Long packets were negotiated
    pub long_packets: bool,
    /// Negotiated cap on the extended data field
    pub max_long_data: usize,
    /// Codec quoting set
    pub quoting: Quoting,
}

/// Result of one parse attempt over the reassembly buffer.
#[derive(Debug)]
pub enum Parsed {
    /// A complete, verified packet; its bytes were consumed
    Packet(InputPacket),
    /// No complete packet yet; a partial frame stays buffered
    Incomplete,
    /// Framing was violated; the whole buffer has been discarded
    Corrupt(&'static str),
}

/// Types whose data field bypasses the codec. The acknowledgement of the
/// Send-Init (sequence zero) echoes parameters verbatim as well.
fn verbatim_field(ptype: PacketType, seq: u8) -> bool {
    matches!(ptype, PacketType::SendInit | PacketType::Attributes)
        || (ptype == PacketType::Ack && seq == 0)
}

/// Per-packet check-type resolution: Send-Init is always checked with type
/// 1, and a NAK declares its own check type through its length.
fn check_for(ptype: PacketType, n: usize, session: BlockCheck) -> BlockCheck {
    match ptype {
        PacketType::SendInit => BlockCheck::Check1,
        PacketType::Nak => match n.saturating_sub(2) {
            1 => BlockCheck::Check1,
            2 => BlockCheck::Check2,
            3 => BlockCheck::Check3,
            _ => BlockCheck::Check1,
        },
        _ => session,
    }
}

fn decode_field(
    ptype: PacketType,
    seq: u8,
    raw: &[u8],
    p: &FrameParams,
) -> Result<Vec<u8>, TransferError> {
    if verbatim_field(ptype, seq) {
        return Ok(raw.to_vec());
    }
    let mut out = Vec::with_capacity(raw.len());
    DataDecoder::new(p.quoting).decode(raw, &mut out, raw.len().max(1) * MAX_REPEAT)?;
    Ok(out)
}

/// Try to extract one packet from the front of the reassembly buffer.
///
/// Leading noise before the MARK is dropped. A partial frame is left in
/// place for the next call; any verified framing violation discards the
/// entire buffer, per the recovery rule.
pub fn parse(buf: &mut BytesMut, p: &FrameParams) -> Parsed {
    let Some(pos) = buf.iter().position(|&b| b == p.mark) else {
        buf.clear();
        return Parsed::Incomplete;
    };
    buf.advance(pos);
    if buf.len() < 6 {
        return Parsed::Incomplete;
    }

    let len_byte = buf[1];
    if !(b' '..=b'~').contains(&len_byte) {
        buf.clear();
        return Parsed::Corrupt("unprintable length field");
    }
    let n = usize::from(unchar(len_byte));
    match n {
        0 => parse_long(buf, p),
        1 | 2 => {
            buf.clear();
            Parsed::Corrupt("reserved length value")
        }
        _ => parse_short(buf, p, n),
    }
}

fn parse_short(buf: &mut BytesMut, p: &FrameParams, n: usize) -> Parsed {
    let total = 2 + n;
    if buf.len() < total {
        return Parsed::Incomplete;
    }

    let seq = unchar(buf[2]);
    if seq > 63 {
        buf.clear();
        return Parsed::Corrupt("sequence out of range");
    }
    let Some(ptype) = PacketType::from_wire(buf[3]) else {
        buf.clear();
        return Parsed::Corrupt("unknown packet type");
    };

    let check = check_for(ptype, n, p.check);
    let clen = check.size();
    if n < 2 + clen {
        buf.clear();
        return Parsed::Corrupt("length too small for block check");
    }
    let dlen = n - 2 - clen;

    let window = &buf[1..4 + dlen];
    let received = &buf[4 + dlen..4 + dlen + clen];
    if !checksum::verify(window, received, check, p.seven_bit) {
        buf.clear();
        return Parsed::Corrupt("block check mismatch");
    }

    let data = match decode_field(ptype, seq, &buf[4..4 + dlen], p) {
        Ok(d) => d,
        Err(_) => {
            buf.clear();
            return Parsed::Corrupt("malformed data field");
        }
    };

    buf.advance(total);
    trace!(?ptype, seq, len = data.len(), "packet in");
    Parsed::Packet(InputPacket {
        seq,
        ptype,
        long_packet: false,
        data,
    })
}

fn parse_long(buf: &mut BytesMut, p: &FrameParams) -> Parsed {
    if !p.long_packets {
        buf.clear();
        return Parsed::Corrupt("long packet was not negotiated");
    }
    if buf.len() < 7 {
        return Parsed::Incomplete;
    }

    let sum: u32 = buf[1..6].iter().map(|&b| u32::from(b)).sum();
    let folded = ((sum + ((sum & 0xC0) >> 6)) & 0x3F) as u8;
    if tochar(folded) != buf[6] {
        buf.clear();
        return Parsed::Corrupt("header check mismatch");
    }

    let seq = unchar(buf[2]);
    if seq > 63 {
        buf.clear();
        return Parsed::Corrupt("sequence out of range");
    }
    let Some(ptype) = PacketType::from_wire(buf[3]) else {
        buf.clear();
        return Parsed::Corrupt("unknown packet type");
    };

    let ext = usize::from(unchar(buf[4])) * 95 + usize::from(unchar(buf[5]));
    let check = check_for(ptype, ext + 5, p.check);
    let clen = check.size();
    if ext < clen {
        buf.clear();
        return Parsed::Corrupt("length too small for block check");
    }
    let dlen = ext - clen;
    if dlen > p.max_long_data {
        buf.clear();
        return Parsed::Corrupt("long packet exceeds negotiated length");
    }

    let total = 7 + ext;
    if buf.len() < total {
        return Parsed::Incomplete;
    }

    let window = &buf[1..7 + dlen];
    let received = &buf[7 + dlen..7 + dlen + clen];
    if !checksum::verify(window, received, check, p.seven_bit) {
        buf.clear();
        return Parsed::Corrupt("block check mismatch");
    }

    let data = match decode_field(ptype, seq, &buf[7..7 + dlen], p) {
        Ok(d) => d,
        Err(_) => {
            buf.clear();
            return Parsed::Corrupt("malformed data field");
        }
    };

    buf.advance(total);
    trace!(?ptype, seq, len = data.len(), "long packet in");
    Parsed::Packet(InputPacket {
        seq,
        ptype,
        long_packet: true,
        data,
    })
}

/// Serialize a packet to its wire bytes, padding included.
///
/// The short form is used whenever the payload and check fit inside the
/// 94-byte length field; otherwise the extended header is emitted. The
/// caller is responsible for only queueing oversized payloads when long
/// packets were negotiated.
pub fn serialize(pkt: &OutputPacket, p: &FrameParams) -> Vec<u8> {
    let check = if pkt.ptype == PacketType::SendInit
        || (pkt.ptype == PacketType::Ack && pkt.seq == 0)
    {
        BlockCheck::Check1
    } else if pkt.ptype == PacketType::Nak && p.check == BlockCheck::CheckB {
        // a NAK announces its check through its length, and length two
        // reads back as type 2
        BlockCheck::Check2
    } else {
        p.check
    };

    let wire_data = if pkt.encoded || verbatim_field(pkt.ptype, pkt.seq) {
        pkt.data.clone()
    } else {
        let mut out = Vec::with_capacity(pkt.data.len() * 2);
        DataEncoder::new(p.quoting).encode(&pkt.data, &mut out, usize::MAX);
        out
    };

    let clen = check.size();
    let n = wire_data.len() + 2 + clen;
    let mut out = Vec::with_capacity(usize::from(p.npad) + n + 10);
    out.resize(usize::from(p.npad), p.padc);
    out.push(p.mark);
    let len_pos = out.len();
    if n <= 94 {
        out.push(tochar(n as u8));
        out.push(tochar(pkt.seq));
        out.push(pkt.ptype.to_wire());
    } else {
        let ext = wire_data.len() + clen;
        out.push(tochar(0));
        out.push(tochar(pkt.seq));
        out.push(pkt.ptype.to_wire());
        out.push(tochar((ext / 95) as u8));
        out.push(tochar((ext % 95) as u8));
        let sum: u32 = out[len_pos..].iter().map(|&b| u32::from(b)).sum();
        let folded = ((sum + ((sum & 0xC0) >> 6)) & 0x3F) as u8;
        out.push(tochar(folded));
    }
    out.extend_from_slice(&wire_data);
    let cbytes = checksum::compute(&out[len_pos..], check, p.seven_bit);
    out.extend_from_slice(&cbytes);
    out.push(p.eol);
    trace!(ptype = ?pkt.ptype, seq = pkt.seq, wire = out.len(), "packet out");
    out
}
