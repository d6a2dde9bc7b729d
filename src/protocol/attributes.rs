//! File attribute packets
//!
//! The Attributes payload is a run of `(tag, length, value)` triples with a
//! printable length byte. Only a small set of tags is produced; everything
//! unknown is skipped by its declared length. Attribute payloads travel
//! verbatim, outside the data-field codec.

use chrono::{Local, NaiveDate, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};

use super::{tochar, unchar};

/// What to do when a received file name already exists on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessPolicy {
    /// Always create a new file (uniquified name)
    New,
    /// Replace the existing file
    Supersede,
    /// Append to the existing file
    Append,
    /// Rename away from the collision, unless RESEND recovery applies
    Warn,
}

impl AccessPolicy {
    /// Map the `)` attribute value character.
    pub fn from_wire(c: u8) -> Option<Self> {
        match c {
            b'N' => Some(Self::New),
            b'S' => Some(Self::Supersede),
            b'A' => Some(Self::Append),
            b'W' => Some(Self::Warn),
            _ => None,
        }
    }

    /// The `)` attribute value character.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::New => b'N',
            Self::Supersede => b'S',
            Self::Append => b'A',
            Self::Warn => b'W',
        }
    }
}

/// Decoded (or to-be-encoded) file attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileAttributes {
    /// `1`: exact size in bytes
    pub size_bytes: Option<u64>,
    /// `!`: rounded size in kilobytes
    pub size_k: Option<u64>,
    /// `"`: true for text (`A`), false for binary (`B8`)
    pub text: Option<bool>,
    /// `#`: modification time, in the sender's local clock
    pub mtime: Option<NaiveDateTime>,
    /// `)`: collision policy requested by the sender
    pub access: Option<AccessPolicy>,
    /// `+R`: sender asks for crash recovery
    pub resend: bool,
    /// `,`: full POSIX mode bits (octal on the wire, low nine bits kept)
    pub mode: Option<u32>,
    /// `-`: Kermit generic 3-bit protection (r=1, w=2, x=4)
    pub kermit_mode: Option<u8>,
}

/// Try the accepted date shapes, longest first.
fn parse_date(value: &[u8]) -> Option<NaiveDateTime> {
    let s = std::str::from_utf8(value).ok()?.trim();
    for fmt in ["%Y%m%d %H:%M:%S", "%Y%m%d %H:%M", "%y%m%d %H:%M:%S", "%y%m%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in ["%Y%m%d", "%y%m%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

fn parse_decimal(value: &[u8]) -> Option<u64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}

/// Local-clock conversion for the `#` tag.
pub fn mtime_from_unix(ts: i64) -> Option<NaiveDateTime> {
    Local.timestamp_opt(ts, 0).single().map(|dt| dt.naive_local())
}

/// Back to a unix timestamp when the file is finalized.
pub fn mtime_to_unix(naive: NaiveDateTime) -> Option<i64> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

impl FileAttributes {
    /// Walk the `(tag, length, value)` triples of a received payload.
    ///
    /// Historical builders set the world-execute protection bit from the
    /// read bit; masking to three bits keeps those packets readable without
    /// trusting any particular combination.
    pub fn parse(payload: &[u8]) -> Self {
        let mut a = Self::default();
        let mut i = 0;
        while i + 1 < payload.len() {
            let tag = payload[i];
            let len = usize::from(unchar(payload[i + 1]));
            i += 2;
            if i + len > payload.len() {
                break;
            }
            let value = &payload[i..i + len];
            i += len;
            match tag {
                b'!' => a.size_k = parse_decimal(value),
                b'"' => a.text = value.first().map(|&c| c == b'A'),
                b'#' => a.mtime = parse_date(value),
                b')' => a.access = value.first().and_then(|&c| AccessPolicy::from_wire(c)),
                b'+' => a.resend = value.first() == Some(&b'R'),
                b',' => {
                    a.mode = std::str::from_utf8(value)
                        .ok()
                        .and_then(|s| u32::from_str_radix(s.trim(), 8).ok());
                }
                b'-' => a.kermit_mode = value.first().map(|&c| unchar(c) & 0x07),
                b'1' => a.size_bytes = parse_decimal(value),
                _ => {}
            }
        }
        a
    }

    /// Serialize the minimal attribute set this engine sends: file type,
    /// byte size, modification time, both protection forms, and the RESEND
    /// disposition when requested.
    pub fn to_payload(&self) -> Vec<u8> {
        fn field(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
            out.push(tag);
            out.push(tochar(value.len() as u8));
            out.extend_from_slice(value);
        }

        let mut out = Vec::with_capacity(48);
        field(
            &mut out,
            b'"',
            if self.text == Some(true) { b"A" } else { b"B8" },
        );
        if let Some(size) = self.size_bytes {
            field(&mut out, b'1', size.to_string().as_bytes());
        }
        if let Some(mtime) = self.mtime {
            let stamp = mtime.format("%Y%m%d %H:%M:%S").to_string();
            field(&mut out, b'#', stamp.as_bytes());
        }
        if let Some(mode) = self.mode {
            field(&mut out, b',', format!("{:o}", mode & 0o777).as_bytes());
            let world = mode & 0o7;
            let mut bits = 0u8;
            if world & 0o4 != 0 {
                bits |= 0x01;
            }
            if world & 0o2 != 0 {
                bits |= 0x02;
            }
            if world & 0o1 != 0 {
                bits |= 0x04;
            }
            field(&mut out, b'-', &[tochar(bits)]);
        }
        if self.resend {
            field(&mut out, b'+', b"R");
        }
        out
    }
}
