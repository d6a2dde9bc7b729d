//! Data-field encoding and decoding
//!
//! The payload of most packets travels through a printable-ASCII transform:
//! control characters are quoted with QCTL, bytes with the eighth bit set are
//! prefixed with QBIN, and runs of a repeated byte collapse into a REPT
//! prefix. Send-Init bodies and Attributes packets bypass the transform
//! entirely; that decision is made by the framer, not here.

use crate::error::TransferError;

use super::{ctl, is_control, tochar, unchar, MAX_REPEAT};

/// The quoting characters and channel properties a codec pass needs.
///
/// A space in `qbin` or `rept` disables that prefix, mirroring the wire
/// convention from the Send-Init exchange.
#[derive(Debug, Clone, Copy)]
pub struct Quoting {
    /// Control-quote character
    pub qctl: u8,
    /// Eighth-bit prefix, space when inactive
    pub qbin: u8,
    /// Repeat prefix, space when inactive
    pub rept: u8,
    /// Channel only passes seven bits
    pub seven_bit: bool,
    /// Force the repeat form for spaces (required with type B checks)
    pub space_runs: bool,
}

impl Quoting {
    fn qbin_active(&self) -> bool {
        self.qbin != b' '
    }

    fn rept_active(&self) -> bool {
        self.rept != b' '
    }
}

/// Encodes raw payload bytes into their wire form.
#[derive(Debug, Clone, Copy)]
pub struct DataEncoder {
    q: Quoting,
}

impl DataEncoder {
    /// Create an encoder for the negotiated quoting set.
    pub fn new(q: Quoting) -> Self {
        Self { q }
    }

    /// Wire cost of one source byte, repeat prefix not included.
    fn encoded_len(&self, b: u8) -> usize {
        let mut n = 1;
        let mut t = b;
        if b & 0x80 != 0 && self.q.qbin_active() {
            n += 1;
            t = b & 0x7F;
        }
        let low = t & 0x7F;
        if low == self.q.qctl
            || (self.q.qbin_active() && low == self.q.qbin)
            || (self.q.rept_active() && low == self.q.rept)
            || is_control(t)
        {
            n += 1;
        }
        n
    }

    /// Emit the encoded form of a single byte.
    fn put(&self, b: u8, out: &mut Vec<u8>) {
        let mut t = b;
        if b & 0x80 != 0 && self.q.qbin_active() {
            out.push(self.q.qbin);
            t = b & 0x7F;
        }
        let low = t & 0x7F;
        if low == self.q.qctl
            || (self.q.qbin_active() && low == self.q.qbin)
            || (self.q.rept_active() && low == self.q.rept)
        {
            // the quote characters themselves travel verbatim behind QCTL
            out.push(self.q.qctl);
            out.push(t);
        } else if is_control(t) {
            out.push(self.q.qctl);
            out.push(ctl(t));
        } else {
            out.push(t);
        }
    }

    /// Encode bytes from `src` into `out` without growing `out` past
    /// `limit` wire bytes. Returns how many source bytes were consumed;
    /// a partial run is never split across the limit.
    pub fn encode(&self, src: &[u8], out: &mut Vec<u8>, limit: usize) -> usize {
        let mut i = 0;
        while i < src.len() {
            let b = src[i];
            let mut run = 1;
            while run < MAX_REPEAT && i + run < src.len() && src[i + run] == b {
                run += 1;
            }
            let single = self.encoded_len(b);
            let repeat = self.q.rept_active() && (run >= 4 || (self.q.space_runs && b == b' '));
            if repeat {
                if out.len() + 2 + single > limit {
                    break;
                }
                out.push(self.q.rept);
                out.push(tochar(run as u8));
                self.put(b, out);
                i += run;
            } else {
                if out.len() + single > limit {
                    break;
                }
                self.put(b, out);
                i += 1;
            }
        }
        i
    }
}

/// Decodes wire bytes back into the raw payload.
#[derive(Debug, Clone, Copy)]
pub struct DataDecoder {
    q: Quoting,
}

impl DataDecoder {
    /// Create a decoder for the negotiated quoting set.
    pub fn new(q: Quoting) -> Self {
        Self { q }
    }

    /// Decode one packet's data field into `out`.
    ///
    /// `limit` bounds the expanded size; repeat prefixes can inflate a short
    /// field by up to 94x, so the output buffer grows but never past it.
    pub fn decode(&self, src: &[u8], out: &mut Vec<u8>, limit: usize) -> Result<(), TransferError> {
        let mut await_count = false;
        let mut repeat: Option<u8> = None;
        let mut pending_8bit = false;
        let mut pending_ctrl = false;

        for &c in src {
            if await_count {
                repeat = Some(unchar(c));
                await_count = false;
                continue;
            }
            if !pending_ctrl {
                if self.q.rept_active() && c == self.q.rept && !pending_8bit && repeat.is_none() {
                    await_count = true;
                    continue;
                }
                if self.q.qbin_active() && c == self.q.qbin {
                    if pending_8bit {
                        // two eighth-bit prefixes in a row cannot be produced
                        return Err(TransferError::Framing("doubled eighth-bit prefix"));
                    }
                    pending_8bit = true;
                    continue;
                }
                if c == self.q.qctl {
                    pending_ctrl = true;
                    continue;
                }
            }

            let mut ch = if pending_ctrl {
                pending_ctrl = false;
                let undone = ctl(c);
                if is_control(undone) {
                    undone
                } else {
                    c
                }
            } else {
                c
            };
            if pending_8bit {
                ch |= 0x80;
                pending_8bit = false;
            }

            let n = usize::from(repeat.take().unwrap_or(1));
            if out.len() + n > limit {
                return Err(TransferError::Framing("data field expands past limit"));
            }
            for _ in 0..n {
                out.push(ch);
            }
        }

        if pending_ctrl || pending_8bit || await_count || repeat.is_some() {
            return Err(TransferError::Framing("dangling prefix in data field"));
        }
        Ok(())
    }
}

/// Text-mode send transform: lone carriage returns are dropped and every
/// line feed goes out as CR LF.
pub fn expand_newlines(src: &[u8], out: &mut Vec<u8>) {
    for &b in src {
        match b {
            b'\r' => {}
            b'\n' => {
                out.push(b'\r');
                out.push(b'\n');
            }
            _ => out.push(b),
        }
    }
}

/// Text-mode receive transform: every carriage return is dropped, paired
/// with a line feed or not.
pub fn strip_carriage_returns(src: &[u8], out: &mut Vec<u8>) {
    out.extend(src.iter().copied().filter(|&b| b != b'\r'));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const NO_LIMIT: usize = usize::MAX;

    fn quoting(qbin: u8, rept: u8, space_runs: bool) -> Quoting {
        Quoting {
            qctl: b'#',
            qbin,
            rept,
            seven_bit: false,
            space_runs,
        }
    }

    fn roundtrip(q: Quoting, data: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        let consumed = DataEncoder::new(q).encode(data, &mut wire, NO_LIMIT);
        assert_eq!(consumed, data.len());
        let mut back = Vec::new();
        DataDecoder::new(q).decode(&wire, &mut back, NO_LIMIT).unwrap();
        back
    }

    #[test]
    fn test_control_quoting() {
        let q = quoting(b' ', b' ', false);
        let mut wire = Vec::new();
        DataEncoder::new(q).encode(b"a\rb", &mut wire, NO_LIMIT);
        assert_eq!(wire, b"a#Mb");
        assert_eq!(roundtrip(q, b"a\rb"), b"a\rb");
    }

    #[test]
    fn test_quote_the_quote() {
        let q = quoting(b'&', b'~', false);
        let mut wire = Vec::new();
        DataEncoder::new(q).encode(b"#&~", &mut wire, NO_LIMIT);
        assert_eq!(wire, b"###&#~");
        assert_eq!(roundtrip(q, b"#&~"), b"#&~");
    }

    #[test]
    fn test_eighth_bit_prefix() {
        let q = quoting(b'&', b' ', false);
        let mut wire = Vec::new();
        DataEncoder::new(q).encode(&[0x8D, 0xC1], &mut wire, NO_LIMIT);
        // 0x8D strips to CR and needs both prefixes; 0xC1 strips to 'A'
        assert_eq!(wire, b"&#M&A");
        assert_eq!(roundtrip(q, &[0x8D, 0xC1]), [0x8D, 0xC1]);
    }

    #[test]
    fn test_repeat_runs() {
        let q = quoting(b' ', b'~', false);
        let mut wire = Vec::new();
        DataEncoder::new(q).encode(&[b'A'; 20], &mut wire, NO_LIMIT);
        assert_eq!(wire, vec![b'~', tochar(20), b'A']);
        assert_eq!(roundtrip(q, &[b'A'; 20]), [b'A'; 20]);

        // short runs stay literal
        let mut wire = Vec::new();
        DataEncoder::new(q).encode(b"AAA", &mut wire, NO_LIMIT);
        assert_eq!(wire, b"AAA");
    }

    #[test]
    fn test_repeat_caps_at_94() {
        let q = quoting(b' ', b'~', false);
        let mut wire = Vec::new();
        DataEncoder::new(q).encode(&[b'x'; 200], &mut wire, NO_LIMIT);
        assert_eq!(
            wire,
            vec![
                b'~',
                tochar(94),
                b'x',
                b'~',
                tochar(94),
                b'x',
                b'~',
                tochar(12),
                b'x'
            ]
        );
        assert_eq!(roundtrip(q, &[b'x'; 200]), [b'x'; 200]);
    }

    #[test]
    fn test_forced_space_runs() {
        let q = quoting(b' ', b'~', true);
        let mut wire = Vec::new();
        DataEncoder::new(q).encode(b"a b", &mut wire, NO_LIMIT);
        assert_eq!(wire, vec![b'a', b'~', tochar(1), b' ', b'b']);
        assert_eq!(roundtrip(q, b"a b"), b"a b");
    }

    #[test]
    fn test_limit_never_splits_a_sequence() {
        let q = quoting(b'&', b' ', false);
        let mut wire = Vec::new();
        // each 0x8D costs three wire bytes; a limit of 7 fits only two
        let consumed = DataEncoder::new(q).encode(&[0x8D; 5], &mut wire, 7);
        assert_eq!(consumed, 2);
        assert_eq!(wire.len(), 6);
        let mut back = Vec::new();
        DataDecoder::new(q).decode(&wire, &mut back, NO_LIMIT).unwrap();
        assert_eq!(back, [0x8D; 2]);
    }

    #[test]
    fn test_doubled_qbin_rejected() {
        let q = quoting(b'&', b' ', false);
        let mut out = Vec::new();
        assert!(DataDecoder::new(q)
            .decode(b"&&A", &mut out, NO_LIMIT)
            .is_err());
    }

    #[test]
    fn test_dangling_prefix_rejected() {
        let q = quoting(b'&', b'~', false);
        let mut out = Vec::new();
        assert!(DataDecoder::new(q).decode(b"ab#", &mut out, NO_LIMIT).is_err());
        out.clear();
        assert!(DataDecoder::new(q).decode(b"ab&", &mut out, NO_LIMIT).is_err());
        out.clear();
        assert!(DataDecoder::new(q)
            .decode(&[b'~', tochar(5)], &mut out, NO_LIMIT)
            .is_err());
    }

    #[test]
    fn test_expansion_limit_enforced() {
        let q = quoting(b' ', b'~', false);
        let wire = [b'~', tochar(94), b'z'];
        let mut out = Vec::new();
        assert!(DataDecoder::new(q).decode(&wire, &mut out, 50).is_err());
    }

    #[test]
    fn test_randomized_roundtrip() {
        let mut rng = StdRng::seed_from_u64(0x4B45524D);
        for qbin in [b' ', b'&'] {
            for rept in [b' ', b'~'] {
                for space_runs in [false, true] {
                    let q = quoting(qbin, rept, space_runs);
                    for _ in 0..40 {
                        let len = rng.gen_range(0..5000);
                        let mut data = vec![0u8; len];
                        for b in &mut data {
                            // bias toward runs so the repeat path gets exercised
                            *b = if rng.gen_bool(0.3) {
                                b' '
                            } else {
                                rng.gen::<u8>()
                            };
                        }
                        assert_eq!(roundtrip(q, &data), data);
                    }
                }
            }
        }
    }

    #[test]
    fn test_text_mode_newlines() {
        let mut out = Vec::new();
        expand_newlines(b"a\nb", &mut out);
        assert_eq!(out, b"a\r\nb");

        out.clear();
        expand_newlines(b"a\r\nb\rc", &mut out);
        assert_eq!(out, b"a\r\nbc");

        out.clear();
        strip_carriage_returns(b"a\r\nb\rc", &mut out);
        assert_eq!(out, b"a\nbc");
    }
}
