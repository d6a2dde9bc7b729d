//! Session parameters and negotiation
//!
//! Three parameter sets exist per transfer: `local` (what we offer),
//! `remote` (parsed from the peer's Send-Init or its acknowledgement) and
//! the negotiated session set produced by [`negotiate`]. The session set is
//! never consulted before negotiation completes.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::attributes::AccessPolicy;
use super::checksum::BlockCheck;
use super::codec::Quoting;
use super::{ctl, tochar, unchar, EOL, MARK, MAX_LONG_DATA};

/// Capability bit: extended-length packets
pub const CAP_LONG_PACKETS: u32 = 0x02;
/// Capability bit: full-duplex sliding windows
pub const CAP_SLIDING_WINDOW: u32 = 0x04;
/// Capability bit: Attributes packets
pub const CAP_ATTRIBUTES: u32 = 0x08;
/// Capability bit: crash recovery via RESEND
pub const CAP_RESEND: u32 = 0x10;

/// WHATAMI bit: peer can stream without per-packet acknowledgements
pub const WHATAMI_STREAMING: u8 = 0x08;
/// WHATAMI bit: the field itself is meaningful
pub const WHATAMI_VALID: u8 = 0x20;

/// Quote characters must land in the printable punctuation ranges.
fn valid_prefix(c: u8) -> bool {
    (33..=62).contains(&c) || (96..=126).contains(&c)
}

/// One side's packet-level parameters.
#[derive(Debug, Clone)]
pub struct SessionParameters {
    /// Packet start marker
    pub mark: u8,
    /// Short-packet length cap (LEN value), 1..94
    pub max_len: u8,
    /// Seconds of silence before the peer should act
    pub timeout_seconds: u8,
    /// Leading padding bytes wanted before each packet
    pub pad_count: u8,
    /// Padding character
    pub pad_char: u8,
    /// Packet terminator
    pub eol: u8,
    /// Control-quote character
    pub qctl: u8,
    /// Eighth-bit quote: `Y` offered, `N` refused, space not needed, or a
    /// concrete punctuation character
    pub qbin: u8,
    /// Check-type character: `1`, `2`, `3` or `B`
    pub chkt: u8,
    /// Repeat prefix, space when disabled
    pub rept: u8,
    /// Capability bitmask
    pub capas: u32,
    /// WHATAMI bitmask
    pub whatami: u8,
    /// Window size offer, 1..31
    pub windo: u8,
    /// Extended length, high part (base 95)
    pub maxlx1: u8,
    /// Extended length, low part
    pub maxlx2: u8,
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self {
            mark: MARK,
            max_len: 94,
            timeout_seconds: 10,
            pad_count: 0,
            pad_char: 0,
            eol: EOL,
            qctl: b'#',
            qbin: b' ',
            chkt: b'1',
            rept: b' ',
            capas: 0,
            whatami: 0,
            windo: 1,
            maxlx1: 0,
            maxlx2: 0,
        }
    }
}

impl SessionParameters {
    /// Extended data-field cap encoded by MAXLX1/MAXLX2.
    pub fn max_long(&self) -> usize {
        (usize::from(self.maxlx1) * 95 + usize::from(self.maxlx2)).min(MAX_LONG_DATA)
    }

    /// Build the Send-Init data field (also used for its acknowledgement).
    pub fn to_send_init(&self) -> Vec<u8> {
        vec![
            tochar(self.max_len),
            tochar(self.timeout_seconds),
            tochar(self.pad_count),
            ctl(self.pad_char),
            tochar(self.eol),
            self.qctl,
            self.qbin,
            self.chkt,
            self.rept,
            tochar((self.capas & 0x3E) as u8),
            tochar(self.windo),
            tochar(self.maxlx1),
            tochar(self.maxlx2),
            tochar(self.whatami),
        ]
    }

    /// Parse a Send-Init data field; absent trailing fields keep their
    /// defaults, which all mean "nothing special requested".
    pub fn from_send_init(payload: &[u8]) -> Self {
        let mut p = Self::default();
        if !payload.is_empty() {
            p.max_len = unchar(payload[0]).min(94);
        }
        if payload.len() > 1 {
            p.timeout_seconds = unchar(payload[1]);
        }
        if payload.len() > 2 {
            p.pad_count = unchar(payload[2]);
        }
        if payload.len() > 3 {
            p.pad_char = ctl(payload[3]);
        }
        if payload.len() > 4 {
            p.eol = unchar(payload[4]);
        }
        if payload.len() > 5 {
            p.qctl = payload[5];
        }
        if payload.len() > 6 {
            p.qbin = payload[6];
        }
        if payload.len() > 7 {
            p.chkt = payload[7];
        }
        if payload.len() > 8 {
            p.rept = payload[8];
        }

        // capability bytes chain while the low bit is set
        let mut i = 9;
        if payload.len() > i {
            let mut v = unchar(payload[i]);
            p.capas = u32::from(v & 0x3E);
            while v & 0x01 != 0 && payload.len() > i + 1 {
                i += 1;
                v = unchar(payload[i]);
            }
            i += 1;
            if payload.len() > i {
                p.windo = unchar(payload[i]);
                i += 1;
            }
            if payload.len() > i {
                p.maxlx1 = unchar(payload[i]);
                i += 1;
            }
            if payload.len() > i {
                p.maxlx2 = unchar(payload[i]);
                i += 1;
            }
            if payload.len() > i {
                p.whatami = unchar(payload[i]);
            }
        }
        p
    }
}

/// The outcome of parameter negotiation.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// The merged session parameter set
    pub params: SessionParameters,
    /// Block check for everything after the Send-Init exchange
    pub check: BlockCheck,
    /// Extended-length packets may be used
    pub long_packets: bool,
    /// Attributes packets will be exchanged
    pub attributes: bool,
    /// The receive side honors RESEND dispositions
    pub do_resend: bool,
    /// Both sides explicitly advertised the RESEND capability
    pub resend_advertised: bool,
    /// One-way streaming is in effect (disables windows and timeouts)
    pub streaming: bool,
    /// Sliding windows are in effect
    pub windowing: bool,
    /// Ring size for both windows, 1 when windowing is off
    pub window_size: u8,
    /// Negotiated cap on the extended data field
    pub max_long_data: usize,
    /// Usable payload bytes per Data packet
    pub max_data: usize,
}

impl Negotiated {
    /// Codec quoting set for this session.
    pub fn quoting(&self, seven_bit: bool) -> Quoting {
        Quoting {
            qctl: self.params.qctl,
            qbin: self.params.qbin,
            rept: self.params.rept,
            seven_bit,
            space_runs: self.check == BlockCheck::CheckB,
        }
    }
}

/// Merge our offer with the peer's Send-Init.
pub fn negotiate(local: &SessionParameters, remote: &SessionParameters) -> Negotiated {
    let mut s = SessionParameters {
        mark: local.mark,
        max_len: local.max_len.min(remote.max_len),
        timeout_seconds: local.timeout_seconds,
        pad_count: remote.pad_count,
        pad_char: remote.pad_char,
        eol: remote.eol,
        qctl: local.qctl,
        ..SessionParameters::default()
    };

    s.qbin = match remote.qbin {
        b'Y' => {
            if valid_prefix(local.qbin) {
                local.qbin
            } else {
                b' '
            }
        }
        b'N' | b' ' => b' ',
        c if valid_prefix(c) => c,
        _ => b' ',
    };
    if s.qbin == s.qctl {
        s.qbin = b' ';
    }

    let check = if local.chkt == remote.chkt {
        BlockCheck::from_wire(local.chkt).unwrap_or(BlockCheck::Check1)
    } else {
        BlockCheck::Check1
    };
    s.chkt = check.to_wire();

    s.rept = if local.rept == remote.rept && valid_prefix(local.rept) {
        local.rept
    } else {
        b' '
    };
    if s.rept == s.qctl || (s.qbin != b' ' && s.rept == s.qbin) {
        s.rept = b' ';
    }

    let attributes =
        local.capas & CAP_ATTRIBUTES != 0 && remote.capas & CAP_ATTRIBUTES != 0;
    if attributes {
        s.capas |= CAP_ATTRIBUTES | CAP_RESEND;
    }
    let resend_advertised = local.capas & CAP_RESEND != 0 && remote.capas & CAP_RESEND != 0;

    let long_packets =
        local.capas & CAP_LONG_PACKETS != 0 && remote.capas & CAP_LONG_PACKETS != 0;
    let max_long_data = if long_packets {
        s.capas |= CAP_LONG_PACKETS;
        local.max_long().min(remote.max_long())
    } else {
        0
    };
    s.maxlx1 = (max_long_data / 95) as u8;
    s.maxlx2 = (max_long_data % 95) as u8;

    let streaming =
        local.whatami & WHATAMI_STREAMING != 0 && remote.whatami & WHATAMI_STREAMING != 0;
    s.whatami = if streaming {
        WHATAMI_VALID | WHATAMI_STREAMING
    } else {
        WHATAMI_VALID
    };

    let mut windowing =
        local.capas & CAP_SLIDING_WINDOW != 0 && remote.capas & CAP_SLIDING_WINDOW != 0;
    let mut window_size = local.windo.min(remote.windo).min(31);
    if window_size < 2 || streaming {
        windowing = false;
        window_size = 1;
    }
    if windowing {
        s.capas |= CAP_SLIDING_WINDOW;
    }
    s.windo = window_size;

    let clen = check.size();
    let max_data = if long_packets && max_long_data > clen {
        max_long_data - clen
    } else {
        usize::from(s.max_len).saturating_sub(2 + clen)
    };

    debug!(
        check = %check.code(),
        long_packets,
        windowing,
        window_size,
        streaming,
        attributes,
        max_data,
        qbin = %(s.qbin as char),
        rept = %(s.rept as char),
        "session negotiated"
    );

    let do_resend = s.capas & CAP_RESEND != 0;
    Negotiated {
        params: s,
        check,
        long_packets,
        attributes,
        do_resend,
        resend_advertised,
        streaming,
        windowing,
        window_size,
        max_long_data,
        max_data,
    }
}

/// Caller-facing knobs for one transfer, turned into the `local` parameter
/// set at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Desired data-field size when long packets are in play
    pub block_size: u16,
    /// Window size offer, 1 disables sliding windows
    pub window_size: u8,
    /// Offer extended-length packets
    pub long_packets: bool,
    /// Offer one-way streaming
    pub streaming: bool,
    /// Preferred block check
    pub check: BlockCheck,
    /// Translate line endings and strip carriage returns
    pub text_mode: bool,
    /// The channel only passes seven bits
    pub seven_bit: bool,
    /// Offer crash recovery (RESEND)
    pub resend: bool,
    /// What to do when a received file name already exists
    pub access: AccessPolicy,
    /// Seconds of silence before acting, 1..94
    pub timeout_seconds: u8,
    /// Timeout strikes before the transfer aborts
    pub timeout_max: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: 995,
            window_size: 1,
            long_packets: true,
            streaming: false,
            check: BlockCheck::Check3,
            text_mode: false,
            seven_bit: false,
            resend: false,
            access: AccessPolicy::Warn,
            timeout_seconds: 10,
            timeout_max: 5,
        }
    }
}

impl TransferConfig {
    /// Build the local parameter offer.
    pub fn local_params(&self) -> SessionParameters {
        let mut p = SessionParameters {
            max_len: 94,
            timeout_seconds: self.timeout_seconds.clamp(1, 94),
            qctl: b'#',
            qbin: if self.seven_bit { b'&' } else { b'Y' },
            chkt: self.check.to_wire(),
            rept: b'~',
            capas: CAP_ATTRIBUTES,
            windo: self.window_size.clamp(1, 31),
            whatami: WHATAMI_VALID,
            ..SessionParameters::default()
        };
        if self.long_packets {
            p.capas |= CAP_LONG_PACKETS;
            let ext = usize::from(self.block_size).min(MAX_LONG_DATA);
            p.maxlx1 = (ext / 95) as u8;
            p.maxlx2 = (ext % 95) as u8;
        }
        if p.windo > 1 {
            p.capas |= CAP_SLIDING_WINDOW;
        }
        if self.resend {
            p.capas |= CAP_RESEND;
        }
        if self.streaming {
            p.whatami |= WHATAMI_STREAMING;
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(cfg: &TransferConfig) -> SessionParameters {
        cfg.local_params()
    }

    #[test]
    fn test_send_init_roundtrip() {
        let cfg = TransferConfig {
            window_size: 4,
            streaming: true,
            resend: true,
            ..TransferConfig::default()
        };
        let p = offer(&cfg);
        let back = SessionParameters::from_send_init(&p.to_send_init());
        assert_eq!(back.max_len, p.max_len);
        assert_eq!(back.timeout_seconds, p.timeout_seconds);
        assert_eq!(back.eol, p.eol);
        assert_eq!(back.qctl, p.qctl);
        assert_eq!(back.qbin, p.qbin);
        assert_eq!(back.chkt, p.chkt);
        assert_eq!(back.rept, p.rept);
        assert_eq!(back.capas, p.capas & 0x3E);
        assert_eq!(back.windo, p.windo);
        assert_eq!(back.maxlx1, p.maxlx1);
        assert_eq!(back.maxlx2, p.maxlx2);
        assert_eq!(back.whatami, p.whatami);
    }

    #[test]
    fn test_truncated_send_init_keeps_defaults() {
        // a minimal peer sends only the classic nine fields
        let p = SessionParameters::from_send_init(&[
            tochar(80),
            tochar(5),
            tochar(0),
            ctl(0),
            tochar(0x0D),
            b'#',
            b'Y',
            b'1',
            b' ',
        ]);
        assert_eq!(p.max_len, 80);
        assert_eq!(p.capas, 0);
        assert_eq!(p.windo, 1);
        assert_eq!(p.whatami, 0);
    }

    #[test]
    fn test_default_negotiation() {
        let local = offer(&TransferConfig::default());
        let remote = offer(&TransferConfig::default());
        let n = negotiate(&local, &remote);
        assert_eq!(n.check, BlockCheck::Check3);
        // both sides offered Y: nobody needs eighth-bit quoting
        assert_eq!(n.params.qbin, b' ');
        assert_eq!(n.params.rept, b'~');
        assert!(n.long_packets);
        assert_eq!(n.max_long_data, 995);
        assert_eq!(n.max_data, 995 - 3);
        assert!(!n.windowing);
        assert_eq!(n.window_size, 1);
        assert!(!n.streaming);
        assert!(n.attributes);
        assert!(n.do_resend);
    }

    #[test]
    fn test_check_disagreement_falls_back_to_type_1() {
        let local = offer(&TransferConfig::default());
        let remote = offer(&TransferConfig {
            check: BlockCheck::Check2,
            ..TransferConfig::default()
        });
        let n = negotiate(&local, &remote);
        assert_eq!(n.check, BlockCheck::Check1);
    }

    #[test]
    fn test_seven_bit_agrees_on_qbin() {
        let local = offer(&TransferConfig {
            seven_bit: true,
            ..TransferConfig::default()
        });
        let remote = offer(&TransferConfig::default());
        // peer offered Y, we need quoting: our prefix wins
        let n = negotiate(&local, &remote);
        assert_eq!(n.params.qbin, b'&');
        // and the concrete character is adopted in the other direction
        let n = negotiate(&remote, &local);
        assert_eq!(n.params.qbin, b'&');
    }

    #[test]
    fn test_window_negotiation() {
        let a = offer(&TransferConfig {
            window_size: 7,
            ..TransferConfig::default()
        });
        let b = offer(&TransferConfig {
            window_size: 4,
            ..TransferConfig::default()
        });
        let n = negotiate(&a, &b);
        assert!(n.windowing);
        assert_eq!(n.window_size, 4);

        // a peer that cannot window collapses the session to stop-and-wait
        let c = offer(&TransferConfig::default());
        let n = negotiate(&a, &c);
        assert!(!n.windowing);
        assert_eq!(n.window_size, 1);
    }

    #[test]
    fn test_streaming_overrides_windowing() {
        let a = offer(&TransferConfig {
            window_size: 8,
            streaming: true,
            ..TransferConfig::default()
        });
        let n = negotiate(&a, &a.clone());
        assert!(n.streaming);
        assert!(!n.windowing);
        assert_eq!(n.window_size, 1);
        assert_eq!(n.params.whatami, WHATAMI_VALID | WHATAMI_STREAMING);
    }

    #[test]
    fn test_long_packet_minimum_wins() {
        let a = offer(&TransferConfig {
            block_size: 4000,
            ..TransferConfig::default()
        });
        let b = offer(&TransferConfig {
            block_size: 995,
            ..TransferConfig::default()
        });
        let n = negotiate(&a, &b);
        assert_eq!(n.max_long_data, 995);

        let c = offer(&TransferConfig {
            long_packets: false,
            ..TransferConfig::default()
        });
        let n = negotiate(&a, &c);
        assert!(!n.long_packets);
        assert_eq!(n.max_data, 94 - 2 - 3);
    }

    #[test]
    fn test_resend_advertised_needs_both() {
        let yes = offer(&TransferConfig {
            resend: true,
            ..TransferConfig::default()
        });
        let no = offer(&TransferConfig::default());
        assert!(negotiate(&yes, &yes.clone()).resend_advertised);
        assert!(!negotiate(&yes, &no).resend_advertised);
    }
}
