//! Sender state machine
//!
//! Walks the file list through Send-Init, per-file header/attribute
//! handshakes, the data phase (stop-and-wait, windowed or streaming) and
//! the final break. Retransmissions replay the recorded wire bytes so the
//! peer sees byte-identical packets.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::progress::{Cue, TransferState};
use crate::protocol::attributes::{self, FileAttributes};
use crate::protocol::codec::{expand_newlines, DataEncoder};
use crate::protocol::packet::{InputPacket, OutputPacket, PacketType};
use crate::protocol::params::{negotiate, SessionParameters};
use crate::protocol::window::seq_after;

use super::Transfer;

impl Transfer {
    pub(crate) fn tx_dispatch(&mut self, pkt: InputPacket) {
        match pkt.ptype {
            PacketType::Ack => self.tx_handle_ack(pkt.seq, &pkt.data),
            PacketType::Nak => self.tx_handle_nak(pkt.seq),
            _ => self.fail("Wrong packet in sequence"),
        }
    }

    fn tx_handle_nak(&mut self, seq: u8) {
        self.progress.retries += 1;
        if self.streaming()
            && matches!(self.state, TransferState::SendData | TransferState::SendEof)
        {
            self.fail("NAK WHILE STREAMING");
            return;
        }
        if self.state == TransferState::SendInit {
            match self.output_window.find(0) {
                Some(i) => {
                    let slot = self.output_window.get_mut(i).expect("slot index");
                    slot.try_count += 1;
                    let raw = slot.data.clone();
                    self.queue_raw(raw);
                }
                None => {
                    let payload = self.local.to_send_init();
                    self.queue(OutputPacket::new(PacketType::SendInit, 0, payload));
                }
            }
            return;
        }
        if let Some(i) = self.output_window.find(seq) {
            let slot = self.output_window.get_mut(i).expect("slot index");
            slot.try_count += 1;
            let raw = slot.data.clone();
            debug!(seq, tries = slot.try_count, "retransmit on nak");
            self.queue_raw(raw);
            return;
        }
        if seq == seq_after(self.last_sent) {
            // the peer is asking for a packet we have not sent yet, which
            // implicitly acknowledges everything outstanding
            debug_assert!(!self.output_window.is_empty());
            debug!(seq, "nak of next sequence, clearing the output window");
            self.output_window.clear_slots();
            let last = self.last_sent;
            self.tx_handle_ack(last, &[]);
        }
        // anything else is stale; the timeout path covers it
    }

    fn tx_handle_ack(&mut self, seq: u8, data: &[u8]) {
        // window bookkeeping runs before the state machine looks at it
        self.output_window.mark_acked(seq);
        while self.output_window.pop_front_acked().is_some() {}

        match self.state {
            TransferState::SendInit => {
                if seq != 0 {
                    return;
                }
                self.remote = SessionParameters::from_send_init(data);
                let negotiated = negotiate(&self.local, &self.remote);
                self.adopt_session(negotiated);
                self.seq = 1;
                if self.files.is_empty() {
                    self.tx_queue_break();
                } else {
                    self.tx_queue_file_header();
                }
            }
            TransferState::SendFile => {
                if seq != self.wire_seq() {
                    return;
                }
                self.seq += 1;
                if let Err(e) = self.tx_open_current() {
                    warn!(error = %e, "cannot open source file");
                    self.fail("DISK I/O ERROR");
                    return;
                }
                if self.session.as_ref().map_or(false, |s| s.attributes) {
                    let payload = self.tx_attr_payload();
                    let s = self.wire_seq();
                    self.queue(OutputPacket::new(PacketType::Attributes, s, payload));
                    self.state = TransferState::SendAttributes;
                } else {
                    self.state = TransferState::SendData;
                    if !self.windowed() && !self.streaming() {
                        self.tx_advance_data();
                    }
                }
            }
            TransferState::SendAttributes => {
                if seq != self.wire_seq() {
                    return;
                }
                if data.first() == Some(&b'1') {
                    self.tx_seek_to_resend_position(&data[1..]);
                }
                self.seq += 1;
                self.state = TransferState::SendData;
                if !self.windowed() && !self.streaming() {
                    self.tx_advance_data();
                }
            }
            TransferState::SendData => {
                if self.windowed() || self.streaming() {
                    // slot bookkeeping above is all there is to do
                    return;
                }
                if seq != self.wire_seq() {
                    return;
                }
                self.seq += 1;
                self.tx_advance_data();
            }
            TransferState::SendEof => {
                if self.output_window.is_empty() {
                    self.seq += 1;
                    self.reader = None;
                    self.tx_setup_next_file();
                }
            }
            TransferState::SendBreak => {
                if seq != self.wire_seq() {
                    return;
                }
                self.finish_complete(Cue::Upload);
            }
            _ => {}
        }
    }

    /// The receiver answered the Attributes packet with its current file
    /// length; continue from there.
    fn tx_seek_to_resend_position(&mut self, rest: &[u8]) {
        let digits: Vec<u8> = rest
            .iter()
            .copied()
            .skip_while(|b| !b.is_ascii_digit())
            .take_while(u8::is_ascii_digit)
            .collect();
        let Ok(pos) = std::str::from_utf8(&digits).unwrap_or("").parse::<u64>() else {
            return;
        };
        let size = self.files[self.file_index].size;
        let pos = pos.min(size);
        if pos == 0 {
            return;
        }
        if let Some(reader) = self.reader.as_mut() {
            if let Err(e) = reader.seek(SeekFrom::Start(pos)) {
                warn!(error = %e, "seek failed");
                self.fail("DISK I/O ERROR");
                return;
            }
        }
        info!(pos, "resuming from the receiver's position");
        self.read_total = pos;
        self.progress.bytes_transferred = pos;
    }

    /// Generate Data packets eagerly while windowing or streaming allows;
    /// returns false when the pump should stop asking.
    pub(crate) fn tx_push_data(&mut self) -> bool {
        if !(self.windowed() || self.streaming()) {
            return false;
        }
        if self.windowed() && self.output_window.is_full() {
            return false;
        }
        if self.skip_requested {
            self.tx_queue_eof(true);
            return true;
        }
        match self.tx_next_data_packet() {
            Ok(Some(pkt)) => {
                self.queue(pkt);
                true
            }
            Ok(None) => {
                self.tx_queue_eof(false);
                true
            }
            Err(e) => {
                warn!(error = %e, "read failure");
                self.fail("DISK I/O ERROR");
                true
            }
        }
    }

    /// Stop-and-wait data step: one packet per acknowledgement.
    fn tx_advance_data(&mut self) {
        if self.skip_requested {
            self.tx_queue_eof(true);
            return;
        }
        match self.tx_next_data_packet() {
            Ok(Some(pkt)) => self.queue(pkt),
            Ok(None) => self.tx_queue_eof(false),
            Err(e) => {
                warn!(error = %e, "read failure");
                self.fail("DISK I/O ERROR");
            }
        }
    }

    fn tx_next_data_packet(&mut self) -> io::Result<Option<OutputPacket>> {
        let budget = self
            .session
            .as_ref()
            .map(|s| s.max_data)
            .unwrap_or(89)
            .max(5);
        self.tx_fill_stage(budget)?;
        if self.stage.is_empty() {
            return Ok(None);
        }
        let mut wire = Vec::with_capacity(budget);
        let consumed = DataEncoder::new(self.quoting()).encode(&self.stage, &mut wire, budget);
        if consumed == 0 {
            return Ok(None);
        }
        self.stage.drain(..consumed);
        let seq = self.wire_seq();
        if self.windowed() || self.streaming() {
            self.seq += 1;
        }
        self.progress.blocks += 1;
        self.progress.bytes_transferred += consumed as u64;
        Ok(Some(OutputPacket::pre_encoded(PacketType::Data, seq, wire)))
    }

    /// Keep the staging buffer ahead of the packetizer. Reads stop at the
    /// declared size even if the file has grown since it was listed.
    fn tx_fill_stage(&mut self, want: usize) -> io::Result<()> {
        let declared = self.files.get(self.file_index).map(|f| f.size).unwrap_or(0);
        while self.stage.len() < want.saturating_mul(2) && !self.source_eof {
            let Some(reader) = self.reader.as_mut() else {
                self.source_eof = true;
                break;
            };
            let remaining = declared.saturating_sub(self.read_total);
            if remaining == 0 {
                self.source_eof = true;
                break;
            }
            let mut buf = [0u8; 4096];
            let cap = remaining.min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..cap])?;
            if n == 0 {
                self.source_eof = true;
                break;
            }
            self.read_total += n as u64;
            if self.cfg.text_mode {
                expand_newlines(&buf[..n], &mut self.stage);
            } else {
                self.stage.extend_from_slice(&buf[..n]);
            }
        }
        Ok(())
    }

    fn tx_queue_eof(&mut self, skip: bool) {
        let payload = if skip { b"D".to_vec() } else { Vec::new() };
        let seq = self.wire_seq();
        debug!(seq, skip, "end of file");
        self.queue(OutputPacket::new(PacketType::Eof, seq, payload));
        self.state = TransferState::SendEof;
    }

    fn tx_queue_file_header(&mut self) {
        let file = &self.files[self.file_index];
        // classic common-form naming: an all-lowercase name travels in
        // uppercase and the receiver folds it back
        let wire_name = if file.name.chars().any(|c| c.is_ascii_uppercase()) {
            file.name.clone()
        } else {
            file.name.to_ascii_uppercase()
        };
        info!(file = %file.name, size = file.size, "sending file");
        self.progress.file_name = file.name.clone();
        self.progress.file_path = file.path.display().to_string();
        self.progress.file_size = file.size;
        self.progress.bytes_transferred = 0;
        self.progress.blocks = 0;
        self.progress.started_at = Some(Local::now());
        let seq = self.wire_seq();
        self.queue(OutputPacket::new(
            PacketType::FileHeader,
            seq,
            wire_name.into_bytes(),
        ));
        self.state = TransferState::SendFile;
    }

    fn tx_queue_break(&mut self) {
        let seq = self.wire_seq();
        debug!(seq, "end of transmission");
        self.queue(OutputPacket::empty(PacketType::Break, seq));
        self.state = TransferState::SendBreak;
    }

    pub(crate) fn tx_setup_next_file(&mut self) {
        self.file_index += 1;
        self.stage.clear();
        self.read_total = 0;
        self.source_eof = false;
        self.skip_requested = false;
        if self.file_index < self.files.len() {
            self.tx_queue_file_header();
        } else {
            self.tx_queue_break();
        }
    }

    fn tx_open_current(&mut self) -> io::Result<()> {
        let path = self.files[self.file_index].path.clone();
        self.reader = Some(fs::File::open(path)?);
        self.read_total = 0;
        self.stage.clear();
        self.source_eof = false;
        Ok(())
    }

    fn tx_attr_payload(&self) -> Vec<u8> {
        let file = &self.files[self.file_index];
        let resend = self.cfg.resend
            && self
                .session
                .as_ref()
                .map_or(false, |s| s.resend_advertised);
        FileAttributes {
            size_bytes: Some(file.size),
            text: Some(self.cfg.text_mode),
            mtime: attributes::mtime_from_unix(file.mtime),
            mode: Some(file.mode),
            resend,
            ..FileAttributes::default()
        }
        .to_payload()
    }

    /// Timeout fallback: replay the oldest packet still waiting for its
    /// acknowledgement.
    pub(crate) fn tx_resend_oldest(&mut self) {
        let idx = self.output_window.iter().position(|s| !s.acked);
        if let Some(i) = idx {
            let slot = self.output_window.get_mut(i).expect("slot index");
            slot.try_count += 1;
            let seq = slot.seq;
            let raw = slot.data.clone();
            debug!(seq, tries = slot.try_count, "retransmit on timeout");
            self.queue_raw(raw);
        }
    }
}
