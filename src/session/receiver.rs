//! Receiver state machine
//!
//! Accepts the Send-Init, then alternates between file headers and data
//! until the sender breaks the batch. Files open lazily on the first Data
//! packet (or early, when a RESEND attribute asks to continue an existing
//! file) and are finalized with their mode and modification time once the
//! end-of-file packet clears the window.

use std::fs;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::progress::{Cue, TransferState};
use crate::protocol::attributes::{self, AccessPolicy, FileAttributes};
use crate::protocol::codec::strip_carriage_returns;
use crate::protocol::packet::{InputPacket, OutputPacket, PacketType};
use crate::protocol::params::{negotiate, SessionParameters};
use crate::protocol::window::{decide, SlotDecision, WindowSlot};

use super::Transfer;

/// Strip any path, drop control characters, and fold a pure-uppercase
/// common-form name back to lowercase.
fn sanitize_name(data: &[u8]) -> String {
    let raw = String::from_utf8_lossy(data);
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(raw.as_ref())
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();
    let base = if base.is_empty() {
        "file".to_string()
    } else {
        base
    };
    if base.chars().any(|c| c.is_ascii_lowercase()) {
        base
    } else {
        base.to_lowercase()
    }
}

fn unique_path(dir: &Path, name: &str) -> io::Result<PathBuf> {
    for i in 1..=9999u32 {
        let candidate = dir.join(format!("{name}.{i:04}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "no free file name",
    ))
}

impl Transfer {
    pub(crate) fn rx_dispatch(&mut self, pkt: InputPacket) {
        // a retransmitted Send-Init after negotiation wants its echo again
        if pkt.ptype == PacketType::SendInit && self.state != TransferState::ReceiveInit {
            self.progress.retries += 1;
            self.rx_replay_ack(0);
            return;
        }
        match decide(&self.input_window, pkt.seq) {
            SlotDecision::Next => self.rx_fsm(pkt),
            SlotDecision::Duplicate(i) => self.rx_duplicate(i, pkt),
            SlotDecision::Lost { gaps } => {
                for gap in gaps {
                    if !self.rx_make_room() {
                        debug!(seq = pkt.seq, "window full behind a hole, dropping");
                        return;
                    }
                    debug!(gap, "sequence missing");
                    self.input_window.try_push(WindowSlot::gap(gap));
                    self.queue(OutputPacket::empty(PacketType::Nak, gap));
                    self.progress.retries += 1;
                }
                self.rx_fsm(pkt);
            }
            SlotDecision::Outside => {
                self.progress.retries += 1;
                self.rx_replay_ack(pkt.seq);
            }
        }
    }

    /// Resend the acknowledgement we recorded for a sequence, if any.
    fn rx_replay_ack(&mut self, seq: u8) {
        if let Some(i) = self.output_window.find(seq) {
            debug!(seq, "replaying acknowledgement");
            let raw = self.output_window.get(i).expect("slot index").data.clone();
            self.queue_raw(raw);
        }
    }

    fn rx_duplicate(&mut self, i: usize, pkt: InputPacket) {
        let seq = pkt.seq;
        let filled = {
            let slot = self.input_window.get_mut(i).expect("slot index");
            if slot.is_gap()
                && pkt.ptype == PacketType::Data
                && self.state == TransferState::ReceiveData
            {
                // the retransmission plugs a hole in the window
                slot.ptype = PacketType::Data;
                slot.data = pkt.data;
                slot.acked = true;
                slot.try_count += 1;
                true
            } else {
                false
            }
        };
        if filled {
            debug!(seq, "hole filled");
            self.progress.blocks += 1;
            if !self.streaming() {
                self.queue(OutputPacket::empty(PacketType::Ack, seq));
            }
            self.rx_try_finalize_eof();
        } else {
            self.progress.retries += 1;
            self.rx_replay_ack(seq);
        }
    }

    fn rx_fsm(&mut self, pkt: InputPacket) {
        match self.state {
            TransferState::ReceiveInit => self.rx_state_init(pkt),
            TransferState::ReceiveFile => self.rx_state_file(pkt),
            TransferState::ReceiveData => self.rx_state_data(pkt),
            _ => {}
        }
    }

    fn rx_reject(&mut self, pkt: &InputPacket) {
        if pkt.ptype.is_server_op() || pkt.ptype.is_reserved() {
            self.fail("Unsupported packet type");
        } else {
            self.fail("Wrong packet in sequence");
        }
    }

    fn rx_state_init(&mut self, pkt: InputPacket) {
        match pkt.ptype {
            PacketType::SendInit => {
                self.remote = SessionParameters::from_send_init(&pkt.data);
                let negotiated = negotiate(&self.local, &self.remote);
                let echo = negotiated.params.to_send_init();
                self.adopt_session(negotiated);
                let mut slot = WindowSlot::new(pkt.seq, PacketType::SendInit, Vec::new());
                slot.acked = true;
                self.input_window.try_push(slot);
                self.queue(OutputPacket::new(PacketType::Ack, pkt.seq, echo));
                self.state = TransferState::ReceiveFile;
            }
            _ => self.rx_reject(&pkt),
        }
    }

    fn rx_state_file(&mut self, pkt: InputPacket) {
        match pkt.ptype {
            PacketType::FileHeader => {
                let name = sanitize_name(&pkt.data);
                info!(file = %name, "receiving file");
                self.rx_reset_file();
                self.rx_name = name.clone();
                self.progress.file_name = name.clone();
                self.progress.file_path = String::new();
                self.progress.file_size = 0;
                self.progress.bytes_transferred = 0;
                self.progress.blocks = 0;
                self.progress.started_at = Some(Local::now());
                let mut slot = WindowSlot::new(pkt.seq, PacketType::FileHeader, Vec::new());
                slot.acked = true;
                if !self.rx_store(slot) {
                    return;
                }
                self.queue(OutputPacket::new(
                    PacketType::Ack,
                    pkt.seq,
                    name.into_bytes(),
                ));
                self.state = TransferState::ReceiveData;
            }
            PacketType::Break => {
                let mut slot = WindowSlot::new(pkt.seq, PacketType::Break, Vec::new());
                slot.acked = true;
                self.rx_store(slot);
                self.queue(OutputPacket::empty(PacketType::Ack, pkt.seq));
                self.finish_complete(Cue::Download);
            }
            _ => self.rx_reject(&pkt),
        }
    }

    fn rx_state_data(&mut self, pkt: InputPacket) {
        match pkt.ptype {
            PacketType::Attributes => {
                self.rx_attrs = FileAttributes::parse(&pkt.data);
                if let Some(size) = self
                    .rx_attrs
                    .size_bytes
                    .or(self.rx_attrs.size_k.map(|k| k * 1024))
                {
                    self.progress.file_size = size;
                }
                let ack = self.rx_attr_ack();
                if self.state == TransferState::Abort {
                    return;
                }
                let mut slot = WindowSlot::new(pkt.seq, PacketType::Attributes, Vec::new());
                slot.acked = true;
                if !self.rx_store(slot) {
                    return;
                }
                self.queue(OutputPacket::new(PacketType::Ack, pkt.seq, ack));
            }
            PacketType::Data => {
                if !self.rx_opened {
                    if let Err(e) = self.rx_open_file() {
                        warn!(error = %e, "cannot create file");
                        self.fail("CANNOT CREATE FILE");
                        return;
                    }
                }
                let seq = pkt.seq;
                let mut slot = WindowSlot::new(seq, PacketType::Data, pkt.data);
                slot.acked = true;
                if !self.rx_store(slot) {
                    return;
                }
                self.progress.blocks += 1;
                if !self.streaming() {
                    self.queue(OutputPacket::empty(PacketType::Ack, seq));
                }
            }
            PacketType::Eof => {
                let skip = pkt.data.first() == Some(&b'D');
                let seq = pkt.seq;
                let slot = WindowSlot::new(seq, PacketType::Eof, pkt.data);
                if !self.rx_store(slot) {
                    return;
                }
                if skip {
                    self.rx_finalize_skip(seq);
                } else {
                    self.rx_try_finalize_eof();
                }
            }
            _ => self.rx_reject(&pkt),
        }
    }

    /// Answer an Attributes packet: `1_<pos>` to continue an interrupted
    /// file, `N+` to refuse recovery on a text transfer, plain `Y`
    /// otherwise.
    fn rx_attr_ack(&mut self) -> Vec<u8> {
        let do_resend = self.session.as_ref().map_or(false, |s| s.do_resend);
        if self.rx_attrs.resend && do_resend && !self.cfg.text_mode {
            match self.rx_open_resend() {
                Ok(pos) => format!("1_{pos}").into_bytes(),
                Err(e) => {
                    warn!(error = %e, "cannot reopen file for recovery");
                    self.fail("CANNOT CREATE FILE");
                    Vec::new()
                }
            }
        } else if self.rx_attrs.resend {
            // byte offsets do not line up across the text transform
            b"N+".to_vec()
        } else {
            b"Y".to_vec()
        }
    }

    /// Roll acknowledged slots off the tail until a slot is free, flushing
    /// their payloads. Fails when a hole blocks the tail; nothing behind a
    /// missing packet may reach the file.
    fn rx_make_room(&mut self) -> bool {
        while self.input_window.is_full() {
            if !self.input_window.front().map_or(false, |s| s.acked) {
                return false;
            }
            let slot = self
                .input_window
                .pop_front_acked()
                .expect("front checked acked");
            self.rx_flush_slot(slot);
        }
        true
    }

    /// Store a genuinely new packet, flushing whatever rolls off the tail.
    /// Refuses (drops the newest) while a hole blocks the tail.
    fn rx_store(&mut self, slot: WindowSlot) -> bool {
        if !self.rx_make_room() {
            debug!(seq = slot.seq, "window jammed behind a hole, dropping");
            return false;
        }
        self.input_window.try_push(slot);
        true
    }

    fn rx_flush_slot(&mut self, slot: WindowSlot) {
        if slot.ptype == PacketType::Data && slot.acked && !slot.data.is_empty() {
            if let Err(e) = self.rx_write(&slot.data) {
                warn!(error = %e, "write failure");
                self.fail("DISK I/O ERROR");
            }
        }
    }

    fn rx_write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.skip_requested {
            return Ok(());
        }
        let Some(file) = self.rx_file.as_mut() else {
            return Ok(());
        };
        if self.cfg.text_mode {
            let mut stripped = Vec::with_capacity(data.len());
            strip_carriage_returns(data, &mut stripped);
            file.write_all(&stripped)?;
            self.rx_bytes += stripped.len() as u64;
        } else {
            file.write_all(data)?;
            self.rx_bytes += data.len() as u64;
        }
        self.progress.bytes_transferred = self.rx_bytes;
        Ok(())
    }

    /// Complete the file once every slot ahead of the stored end-of-file
    /// marker is acknowledged; otherwise chase the oldest hole.
    fn rx_try_finalize_eof(&mut self) {
        let Some(z) = self
            .input_window
            .iter()
            .position(|s| s.ptype == PacketType::Eof)
        else {
            return;
        };
        if self.input_window.iter().take(z).any(|s| !s.acked) {
            self.rx_nak_missing();
            return;
        }
        // a zero-length file never saw a Data packet
        if !self.rx_opened {
            if let Err(e) = self.rx_open_file() {
                warn!(error = %e, "cannot create file");
                self.fail("CANNOT CREATE FILE");
                return;
            }
        }
        let zseq = self.input_window.get(z).expect("slot index").seq;
        for _ in 0..z {
            let slot = self
                .input_window
                .pop_front_acked()
                .expect("verified acked run");
            self.rx_flush_slot(slot);
        }
        self.input_window.clear_slots();
        if self.state == TransferState::Abort {
            return;
        }
        if let Err(e) = self.rx_finalize_file() {
            warn!(error = %e, "finalize failure");
            self.fail("DISK I/O ERROR");
            return;
        }
        info!(file = %self.rx_name, bytes = self.rx_bytes, "file complete");
        self.queue(OutputPacket::empty(PacketType::Ack, zseq));
        self.rx_reset_file();
        self.state = TransferState::ReceiveFile;
    }

    /// The sender abandoned the file mid-flight; keep what arrived.
    fn rx_finalize_skip(&mut self, zseq: u8) {
        while let Some(slot) = self.input_window.pop_front_acked() {
            self.rx_flush_slot(slot);
        }
        self.input_window.clear_slots();
        info!(
            file = %self.rx_name,
            bytes = self.rx_bytes,
            "sender skipped file, partial kept"
        );
        self.progress.last_message = format!("{} skipped by sender", self.rx_name);
        self.queue(OutputPacket::empty(PacketType::Ack, zseq));
        self.rx_reset_file();
        self.state = TransferState::ReceiveFile;
    }

    /// NAK the oldest missing sequence, or the next expected one when the
    /// window has no holes.
    pub(crate) fn rx_nak_missing(&mut self) {
        let seq = self
            .input_window
            .iter()
            .find(|s| s.is_gap())
            .map(|s| s.seq)
            .unwrap_or_else(|| self.input_window.next_expected());
        debug!(seq, "nak");
        self.queue(OutputPacket::empty(PacketType::Nak, seq));
    }

    fn rx_open_file(&mut self) -> io::Result<()> {
        let policy = self.rx_attrs.access.unwrap_or(self.cfg.access);
        let dir = self.download_dir.clone();
        let mut path = dir.join(&self.rx_name);
        let file = match policy {
            AccessPolicy::Append if path.exists() => {
                fs::OpenOptions::new().append(true).open(&path)?
            }
            _ => {
                if path.exists() {
                    path = unique_path(&dir, &self.rx_name)?;
                }
                fs::File::create(&path)?
            }
        };
        info!(path = %path.display(), "writing file");
        self.progress.file_path = path.display().to_string();
        self.rx_path = Some(path);
        self.rx_file = Some(file);
        self.rx_opened = true;
        Ok(())
    }

    /// Open (or create) the same-named file and report how much of it we
    /// already hold; the sender seeks past it.
    fn rx_open_resend(&mut self) -> io::Result<u64> {
        let path = self.download_dir.join(&self.rx_name);
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let pos = file.seek(SeekFrom::End(0))?;
        info!(path = %path.display(), pos, "continuing interrupted file");
        self.progress.file_path = path.display().to_string();
        self.rx_bytes = pos;
        self.progress.bytes_transferred = pos;
        self.rx_path = Some(path);
        self.rx_file = Some(file);
        self.rx_opened = true;
        Ok(pos)
    }

    /// Close the file and apply the negotiated attributes.
    fn rx_finalize_file(&mut self) -> io::Result<()> {
        if let Some(file) = self.rx_file.take() {
            drop(file);
        }
        if let Some(path) = self.rx_path.clone() {
            #[cfg(unix)]
            if let Some(mode) = self.rx_attrs.mode {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o777))?;
            }
            if let Some(naive) = self.rx_attrs.mtime {
                if let Some(ts) = attributes::mtime_to_unix(naive) {
                    filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(ts, 0))?;
                }
            }
        }
        Ok(())
    }

    fn rx_reset_file(&mut self) {
        self.rx_file = None;
        self.rx_path = None;
        self.rx_opened = false;
        self.rx_bytes = 0;
        self.rx_name = String::new();
        self.rx_attrs = FileAttributes::default();
        self.skip_requested = false;
    }
}
