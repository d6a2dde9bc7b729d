//! Session driver
//!
//! One [`Transfer`] value owns everything a transfer needs: the three
//! parameter sets, both window rings, the reassembly buffer and the open
//! file handle. The host's event loop feeds channel bytes into
//! [`Transfer::pump`] and writes whatever comes back; the engine itself
//! never blocks and never touches the channel.

mod receiver;
mod sender;

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Instant;

use bytes::BytesMut;
use chrono::Local;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::progress::{Cue, FinishReason, TransferMonitor, TransferProgress, TransferState};
use crate::protocol::attributes::FileAttributes;
use crate::protocol::checksum::BlockCheck;
use crate::protocol::codec::Quoting;
use crate::protocol::packet::{self, FrameParams, InputPacket, OutputPacket, PacketType, Parsed};
use crate::protocol::params::{Negotiated, SessionParameters, TransferConfig};
use crate::protocol::window::{Window, WindowSlot};
use crate::protocol::ETX;

/// Reassembly buffer bound; anything past two maximum frames is noise.
const REASSEMBLY_LIMIT: usize = 2 * 10_240;

/// One entry in the queue of packets waiting for output-buffer space.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Serialize on emission and record in the output window
    Packet(OutputPacket),
    /// Already-serialized bytes, replayed verbatim
    Raw(Vec<u8>),
}

/// Which side of the protocol this transfer drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Sender,
    Receiver,
}

/// One entry of the upload list.
#[derive(Debug, Clone)]
pub struct SendFile {
    /// Where to read the bytes from
    pub path: PathBuf,
    /// Name offered to the peer
    pub name: String,
    /// Declared size in bytes
    pub size: u64,
    /// Modification time as a unix timestamp
    pub mtime: i64,
    /// POSIX permission bits
    pub mode: u32,
}

impl SendFile {
    /// Build an entry from filesystem metadata.
    pub fn from_path(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let meta = fs::metadata(&path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::MetadataExt;
            meta.mode() & 0o777
        };
        #[cfg(not(unix))]
        let mode = 0o644;
        Ok(Self {
            path,
            name,
            size: meta.len(),
            mtime,
            mode,
        })
    }
}

/// A single Kermit transfer, sender or receiver side.
pub struct Transfer {
    role: Role,
    pub(crate) state: TransferState,
    pub(crate) cfg: TransferConfig,
    monitor: Box<dyn TransferMonitor>,
    pub(crate) progress: TransferProgress,

    pub(crate) local: SessionParameters,
    pub(crate) remote: SessionParameters,
    pub(crate) session: Option<Negotiated>,
    pub(crate) check: BlockCheck,

    pub(crate) seq: u64,
    pub(crate) last_sent: u8,
    pub(crate) input_window: Window,
    pub(crate) output_window: Window,

    reassembly: BytesMut,
    pub(crate) pending: VecDeque<Outbound>,

    last_heard: Instant,
    strikes: u32,

    pub(crate) skip_requested: bool,

    // sender side
    pub(crate) files: Vec<SendFile>,
    pub(crate) file_index: usize,
    pub(crate) reader: Option<fs::File>,
    pub(crate) read_total: u64,
    pub(crate) stage: Vec<u8>,
    pub(crate) source_eof: bool,

    // receiver side
    pub(crate) download_dir: PathBuf,
    pub(crate) rx_name: String,
    pub(crate) rx_file: Option<fs::File>,
    pub(crate) rx_path: Option<PathBuf>,
    pub(crate) rx_attrs: FileAttributes,
    pub(crate) rx_opened: bool,
    pub(crate) rx_bytes: u64,
}

impl Transfer {
    fn new(role: Role, cfg: TransferConfig) -> Self {
        let local = cfg.local_params();
        Self {
            role,
            state: TransferState::Init,
            monitor: Box::new(crate::progress::NullMonitor),
            progress: TransferProgress::default(),
            local,
            remote: SessionParameters::default(),
            session: None,
            check: BlockCheck::Check1,
            seq: 0,
            last_sent: 63,
            input_window: Window::new(1),
            output_window: Window::new(1),
            reassembly: BytesMut::with_capacity(4096),
            pending: VecDeque::new(),
            last_heard: Instant::now(),
            strikes: 0,
            skip_requested: false,
            files: Vec::new(),
            file_index: 0,
            reader: None,
            read_total: 0,
            stage: Vec::new(),
            source_eof: false,
            download_dir: PathBuf::new(),
            rx_name: String::new(),
            rx_file: None,
            rx_path: None,
            rx_attrs: FileAttributes::default(),
            rx_opened: false,
            rx_bytes: 0,
            cfg,
        }
    }

    /// Start a send transfer over the given file list.
    pub fn send(files: Vec<SendFile>, cfg: TransferConfig) -> Self {
        let mut t = Self::new(Role::Sender, cfg);
        t.files = files;
        t
    }

    /// Start a receive transfer writing under `download_dir`.
    pub fn receive(download_dir: impl Into<PathBuf>, cfg: TransferConfig) -> Self {
        let mut t = Self::new(Role::Receiver, cfg);
        t.download_dir = download_dir.into();
        t
    }

    /// Attach a progress monitor.
    pub fn with_monitor(mut self, monitor: Box<dyn TransferMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Current engine state.
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// True once the transfer reached a terminal state and nothing is left
    /// to flush onto the channel.
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal() && self.pending.is_empty()
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    /// Ask for the current file to be skipped; takes effect at the next
    /// packet boundary.
    pub fn skip_current_file(&mut self) {
        self.skip_requested = true;
    }

    /// Tear the transfer down. A partially received file is kept when
    /// `save_partial` is set and deleted otherwise.
    pub fn stop(&mut self, save_partial: bool) {
        if let Some(f) = self.rx_file.take() {
            drop(f);
            if !save_partial {
                if let Some(p) = &self.rx_path {
                    let _ = fs::remove_file(p);
                }
            }
        }
        self.reader = None;
        self.pending.clear();
        self.reassembly.clear();
        self.input_window.clear_slots();
        self.output_window.clear_slots();
        if !self.state.is_terminal() {
            info!("transfer stopped by caller");
            self.state = TransferState::Abort;
            self.progress.last_message = TransferError::Cancelled.to_string();
            self.progress.finished_at = Some(Local::now());
            self.monitor.transfer_finished(FinishReason::Abort);
        }
        self.sync_progress();
    }

    /// Drive the transfer: consume channel bytes, produce channel bytes.
    ///
    /// `input` holds whatever arrived since the last call (possibly
    /// nothing); the return value is how many bytes of `output` were
    /// filled. The call returns early once the output buffer cannot hold
    /// at least one more full packet.
    pub fn pump(&mut self, input: &[u8], output: &mut [u8]) -> usize {
        if self.is_finished() {
            return 0;
        }

        let mut input = input;

        // three ETX bytes at the head of the input cancel the transfer
        if input.len() >= 3 && input[..3] == [ETX; 3] && !self.state.is_terminal() {
            self.fail("Aborted by remote side");
            input = &[];
        }

        if self.state == TransferState::Init {
            match self.role {
                Role::Sender => {
                    debug!("opening session");
                    self.queue(OutputPacket::new(
                        PacketType::SendInit,
                        0,
                        self.local.to_send_init(),
                    ));
                    self.state = TransferState::SendInit;
                }
                Role::Receiver => {
                    // wake the remote sender; whatever was buffered before
                    // this point is prompt noise
                    debug!("waiting for session");
                    self.reassembly.clear();
                    input = &[];
                    self.queue(OutputPacket::empty(PacketType::Nak, 0));
                    self.state = TransferState::ReceiveInit;
                }
            }
        }

        if input.is_empty() {
            self.check_timeout();
        } else {
            self.last_heard = Instant::now();
            self.strikes = 0;
            if self.reassembly.len() + input.len() > REASSEMBLY_LIMIT {
                warn!(
                    buffered = self.reassembly.len(),
                    incoming = input.len(),
                    "reassembly overflow, dropping buffer"
                );
                self.reassembly.clear();
            }
            self.reassembly.extend_from_slice(input);
        }

        let mut written = 0;
        loop {
            if output.len() - written < self.free_space_needed() {
                break;
            }
            if let Some(ob) = self.pending.pop_front() {
                let n = self.emit(ob, &mut output[written..]);
                if n == 0 {
                    break;
                }
                written += n;
                continue;
            }
            if self.state.is_terminal() {
                break;
            }
            let fp = self.frame_params();
            match packet::parse(&mut self.reassembly, &fp) {
                Parsed::Packet(pkt) => {
                    self.strikes = 0;
                    self.dispatch(pkt);
                    continue;
                }
                Parsed::Corrupt(reason) => {
                    debug!(reason, "corrupt frame");
                    self.progress.retries += 1;
                    if self.role == Role::Receiver {
                        self.rx_nak_missing();
                    }
                    continue;
                }
                Parsed::Incomplete => {}
            }
            if self.role == Role::Sender
                && self.state == TransferState::SendData
                && self.tx_push_data()
            {
                continue;
            }
            break;
        }

        self.sync_progress();
        written
    }

    // ---- shared plumbing ----------------------------------------------

    pub(crate) fn wire_seq(&self) -> u8 {
        (self.seq & 0x3F) as u8
    }

    pub(crate) fn queue(&mut self, pkt: OutputPacket) {
        self.pending.push_back(Outbound::Packet(pkt));
    }

    pub(crate) fn queue_raw(&mut self, bytes: Vec<u8>) {
        self.pending.push_back(Outbound::Raw(bytes));
    }

    pub(crate) fn streaming(&self) -> bool {
        self.session.as_ref().map_or(false, |s| s.streaming)
    }

    pub(crate) fn windowed(&self) -> bool {
        self.session.as_ref().map_or(false, |s| s.windowing)
    }

    pub(crate) fn quoting(&self) -> Quoting {
        match &self.session {
            Some(s) => s.quoting(self.cfg.seven_bit),
            None => Quoting {
                qctl: self.local.qctl,
                qbin: b' ',
                rept: b' ',
                seven_bit: self.cfg.seven_bit,
                space_runs: false,
            },
        }
    }

    pub(crate) fn frame_params(&self) -> FrameParams {
        match &self.session {
            Some(s) => FrameParams {
                mark: s.params.mark,
                eol: s.params.eol,
                npad: s.params.pad_count,
                padc: s.params.pad_char,
                check: self.check,
                seven_bit: self.cfg.seven_bit,
                long_packets: s.long_packets,
                max_long_data: s.max_long_data,
                quoting: self.quoting(),
            },
            None => FrameParams {
                mark: self.local.mark,
                eol: self.local.eol,
                npad: 0,
                padc: 0,
                check: self.check,
                seven_bit: self.cfg.seven_bit,
                long_packets: false,
                max_long_data: 0,
                quoting: self.quoting(),
            },
        }
    }

    fn free_space_needed(&self) -> usize {
        let (payload, npad) = match &self.session {
            Some(s) if s.long_packets => (s.max_long_data, s.params.pad_count),
            Some(s) => (usize::from(s.params.max_len), s.params.pad_count),
            None => (94, 0),
        };
        payload + usize::from(npad) + 10
    }

    /// Adopt a negotiation result: check type switches over and both rings
    /// are rebuilt at the agreed size.
    pub(crate) fn adopt_session(&mut self, n: Negotiated) {
        self.check = n.check;
        self.input_window.resize(n.window_size as usize);
        self.output_window.resize(n.window_size as usize);
        self.session = Some(n);
    }

    fn emit(&mut self, ob: Outbound, out: &mut [u8]) -> usize {
        let bytes = match ob {
            Outbound::Raw(b) => b,
            Outbound::Packet(pkt) => {
                let fp = self.frame_params();
                let bytes = packet::serialize(&pkt, &fp);
                if pkt.ptype != PacketType::Nak {
                    self.output_window
                        .push(WindowSlot::new(pkt.seq, pkt.ptype, bytes.clone()));
                }
                self.last_sent = pkt.seq;
                bytes
            }
        };
        if bytes.len() > out.len() {
            self.pending.push_front(Outbound::Raw(bytes));
            return 0;
        }
        out[..bytes.len()].copy_from_slice(&bytes);
        bytes.len()
    }

    fn dispatch(&mut self, pkt: InputPacket) {
        if pkt.ptype == PacketType::Error {
            // a remote abort is not replied to
            let msg = String::from_utf8_lossy(&pkt.data).into_owned();
            warn!(message = %msg, "remote error");
            self.finish_abort(&TransferError::Remote(msg.clone()).to_string());
            self.progress.last_message = msg;
            return;
        }
        match self.role {
            Role::Sender => self.tx_dispatch(pkt),
            Role::Receiver => self.rx_dispatch(pkt),
        }
    }

    fn timeout_enabled(&self) -> bool {
        if self.state.is_terminal() || self.state == TransferState::Init {
            return false;
        }
        // streaming turns the clock off while data is moving
        if self.streaming()
            && matches!(
                self.state,
                TransferState::SendData | TransferState::ReceiveData
            )
        {
            return false;
        }
        true
    }

    fn timeout_seconds(&self) -> u64 {
        let secs = self
            .session
            .as_ref()
            .map(|s| s.params.timeout_seconds)
            .unwrap_or(self.local.timeout_seconds);
        u64::from(secs.max(1))
    }

    fn check_timeout(&mut self) {
        if !self.timeout_enabled() || self.last_heard.elapsed().as_secs() < self.timeout_seconds()
        {
            return;
        }
        self.last_heard = Instant::now();
        self.strikes += 1;
        self.progress.retries += 1;
        debug!(strike = self.strikes, "timeout");
        if self.strikes > self.cfg.timeout_max {
            self.fail("Too many timeouts");
            return;
        }
        match self.role {
            Role::Sender => self.tx_resend_oldest(),
            Role::Receiver => self.rx_nak_missing(),
        }
    }

    /// Abort locally: one best-effort Error packet, then the terminal state.
    pub(crate) fn fail(&mut self, msg: &str) {
        self.queue(OutputPacket::new(
            PacketType::Error,
            self.wire_seq(),
            msg.as_bytes().to_vec(),
        ));
        self.finish_abort(msg);
    }

    /// Enter the Abort state without emitting anything.
    pub(crate) fn finish_abort(&mut self, msg: &str) {
        warn!(reason = msg, "transfer aborted");
        self.progress.last_message = msg.to_string();
        self.progress.finished_at = Some(Local::now());
        self.state = TransferState::Abort;
        // partial receive files stay on disk
        self.rx_file = None;
        self.reader = None;
        self.monitor.transfer_finished(FinishReason::Abort);
    }

    /// Enter the Complete state and fire the success collaborators.
    pub(crate) fn finish_complete(&mut self, cue: Cue) {
        info!("transfer complete");
        self.progress.finished_at = Some(Local::now());
        self.state = TransferState::Complete;
        self.monitor.play_cue(cue);
        self.monitor.transfer_finished(FinishReason::End);
    }

    fn sync_progress(&mut self) {
        self.progress.state = self.state;
        self.monitor.on_update(&self.progress);
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn parse_all(bytes: &[u8], fp: &FrameParams) -> Vec<InputPacket> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Parsed::Packet(p) = packet::parse(&mut buf, fp) {
            out.push(p);
        }
        out
    }

    fn peer_frame(t: &Transfer, ptype: PacketType, seq: u8, data: Vec<u8>) -> Vec<u8> {
        packet::serialize(&OutputPacket::new(ptype, seq, data), &t.frame_params())
    }

    fn sender_with_file(len: usize, cfg: TransferConfig) -> (tempfile::TempDir, Transfer) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        fs::write(&path, data).unwrap();
        let file = SendFile {
            path,
            name: "src.bin".to_string(),
            size: len as u64,
            mtime: 1_000_000_000,
            mode: 0o644,
        };
        (dir, Transfer::send(vec![file], cfg))
    }

    /// Walk a windowed sender through the opening handshake into the data
    /// phase, returning the data packets of the first eager burst.
    fn drive_to_data(tx: &mut Transfer, out: &mut [u8]) -> Vec<InputPacket> {
        let n = tx.pump(&[], out);
        let pkts = parse_all(&out[..n], &tx.frame_params());
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].ptype, PacketType::SendInit);

        let echo = tx.local.to_send_init();
        let ack0 = peer_frame(tx, PacketType::Ack, 0, echo);
        let n = tx.pump(&ack0, out);
        let pkts = parse_all(&out[..n], &tx.frame_params());
        assert_eq!(pkts[0].ptype, PacketType::FileHeader);

        let ack1 = peer_frame(tx, PacketType::Ack, 1, Vec::new());
        let n = tx.pump(&ack1, out);
        let pkts = parse_all(&out[..n], &tx.frame_params());
        assert_eq!(pkts[0].ptype, PacketType::Attributes);

        let ack2 = peer_frame(tx, PacketType::Ack, 2, b"Y".to_vec());
        let n = tx.pump(&ack2, out);
        parse_all(&out[..n], &tx.frame_params())
    }

    #[test]
    fn test_nak_of_next_unsticks_a_full_window() {
        let cfg = TransferConfig {
            window_size: 4,
            long_packets: false,
            ..TransferConfig::default()
        };
        let (_dir, mut tx) = sender_with_file(400, cfg);
        let mut out = [0u8; 8192];

        // the eager burst fills the whole window: sequences 3..=6
        let burst = drive_to_data(&mut tx, &mut out);
        assert_eq!(burst.len(), 4);
        assert!(burst.iter().all(|p| p.ptype == PacketType::Data));
        assert_eq!(
            burst.iter().map(|p| p.seq).collect::<Vec<_>>(),
            vec![3, 4, 5, 6]
        );
        assert!(tx.output_window.is_full());

        // a NAK one past everything sent clears the window and the next
        // packet carries exactly that sequence
        let nak = peer_frame(&tx, PacketType::Nak, 7, Vec::new());
        let n = tx.pump(&nak, &mut out);
        let pkts = parse_all(&out[..n], &tx.frame_params());
        assert_eq!(pkts[0].ptype, PacketType::Data);
        assert_eq!(pkts[0].seq, 7);
    }

    #[test]
    fn test_nak_retransmits_verbatim() {
        let cfg = TransferConfig {
            window_size: 4,
            long_packets: false,
            ..TransferConfig::default()
        };
        let (_dir, mut tx) = sender_with_file(400, cfg);
        let mut big = [0u8; 8192];
        drive_to_data(&mut tx, &mut big);

        let original = tx
            .output_window
            .get(tx.output_window.find(4).unwrap())
            .unwrap()
            .data
            .clone();
        let nak = peer_frame(&tx, PacketType::Nak, 4, Vec::new());
        let n = tx.pump(&nak, &mut big);
        assert_eq!(&big[..n], &original[..]);
    }

    #[test]
    fn test_timeout_retransmits_then_aborts() {
        let cfg = TransferConfig {
            timeout_max: 2,
            ..TransferConfig::default()
        };
        let (_dir, mut tx) = sender_with_file(10, cfg);
        let mut out = [0u8; 4096];

        let n = tx.pump(&[], &mut out);
        let first = out[..n].to_vec();

        // two silent strikes replay the Send-Init verbatim
        for _ in 0..2 {
            tx.last_heard = Instant::now() - Duration::from_secs(60);
            let n = tx.pump(&[], &mut out);
            assert_eq!(&out[..n], &first[..]);
        }

        // the third strike is one too many
        tx.last_heard = Instant::now() - Duration::from_secs(60);
        let n = tx.pump(&[], &mut out);
        let pkts = parse_all(&out[..n], &tx.frame_params());
        assert_eq!(pkts[0].ptype, PacketType::Error);
        assert_eq!(pkts[0].data, b"Too many timeouts");
        assert_eq!(tx.state(), TransferState::Abort);
        assert_eq!(tx.pump(&[], &mut out), 0);
    }

    #[test]
    fn test_receiver_wakes_with_nak_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = Transfer::receive(dir.path(), TransferConfig::default());
        let mut out = [0u8; 1024];

        // whatever was buffered before the transfer started is noise
        let n = rx.pump(b"login: garbage\r\n", &mut out);
        let pkts = parse_all(&out[..n], &rx.frame_params());
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].ptype, PacketType::Nak);
        assert_eq!(pkts[0].seq, 0);
        assert_eq!(rx.state(), TransferState::ReceiveInit);
    }

    #[test]
    fn test_three_etx_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = Transfer::receive(dir.path(), TransferConfig::default());
        let mut out = [0u8; 1024];
        rx.pump(&[], &mut out);

        let n = rx.pump(&[ETX, ETX, ETX], &mut out);
        let pkts = parse_all(&out[..n], &rx.frame_params());
        assert_eq!(pkts[0].ptype, PacketType::Error);
        assert_eq!(pkts[0].data, b"Aborted by remote side");
        assert_eq!(rx.state(), TransferState::Abort);
        assert_eq!(rx.pump(&[], &mut out), 0);
    }

    #[test]
    fn test_stop_discards_partial() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = Transfer::receive(dir.path(), TransferConfig::default());
        let partial = dir.path().join("half.bin");
        fs::write(&partial, b"partial").unwrap();
        rx.rx_path = Some(partial.clone());
        rx.rx_file = Some(fs::OpenOptions::new().write(true).open(&partial).unwrap());

        rx.stop(false);
        assert!(!partial.exists());
        assert_eq!(rx.state(), TransferState::Abort);
    }

    #[test]
    fn test_send_file_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listed.txt");
        fs::write(&path, b"12345").unwrap();
        let entry = SendFile::from_path(&path).unwrap();
        assert_eq!(entry.name, "listed.txt");
        assert_eq!(entry.size, 5);
        assert!(entry.mtime > 0);
    }
}
