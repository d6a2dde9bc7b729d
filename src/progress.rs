//! Progress reporting and host callbacks
//!
//! The engine never draws UI, plays audio or decides what happens after a
//! transfer ends; it writes a [`TransferProgress`] snapshot and notifies an
//! injected [`TransferMonitor`]. Hosts that do not care pass [`NullMonitor`].

use chrono::{DateTime, Local};

/// Where a transfer currently stands.
///
/// Sender transfers walk `Init → SendInit → SendFile → (SendAttributes) →
/// SendData → SendEof → …` per file and end at `SendBreak`; receivers walk
/// `Init → ReceiveInit → ReceiveFile → ReceiveData` and return to
/// `ReceiveFile` between files. `Complete` and `Abort` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Created, nothing on the wire yet
    Init,
    /// Send-Init sent, waiting for the parameter acknowledgement
    SendInit,
    /// File header sent
    SendFile,
    /// Attributes sent
    SendAttributes,
    /// Moving file data
    SendData,
    /// End-of-file sent, draining acknowledgements
    SendEof,
    /// End-of-transmission sent
    SendBreak,
    /// Waiting for the peer's Send-Init
    ReceiveInit,
    /// Waiting for a file header (or the end of the batch)
    ReceiveFile,
    /// Receiving file data
    ReceiveData,
    /// Batch finished cleanly
    Complete,
    /// Transfer failed or was cancelled
    Abort,
}

impl TransferState {
    /// True once no further wire activity will happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Abort)
    }
}

/// Success chime selector for the host's audio collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    /// A send batch completed
    Upload,
    /// A receive batch completed
    Download,
}

/// How the transfer ended, for the host's outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Clean end of transmission
    End,
    /// Error, timeout or cancellation
    Abort,
}

/// Snapshot of transfer statistics, kept current by the session driver.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Engine state
    pub state: TransferState,
    /// Current file name
    pub file_name: String,
    /// Full path of the file being written or read
    pub file_path: String,
    /// Declared size of the current file, 0 when unknown
    pub file_size: u64,
    /// Bytes moved for the current file
    pub bytes_transferred: u64,
    /// Data packets exchanged for the current file
    pub blocks: u64,
    /// Retransmissions, NAKs and timeout strikes seen so far
    pub retries: u32,
    /// Last diagnostic or status message
    pub last_message: String,
    /// When the current file started
    pub started_at: Option<DateTime<Local>>,
    /// When the batch finished, either way
    pub finished_at: Option<DateTime<Local>>,
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self {
            state: TransferState::Init,
            file_name: String::new(),
            file_path: String::new(),
            file_size: 0,
            bytes_transferred: 0,
            blocks: 0,
            retries: 0,
            last_message: String::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

impl TransferProgress {
    /// Percentage complete for the current file.
    pub fn percent(&self) -> f32 {
        if self.file_size == 0 {
            0.0
        } else {
            (self.bytes_transferred as f32 / self.file_size as f32) * 100.0
        }
    }
}

/// Host-side observer for progress, cues and termination.
///
/// All methods have empty defaults so implementors pick what they need.
pub trait TransferMonitor {
    /// Called at the end of every `pump` with the current snapshot.
    fn on_update(&mut self, _progress: &TransferProgress) {}

    /// Called exactly once on a clean completion, never on abort.
    fn play_cue(&mut self, _cue: Cue) {}

    /// Called when the transfer reaches a terminal state.
    fn transfer_finished(&mut self, _reason: FinishReason) {}
}

/// A monitor that ignores everything.
#[derive(Debug, Default)]
pub struct NullMonitor;

impl TransferMonitor for NullMonitor {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        let mut p = TransferProgress {
            file_size: 200,
            bytes_transferred: 50,
            ..TransferProgress::default()
        };
        assert!((p.percent() - 25.0).abs() < f32::EPSILON);
        p.file_size = 0;
        assert!((p.percent() - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransferState::Complete.is_terminal());
        assert!(TransferState::Abort.is_terminal());
        assert!(!TransferState::ReceiveData.is_terminal());
    }
}
